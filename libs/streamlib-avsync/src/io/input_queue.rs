// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::decoder_events::BufferFlags;

/// One demultiplexed access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBuffer {
    pub payload: Vec<u8>,
    pub timestamp_us: i64,
    pub flags: BufferFlags,
}

impl InputBuffer {
    pub fn new(payload: Vec<u8>, timestamp_us: i64) -> Self {
        Self {
            payload,
            timestamp_us,
            flags: BufferFlags::empty(),
        }
    }
}

/// FIFO filled by the demux side and drained by an output path.
pub trait InputBufferQueue: Send + Sync {
    fn is_full(&self) -> bool;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Media duration currently queued.
    fn size_in_us(&self) -> i64;

    fn pop(&self) -> Option<InputBuffer>;

    fn clear(&self);
}

pub type SharedInputQueue = Arc<dyn InputBufferQueue>;

/// Mutex-guarded queue with a fixed buffer count.
pub struct BoundedInputQueue {
    capacity: usize,
    buffers: Mutex<VecDeque<InputBuffer>>,
}

impl BoundedInputQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    /// Append a buffer, handing it back when the queue is full.
    pub fn push(&self, buffer: InputBuffer) -> Result<(), InputBuffer> {
        let mut buffers = self.buffers.lock();
        if buffers.len() >= self.capacity {
            return Err(buffer);
        }
        buffers.push_back(buffer);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl InputBufferQueue for BoundedInputQueue {
    fn is_full(&self) -> bool {
        self.buffers.lock().len() >= self.capacity
    }

    fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }

    fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    fn size_in_us(&self) -> i64 {
        let buffers = self.buffers.lock();
        match (buffers.front(), buffers.back()) {
            (Some(first), Some(last)) => last.timestamp_us - first.timestamp_us,
            _ => 0,
        }
    }

    fn pop(&self) -> Option<InputBuffer> {
        self.buffers.lock().pop_front()
    }

    fn clear(&self) {
        self.buffers.lock().clear();
    }
}
