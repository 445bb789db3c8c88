// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Decoder callbacks, marshalled onto the scheduler thread.
//!
//! Each configuration of a decoder opens a new session. Events are tagged with
//! the session that produced them and anything from an older session is dropped
//! when drained, so a flushed or reconfigured codec cannot leak stale buffers.

use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender};

use super::decoder::MediaFormat;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        const KEY_FRAME = 1;
        const CODEC_CONFIG = 1 << 1;
        const END_OF_STREAM = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBufferInfo {
    pub timestamp_us: i64,
    pub size: usize,
    pub flags: BufferFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    InputBufferAvailable(usize),
    OutputBufferAvailable { index: usize, info: OutputBufferInfo },
    OutputFormatChanged(MediaFormat),
    /// A tunneled decoder presented a frame on its own.
    FrameRendered { timestamp_us: i64 },
    Error { message: String, fatal: bool },
}

#[derive(Debug)]
struct TaggedEvent {
    session: u64,
    event: DecoderEvent,
}

/// Handle given to a decoder for posting its callbacks.
#[derive(Debug, Clone)]
pub struct DecoderEventSender {
    session: u64,
    tx: Sender<TaggedEvent>,
}

impl DecoderEventSender {
    /// Returns `false` once the owning output path is gone.
    pub fn send(&self, event: DecoderEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }

    pub fn session(&self) -> u64 {
        self.session
    }
}

pub(crate) struct DecoderEventChannel {
    session: u64,
    tx: Sender<TaggedEvent>,
    rx: Receiver<TaggedEvent>,
}

impl DecoderEventChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { session: 0, tx, rx }
    }

    /// Invalidate every event already posted and hand out a sender for the
    /// next decoder session.
    pub(crate) fn open_session(&mut self) -> DecoderEventSender {
        self.session += 1;
        DecoderEventSender {
            session: self.session,
            tx: self.tx.clone(),
        }
    }

    /// Invalidate pending events without opening a new session.
    pub(crate) fn close_session(&mut self) {
        self.session += 1;
    }

    pub(crate) fn drain(&self) -> Vec<DecoderEvent> {
        let mut stale = 0usize;
        let events: Vec<DecoderEvent> = self
            .rx
            .try_iter()
            .filter_map(|tagged| {
                if tagged.session == self.session {
                    Some(tagged.event)
                } else {
                    stale += 1;
                    None
                }
            })
            .collect();
        if stale > 0 {
            tracing::trace!("dropped {} decoder events from previous sessions", stale);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_session_events_are_dropped() {
        let mut channel = DecoderEventChannel::new();
        let old = channel.open_session();
        assert!(old.send(DecoderEvent::InputBufferAvailable(0)));

        let current = channel.open_session();
        old.send(DecoderEvent::InputBufferAvailable(1));
        current.send(DecoderEvent::InputBufferAvailable(2));

        assert_eq!(channel.drain(), vec![DecoderEvent::InputBufferAvailable(2)]);
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn test_close_session_discards_pending() {
        let mut channel = DecoderEventChannel::new();
        let sender = channel.open_session();
        sender.send(DecoderEvent::FrameRendered { timestamp_us: 40_000 });
        channel.close_session();
        assert!(channel.drain().is_empty());
    }
}
