// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Notifications delivered to the host.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::decoder::MediaFormat;
use super::TrackKind;
use crate::renderer::RendererKind;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    FormatChanged { track: TrackKind, format: MediaFormat },
    /// The first buffer of a track reached its decoder.
    FirstDataPushed { track: TrackKind },
    FirstFrameDecoded { track: TrackKind, timestamp_us: i64 },
    FirstFrameRendered { track: TrackKind, timestamp_us: i64 },
    /// Per-frame notification, only when PTS events are enabled.
    FrameRendered { track: TrackKind, timestamp_us: i64 },
    /// The feeder must seek to `position_us` before sending more data.
    PositionRequested { position_us: i64 },
    RendererChanged { from: Option<RendererKind>, to: RendererKind },
    /// Ticking stopped after an unrecoverable fault; `prepare_start` again.
    EmergencyStop { reason: String },
}

pub trait EventSink: Send + Sync {
    fn notify(&self, event: PlaybackEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn notify(&self, _event: PlaybackEvent) {}
}

/// Forwards events over a channel to a listener thread.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: Sender<PlaybackEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, Receiver<PlaybackEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn notify(&self, event: PlaybackEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event listener gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, rx) = ChannelEventSink::new();
        sink.notify(PlaybackEvent::PositionRequested { position_us: 1_000 });
        assert_eq!(
            rx.try_recv().ok(),
            Some(PlaybackEvent::PositionRequested { position_us: 1_000 })
        );
        drop(rx);
        sink.notify(PlaybackEvent::FirstDataPushed {
            track: TrackKind::Audio,
        });
    }
}
