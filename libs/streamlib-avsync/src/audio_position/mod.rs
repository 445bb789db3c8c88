// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Audio presentation position derived from device feedback.
//!
//! The sink is fed PCM whose source timestamps are known at write time. The
//! tracker pairs a written frame count with its source timestamp (the
//! *reference*), then follows the device's rendering progress to report which
//! source instant is audible now. Two strategies exist:
//!
//! - [`ByTimestamp`]: device `(frames, time)` samples, preferred.
//! - [`ByHeadPosition`]: head position minus a static latency estimate, used
//!   once a device stops reporting timestamps.
//!
//! Samples are noisy, so a new reference that disagrees slightly with the
//! current one is only kept as a *check reference* and compared later, while
//! a large disagreement means the source itself jumped.

mod by_head_position;
mod by_timestamp;

use crate::clocks::SharedClock;
use crate::io::{AudioSink, SinkFormat};

use by_head_position::ByHeadPosition;
use by_timestamp::ByTimestamp;

pub(crate) const DRIFT_MAX_US: i64 = 100_000;
pub(crate) const DRIFT_TOLERANCE_US: i64 = 40_000;
pub(crate) const DRIFT_ADJUSTMENT_US: i64 = 10_000;

const DEFAULT_SAMPLE_RATE: i64 = 48_000;
const DEFAULT_CHANNEL_COUNT: i64 = 2;

/// A frame count paired with the source timestamp it corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FramePoint {
    pub frames: i64,
    pub timestamp_us: i64,
}

/// Reference state shared by both strategies.
#[derive(Debug)]
pub(crate) struct References {
    pub reference: Option<FramePoint>,
    pub check: Option<FramePoint>,
    pub sample_rate: i64,
}

impl References {
    fn new() -> Self {
        Self {
            reference: None,
            check: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    pub fn frames_to_us(&self, frames: i64) -> i64 {
        frames * 1_000_000 / self.sample_rate
    }

    pub fn clear(&mut self) {
        self.reference = None;
        self.check = None;
    }
}

/// Extends a 32-bit device frame counter across wrap-arounds.
#[derive(Debug, Default)]
pub(crate) struct FrameUnwrapper {
    last_raw: u32,
    wrap_count: i64,
}

impl FrameUnwrapper {
    pub fn unwrap(&mut self, raw: u32) -> i64 {
        if raw < self.last_raw {
            self.wrap_count += 1;
            tracing::debug!(
                "frame counter wrap around, last:{} next:{}, wrap_count:{}",
                self.last_raw,
                raw,
                self.wrap_count
            );
        }
        self.last_raw = raw;
        (self.wrap_count << 32) | raw as i64
    }
}

/// Position strategy driven by [`AudioPositionTracker`].
pub(crate) trait Tracker {
    /// Full reset, including the shared references when the strategy owns them.
    fn reset(&mut self, refs: &mut References);

    fn is_broken(&self, now_ms: i64) -> bool;

    fn update_position(&mut self, refs: &mut References, sink: &mut dyn AudioSink, now_ms: i64);

    fn is_position_valid(&self) -> bool;

    fn position_us(&self, now_ms: i64) -> i64;

    fn accuracy_us(&self) -> i64;

    fn suspend(&mut self);

    /// Restart tracking from the current references.
    fn resume(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    ByTimestamp,
    ByHeadPosition,
}

enum ActiveTracker {
    ByTimestamp(ByTimestamp),
    ByHeadPosition(ByHeadPosition),
}

impl ActiveTracker {
    fn get(&self) -> &dyn Tracker {
        match self {
            ActiveTracker::ByTimestamp(t) => t,
            ActiveTracker::ByHeadPosition(t) => t,
        }
    }

    fn get_mut(&mut self) -> &mut dyn Tracker {
        match self {
            ActiveTracker::ByTimestamp(t) => t,
            ActiveTracker::ByHeadPosition(t) => t,
        }
    }

    fn kind(&self) -> TrackerKind {
        match self {
            ActiveTracker::ByTimestamp(_) => TrackerKind::ByTimestamp,
            ActiveTracker::ByHeadPosition(_) => TrackerKind::ByHeadPosition,
        }
    }
}

pub struct AudioPositionTracker {
    id: String,
    wall: SharedClock,
    channel_count: i64,
    latency_us: i64,
    refs: References,
    tracker: ActiveTracker,
}

impl AudioPositionTracker {
    pub fn new(id: impl Into<String>, wall: SharedClock) -> Self {
        let id = id.into();
        Self {
            tracker: ActiveTracker::ByTimestamp(ByTimestamp::new(id.clone())),
            id,
            wall,
            channel_count: DEFAULT_CHANNEL_COUNT,
            latency_us: 0,
            refs: References::new(),
        }
    }

    /// Bind to a (re)configured sink: forget everything and start over with
    /// timestamp tracking.
    pub fn set_audio_sink(&mut self, sink: &dyn AudioSink, format: &SinkFormat) {
        self.refs = References::new();
        if format.sample_rate > 0 {
            self.refs.sample_rate = format.sample_rate as i64;
        }
        self.channel_count = if format.channel_count > 0 {
            format.channel_count as i64
        } else {
            DEFAULT_CHANNEL_COUNT
        };
        self.latency_us = sink.latency_us();
        self.tracker = ActiveTracker::ByTimestamp(ByTimestamp::new(self.id.clone()));
        tracing::debug!(
            "[{}] audio position tracking {}Hz {}ch latency:{}us",
            self.id,
            self.refs.sample_rate,
            self.channel_count,
            self.latency_us
        );
    }

    pub fn kind(&self) -> TrackerKind {
        self.tracker.kind()
    }

    /// Current reference as `(frames, timestamp_us)`.
    pub fn reference(&self) -> Option<(i64, i64)> {
        self.refs.reference.map(|r| (r.frames, r.timestamp_us))
    }

    /// Pending check reference as `(frames, timestamp_us)`.
    pub fn check_reference(&self) -> Option<(i64, i64)> {
        self.refs.check.map(|r| (r.frames, r.timestamp_us))
    }

    pub fn update_reference_in_frames(&mut self, frames: i64, timestamp_us: i64) {
        let sample = FramePoint {
            frames,
            timestamp_us,
        };
        let Some(reference) = self.refs.reference else {
            self.refs.reference = Some(sample);
            return;
        };
        if self.refs.check.is_some() {
            return;
        }
        if frames == reference.frames || timestamp_us == reference.timestamp_us {
            return;
        }

        let delta_frames_us = self.refs.frames_to_us(frames - reference.frames);
        let divergence_us = (timestamp_us - reference.timestamp_us) - delta_frames_us;
        if divergence_us.abs() >= DRIFT_MAX_US {
            tracing::info!(
                "[{}] drift in source ({}us), reset reference and tracker",
                self.id,
                divergence_us
            );
            self.tracker.get_mut().reset(&mut self.refs);
            self.refs.reference = Some(sample);
        } else {
            self.refs.check = Some(sample);
        }
    }

    pub fn update_reference_in_bytes(&mut self, bytes: i64, timestamp_us: i64) {
        self.update_reference_in_frames(bytes / self.channel_count / 2, timestamp_us);
    }

    /// Poll the device. Demotes to head-position tracking once timestamps
    /// stop arriving.
    pub fn update_position(&mut self, sink: &mut dyn AudioSink) {
        let now_ms = self.wall.now_ms();
        if self.tracker.get().is_broken(now_ms) {
            tracing::warn!(
                "[{}] no more timestamp available, use playback head position algorithm",
                self.id
            );
            self.tracker = ActiveTracker::ByHeadPosition(ByHeadPosition::new(
                self.id.clone(),
                self.latency_us,
            ));
        }
        self.tracker.get_mut().update_position(&mut self.refs, sink, now_ms);
    }

    pub fn is_position_valid(&self) -> bool {
        self.tracker.get().is_position_valid()
    }

    pub fn position_us(&self) -> i64 {
        self.tracker.get().position_us(self.wall.now_ms())
    }

    pub fn position_accuracy_us(&self) -> i64 {
        self.tracker.get().accuracy_us()
    }

    pub fn suspend(&mut self) {
        self.tracker.get_mut().suspend();
    }

    pub fn resume(&mut self) {
        self.tracker.get_mut().resume();
    }

    /// The sink was flushed: written frame counts restart from zero.
    pub fn stop(&mut self) {
        self.tracker.get_mut().reset(&mut self.refs);
        self.refs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::{Clock, ManualClock};
    use crate::testing::FakeAudioSink;
    use std::sync::Arc;

    const FORMAT: SinkFormat = SinkFormat {
        sample_rate: 48_000,
        channel_count: 2,
    };

    fn tracker() -> (ManualClock, FakeAudioSink, AudioPositionTracker) {
        let wall = ManualClock::starting_at_ms(1_000);
        let sink = FakeAudioSink::new();
        let mut tracker = AudioPositionTracker::new("test", Arc::new(wall.clone()));
        tracker.set_audio_sink(&sink, &FORMAT);
        (wall, sink, tracker)
    }

    #[test]
    fn test_first_sample_becomes_reference() {
        let (_wall, _sink, mut t) = tracker();
        t.update_reference_in_frames(0, 2_000_000);
        assert_eq!(t.reference(), Some((0, 2_000_000)));
        assert_eq!(t.check_reference(), None);
    }

    #[test]
    fn test_consistent_sample_becomes_check_reference() {
        let (_wall, _sink, mut t) = tracker();
        t.update_reference_in_frames(0, 2_000_000);
        t.update_reference_in_frames(4_800, 2_120_000);
        assert_eq!(t.reference(), Some((0, 2_000_000)));
        assert_eq!(t.check_reference(), Some((4_800, 2_120_000)));

        // Ignored while a check reference is pending.
        t.update_reference_in_frames(9_600, 9_000_000);
        assert_eq!(t.reference(), Some((0, 2_000_000)));
    }

    #[test]
    fn test_divergent_sample_resets_immediately() {
        let (_wall, _sink, mut t) = tracker();
        t.update_reference_in_frames(0, 1_000_000);
        t.update_reference_in_frames(48_000, 2_150_000);
        assert_eq!(t.reference(), Some((48_000, 2_150_000)));
        assert_eq!(t.check_reference(), None);
    }

    #[test]
    fn test_duplicate_sample_is_ignored() {
        let (_wall, _sink, mut t) = tracker();
        t.update_reference_in_frames(100, 1_000_000);
        t.update_reference_in_frames(100, 5_000_000);
        assert_eq!(t.check_reference(), None);
    }

    #[test]
    fn test_bytes_are_converted_to_frames() {
        let (_wall, _sink, mut t) = tracker();
        t.update_reference_in_bytes(0, 0);
        t.update_reference_in_bytes(19_200, 100_000);
        assert_eq!(t.check_reference(), Some((4_800, 100_000)));
    }

    #[test]
    fn test_converges_to_source_timeline() {
        let (wall, sink, mut t) = tracker();
        sink.set_manual_timestamps(true);
        t.update_reference_in_frames(0, 1_000_000);

        let start_ns = wall.now_ns();
        for _ in 0..20 {
            wall.advance_ms(10);
            let elapsed_ns = wall.now_ns() - start_ns;
            sink.set_timestamp((elapsed_ns * 48 / 1_000_000) as u32, wall.now_ns());
            let mut device = sink.clone();
            t.update_position(&mut device);
        }

        assert!(t.is_position_valid());
        assert_eq!(t.kind(), TrackerKind::ByTimestamp);
        let expected = 1_000_000 + (wall.now_ns() - start_ns) / 1_000;
        let error = (t.position_us() - expected).abs();
        assert!(error <= 2_000, "position off by {}us", error);
        assert_eq!(t.position_accuracy_us(), 20_000);
    }

    #[test]
    fn test_demotes_to_head_position_without_timestamps() {
        let (wall, sink, mut t) = tracker();
        sink.set_manual_timestamps(true);
        t.update_reference_in_frames(0, 0);

        let mut device = sink.clone();
        sink.set_timestamp(0, wall.now_ns());
        t.update_position(&mut device);
        sink.clear_timestamp();
        for _ in 0..150 {
            wall.advance_ms(10);
            t.update_position(&mut device);
        }
        assert_eq!(t.kind(), TrackerKind::ByHeadPosition);

        sink.set_head_position(48_000);
        t.update_position(&mut device);
        assert!(t.is_position_valid());
        assert_eq!(t.position_us(), 1_000_000);

        // Only a new sink brings timestamps back.
        t.stop();
        assert_eq!(t.kind(), TrackerKind::ByHeadPosition);
        t.set_audio_sink(&sink, &FORMAT);
        assert_eq!(t.kind(), TrackerKind::ByTimestamp);
    }

    #[test]
    fn test_stop_clears_references() {
        let (_wall, _sink, mut t) = tracker();
        t.update_reference_in_frames(0, 0);
        t.stop();
        assert_eq!(t.reference(), None);
        assert!(!t.is_position_valid());
    }

    #[test]
    fn test_unwrapper_extends_counter() {
        let mut unwrapper = FrameUnwrapper::default();
        assert_eq!(unwrapper.unwrap(u32::MAX - 1), (u32::MAX - 1) as i64);
        assert_eq!(unwrapper.unwrap(5), (1i64 << 32) | 5);
    }
}
