// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use streamlib_avsync::io::SinkFormat;
use streamlib_avsync::testing::{FakeAudioSink, ManualClock};
use streamlib_avsync::{AudioPositionTracker, Clock, TrackerKind};

const FORMAT: SinkFormat = SinkFormat {
    sample_rate: 48_000,
    channel_count: 2,
};

/// Device reporting a timestamp every 10ms for 48kHz playback that started
/// at `start_ns`.
fn play(
    wall: &ManualClock,
    sink: &FakeAudioSink,
    tracker: &mut AudioPositionTracker,
    start_ns: i64,
    steps: usize,
) {
    let mut device = sink.clone();
    for _ in 0..steps {
        wall.advance_ms(10);
        let elapsed_ns = wall.now_ns() - start_ns;
        sink.set_timestamp((elapsed_ns * 48 / 1_000_000) as u32, wall.now_ns());
        tracker.update_position(&mut device);
    }
}

fn setup() -> (ManualClock, FakeAudioSink, AudioPositionTracker) {
    let wall = ManualClock::starting_at_ms(5_000);
    let sink = FakeAudioSink::new();
    sink.set_manual_timestamps(true);
    let mut tracker = AudioPositionTracker::new("it", Arc::new(wall.clone()));
    tracker.set_audio_sink(&sink, &FORMAT);
    (wall, sink, tracker)
}

#[test]
fn test_position_follows_source_timestamps() {
    let (wall, sink, mut tracker) = setup();
    let start_ns = wall.now_ns();
    tracker.update_reference_in_frames(0, 12_000_000);
    assert!(!tracker.is_position_valid());

    play(&wall, &sink, &mut tracker, start_ns, 30);

    assert!(tracker.is_position_valid());
    assert_eq!(tracker.kind(), TrackerKind::ByTimestamp);
    let expected_us = 12_000_000 + (wall.now_ns() - start_ns) / 1_000;
    let error_us = (tracker.position_us() - expected_us).abs();
    assert!(error_us <= 2_000, "position off by {}us", error_us);
}

#[test]
fn test_source_jump_replaces_reference() {
    let (wall, sink, mut tracker) = setup();
    let start_ns = wall.now_ns();
    tracker.update_reference_in_frames(0, 0);
    play(&wall, &sink, &mut tracker, start_ns, 30);
    assert!(tracker.is_position_valid());

    // One second of frames written, but the source moved 1.15s.
    tracker.update_reference_in_frames(48_000, 1_150_000);
    assert_eq!(tracker.reference(), Some((48_000, 1_150_000)));
    assert_eq!(tracker.check_reference(), None, "no gradual correction");
}

#[test]
fn test_flushed_sink_starts_over() {
    let (wall, sink, mut tracker) = setup();
    let start_ns = wall.now_ns();
    tracker.update_reference_in_frames(0, 0);
    play(&wall, &sink, &mut tracker, start_ns, 10);

    tracker.stop();
    assert_eq!(tracker.reference(), None);
    assert!(!tracker.is_position_valid());
}
