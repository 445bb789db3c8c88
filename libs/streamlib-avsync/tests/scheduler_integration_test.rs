// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::time::{Duration, Instant};

use streamlib_avsync::io::{BufferFlags, DecoderEvent};
use streamlib_avsync::testing::{
    FakeAudioSink, FakeCapabilities, FakeDecoder, ManualClock, RecordingEventSink,
};
use streamlib_avsync::{
    BoundedInputQueue, ChannelEventSink, InputBuffer, MediaFormat, MediaOutputPath, PlaybackEvent,
    RendererKind, RendererScheduler, SchedulerCommand, SoftwareClock, SyncConfig, SyncContext,
    TickLoop, TrackKind, VideoTrickMode,
};

struct Player {
    wall: ManualClock,
    video_decoder: FakeDecoder,
    events: RecordingEventSink,
    video_queue: Arc<BoundedInputQueue>,
    scheduler: RendererScheduler,
}

fn player(config: SyncConfig) -> Player {
    let wall = ManualClock::starting_at_ms(50_000);
    let events = RecordingEventSink::new();
    let ctx = SyncContext::new(
        config,
        Arc::new(wall.clone()),
        FakeCapabilities::new(false, true).shared(),
        events.shared(),
    )
    .expect("valid config");

    let video_decoder = FakeDecoder::new(8);
    video_decoder.set_loopback(true);
    let mut scheduler = RendererScheduler::new(
        &ctx,
        Box::new(video_decoder.clone()),
        Box::new(FakeDecoder::new(8)),
        Box::new(FakeAudioSink::new()),
    )
    .expect("scheduler");

    let video_queue = BoundedInputQueue::shared(64);
    scheduler.set_video_params(
        MediaFormat::video("video/hevc", 3840, 2160),
        video_queue.clone(),
        None,
    );
    scheduler.prepare_start();
    scheduler.start_video();

    Player {
        wall,
        video_decoder,
        events,
        video_queue,
        scheduler,
    }
}

fn key_frames(queue: &BoundedInputQueue, timestamps: impl IntoIterator<Item = i64>) {
    for ts in timestamps {
        let mut buffer = InputBuffer::new(vec![0; 256], ts);
        buffer.flags = BufferFlags::KEY_FRAME;
        queue.push(buffer).expect("queue has room");
    }
}

impl Player {
    fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.scheduler.tick();
            self.wall.advance_ms(10);
        }
    }

    fn switches(&self) -> Vec<RendererKind> {
        self.events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PlaybackEvent::RendererChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn test_speed_changes_select_strategies() {
    let mut p = player(SyncConfig::default());
    key_frames(&p.video_queue, (0..16).map(|i| i * 40_000));
    p.run(3);

    for speed in [2.0, 0.0, 1.0] {
        p.scheduler.set_speed(speed).unwrap();
        p.run(3);
    }
    assert_eq!(
        p.switches(),
        vec![
            RendererKind::Playback,
            RendererKind::TrickSmooth,
            RendererKind::Playback
        ],
        "pausing keeps the current strategy"
    );
    assert_eq!(p.video_decoder.trick_mode().0, VideoTrickMode::None);
}

#[test]
fn test_fast_forward_steps_by_seek() {
    let mut p = player(SyncConfig::default());
    p.scheduler.set_position_us(30_000_000);
    p.scheduler.set_speed(8.0).unwrap();
    assert_eq!(p.scheduler.current_renderer(), Some(RendererKind::TrickBySeek));
    p.run(2);

    let requested = p.events.count(|e| {
        matches!(
            e,
            PlaybackEvent::PositionRequested {
                position_us: 30_000_000
            }
        )
    });
    assert_eq!(requested, 1, "the feeder is asked for the anchor position");
}

#[test]
fn test_audio_only_fast_forward_is_virtual() {
    let wall = ManualClock::starting_at_ms(0);
    let ctx = SyncContext::new(
        SyncConfig::default(),
        Arc::new(wall.clone()),
        FakeCapabilities::new(false, false).shared(),
        RecordingEventSink::new().shared(),
    )
    .unwrap();
    let mut scheduler = RendererScheduler::new(
        &ctx,
        Box::new(FakeDecoder::new(4)),
        Box::new(FakeDecoder::new(4)),
        Box::new(FakeAudioSink::new()),
    )
    .unwrap();
    scheduler.set_audio_params(
        MediaFormat::audio("audio/mp4a-latm", 48_000, 2),
        BoundedInputQueue::shared(16),
        None,
    );
    scheduler.prepare_start();
    scheduler.start_audio();

    scheduler.set_speed(4.0).unwrap();
    assert_eq!(scheduler.current_renderer(), Some(RendererKind::TrickNoVideo));
}

#[test]
fn test_fatal_decoder_error_triggers_emergency_stop() {
    let mut p = player(SyncConfig::default());
    key_frames(&p.video_queue, (0..8).map(|i| i * 40_000));
    p.run(3);
    assert!(p.scheduler.is_ticking());

    p.video_decoder.post(DecoderEvent::Error {
        message: "hardware hang".into(),
        fatal: true,
    });
    p.run(1);

    assert!(!p.scheduler.is_ticking());
    assert_eq!(p.scheduler.speed(), 1.0);
    let stops: Vec<_> = p
        .events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PlaybackEvent::EmergencyStop { reason } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(stops.len(), 1);
    assert!(stops[0].contains("hardware hang"), "reason: {}", stops[0]);
}

#[test]
fn test_first_frame_events_reach_host() {
    let mut p = player(SyncConfig {
        pts_events_enabled: true,
        ..SyncConfig::default()
    });
    key_frames(&p.video_queue, (0..8).map(|i| i * 40_000));
    p.run(10);

    let first = p.events.count(|e| {
        matches!(
            e,
            PlaybackEvent::FirstFrameRendered {
                track: TrackKind::Video,
                ..
            }
        )
    });
    assert_eq!(first, 1);
    assert!(p.events.count(|e| matches!(e, PlaybackEvent::FirstDataPushed { .. })) >= 1);
    assert!(p.events.count(|e| matches!(e, PlaybackEvent::FrameRendered { .. })) >= 1);
}

#[test]
fn test_tick_loop_drives_playback() {
    let (sink, rx) = ChannelEventSink::new();
    let ctx = SyncContext::new(
        SyncConfig::default().with_instance_id("threaded"),
        Arc::new(SoftwareClock::new()),
        FakeCapabilities::new(false, false).shared(),
        Arc::new(sink),
    )
    .unwrap();
    let video_decoder = FakeDecoder::new(8);
    video_decoder.set_loopback(true);
    let scheduler = RendererScheduler::new(
        &ctx,
        Box::new(video_decoder),
        Box::new(FakeDecoder::new(8)),
        Box::new(FakeAudioSink::new()),
    )
    .unwrap();

    let queue = BoundedInputQueue::shared(32);
    key_frames(&queue, (0..8).map(|i| i * 40_000));

    let tick_loop = TickLoop::spawn(scheduler).unwrap();
    tick_loop.send(SchedulerCommand::PrepareStart).unwrap();
    tick_loop
        .send(SchedulerCommand::SetVideoParams {
            format: MediaFormat::video("video/avc", 1920, 1080),
            queue,
            descrambler: None,
        })
        .unwrap();
    tick_loop.send(SchedulerCommand::StartVideo).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut rendered = false;
    while !rendered && Instant::now() < deadline {
        if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
            rendered = matches!(
                event,
                PlaybackEvent::FirstFrameRendered {
                    track: TrackKind::Video,
                    ..
                }
            );
        }
    }
    assert!(rendered, "first video frame was rendered by the loop thread");

    let snapshot = tick_loop.snapshot().unwrap();
    assert!(snapshot.ticking);
    assert!(snapshot.first_video_frame_rendered);

    let mut scheduler = tick_loop.shutdown().unwrap();
    scheduler.release();
    assert!(!scheduler.is_ticking());
    assert!(!scheduler.video_path().has_media_format());
}
