// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use streamlib_avsync::io::BufferFlags;
use streamlib_avsync::testing::{
    FakeAudioSink, FakeCapabilities, FakeDecoder, ManualClock, RecordingEventSink,
};
use streamlib_avsync::{
    BoundedInputQueue, InputBuffer, MediaFormat, RendererKind, RendererScheduler, SyncConfig,
    SyncContext, select_renderer,
};

/// Benchmark: one scheduler tick during 1x video playback
///
/// Every iteration feeds one key frame and advances the wall clock by a
/// frame period, so the tick does the full queue/decode/render cycle.
fn bench_playback_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_tick");

    group.bench_function("playback_video", |b| {
        let wall = ManualClock::starting_at_ms(0);
        let ctx = SyncContext::new(
            SyncConfig::default().with_instance_id("bench"),
            Arc::new(wall.clone()),
            FakeCapabilities::new(false, false).shared(),
            RecordingEventSink::new().shared(),
        )
        .unwrap();
        let video_decoder = FakeDecoder::new(16);
        video_decoder.set_loopback(true);
        let mut scheduler = RendererScheduler::new(
            &ctx,
            Box::new(video_decoder),
            Box::new(FakeDecoder::new(16)),
            Box::new(FakeAudioSink::new()),
        )
        .unwrap();

        let queue = BoundedInputQueue::shared(1024);
        scheduler.set_video_params(
            MediaFormat::video("video/avc", 1920, 1080),
            queue.clone(),
            None,
        );
        scheduler.prepare_start();
        scheduler.start_video();

        let mut pts = 0i64;
        b.iter(|| {
            let mut buffer = InputBuffer::new(vec![0; 512], pts);
            buffer.flags = BufferFlags::KEY_FRAME;
            // A full queue just means the decoder fell behind this iteration
            let _ = queue.push(buffer);
            pts += 40_000;

            black_box(scheduler.tick());
            wall.advance_ms(40);
        });
    });

    group.bench_function("idle", |b| {
        let ctx = SyncContext::with_defaults(SyncConfig::default()).unwrap();
        let mut scheduler = RendererScheduler::new(
            &ctx,
            Box::new(FakeDecoder::new(4)),
            Box::new(FakeDecoder::new(4)),
            Box::new(FakeAudioSink::new()),
        )
        .unwrap();

        b.iter(|| black_box(scheduler.tick()));
    });

    group.finish();
}

fn bench_select_renderer(c: &mut Criterion) {
    let config = SyncConfig::default();
    let speeds = [1.0, 0.5, 2.0, 4.0, -2.0, 0.0, 16.0];

    c.bench_function("select_renderer", |b| {
        b.iter(|| {
            for speed in speeds {
                black_box(select_renderer(
                    black_box(speed),
                    Some(RendererKind::Playback),
                    true,
                    &config,
                ));
            }
        });
    });
}

criterion_group!(benches, bench_playback_tick, bench_select_renderer);
criterion_main!(benches);
