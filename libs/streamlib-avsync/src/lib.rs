// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Audio/video synchronization engine for decoder-driven playback.
//!
//! A [`RendererScheduler`] owns one video and one audio [output
//! path](output_path), selects a renderer strategy from the playback speed
//! (1x synchronized playback, passthrough, or one of the trick modes) and is
//! ticked cooperatively, either by the host or by a [`TickLoop`] thread.
//! Hardware decoders, the audio device, demux queues and capability probing
//! sit behind the traits in [`io`]. Deterministic fakes live in `testing`,
//! behind the `test-utils` feature.

// Re-export crossbeam_channel, hosts receive events and capability changes over it
pub use crossbeam_channel;

pub mod audio_position;
pub mod clocks;
pub mod config;
pub mod context;
pub mod error;
pub mod io;
pub mod logging;
pub mod media_clock;
pub mod output_path;
pub mod position_handler;
pub mod renderer;
pub mod scheduler;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod timestamp_keeper;

pub use audio_position::{AudioPositionTracker, TrackerKind};
pub use clocks::{Clock, SharedClock, SoftwareClock};
pub use config::{PlaybackMode, RetryConfig, SeekTrickMode, SpeedRange, SyncConfig};
pub use context::SyncContext;
pub use error::{AvSyncError, Result};
pub use io::{
    AudioSink, BoundedInputQueue, CapabilitySource, ChannelEventSink, DecoderError, DecoderSink,
    EventSink, InputBuffer, InputBufferQueue, MediaFormat, NullEventSink, PlaybackEvent,
    StaticCapabilities, TrackKind, VideoTrickMode,
};
pub use media_clock::MediaClock;
pub use output_path::{AudioOutputPath, MediaOutputPath, RenderingMode, VideoOutputPath};
pub use position_handler::PositionHandler;
pub use renderer::{RendererKind, ResetReason};
pub use scheduler::{
    RendererScheduler, SchedulerCommand, SchedulerSnapshot, TickLoop, select_renderer,
};
pub use timestamp_keeper::TimestampKeeper;
