// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Top-level coordinator of one playback instance.
//!
//! The scheduler owns both output paths and the position handler, picks the
//! renderer strategy for the current speed and ticks it. Decoder callbacks
//! and capability changes are drained at the start of every tick, so all
//! state is mutated from the single context calling [`RendererScheduler::tick`]
//! (usually a [`TickLoop`] thread).

mod tick_loop;

pub use tick_loop::{SchedulerCommand, TickLoop};

use crate::config::{PlaybackMode, SeekTrickMode, SyncConfig};
use crate::context::SyncContext;
use crate::error::{AvSyncError, Result};
use crate::io::{
    AudioSink, CapabilityWatch, DecoderSink, Descrambler, MediaFormat, PlaybackEvent,
    SharedInputQueue, TrackKind,
};
use crate::output_path::{AudioOutputPath, MediaOutputPath, PathNotice, VideoOutputPath};
use crate::position_handler::PositionHandler;
use crate::renderer::{
    PassthroughRenderer, PlaybackRenderer, RenderTargets, Renderer, RendererKind,
    RendererStrategy, ResetReason, TrickBySeekRenderer, TrickIOnlyRenderer, TrickNoVideoRenderer,
    TrickSmoothRenderer, speed_equals,
};

/// Delay of a tick that had no strategy to run.
const NO_RENDERER_DELAY_US: i64 = 10_000;

/// Strategy for `speed` given the current one and the tracks present.
pub fn select_renderer(
    speed: f64,
    current: Option<RendererKind>,
    has_video: bool,
    config: &SyncConfig,
) -> RendererKind {
    let playback = match config.playback_mode {
        PlaybackMode::Normal => RendererKind::Playback,
        PlaybackMode::Passthrough => RendererKind::Passthrough,
    };

    if speed_equals(speed, 1.0) {
        return playback;
    }
    if speed_equals(speed, 0.0) {
        return current.unwrap_or(playback);
    }
    if !has_video {
        return RendererKind::TrickNoVideo;
    }
    if speed > 0.0 && config.is_smooth_trick_speed(speed) {
        return RendererKind::TrickSmooth;
    }
    match config.seek_trick_mode {
        SeekTrickMode::BySeek => RendererKind::TrickBySeek,
        SeekTrickMode::IOnly => RendererKind::TrickIOnly,
    }
}

fn find_strategy(renderers: &mut [Renderer], kind: RendererKind) -> Option<&mut dyn RendererStrategy> {
    renderers
        .iter_mut()
        .find(|r| r.kind() == kind)
        .map(|r| r.strategy_mut())
}

/// Point-in-time view of a scheduler, for hosts and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSnapshot {
    pub renderer: Option<RendererKind>,
    pub speed: f64,
    pub position_us: i64,
    pub ticking: bool,
    pub video_started: bool,
    pub audio_started: bool,
    pub first_video_frame_rendered: bool,
    pub first_audio_frame_rendered: bool,
    pub last_error: Option<String>,
    pub stopped_by_error: bool,
}

pub struct RendererScheduler {
    id: String,
    config: SyncConfig,
    targets: RenderTargets,
    renderers: Vec<Renderer>,
    current: Option<RendererKind>,
    speed: f64,
    has_video: bool,
    has_audio: bool,
    video_started: bool,
    audio_started: bool,
    ticking: bool,
    first_video_frame_rendered: bool,
    first_audio_frame_rendered: bool,
    capability_watch: CapabilityWatch,
    last_error: Option<String>,
    /// Set by an emergency stop, cleared only by `prepare_start`.
    stopped_by_error: bool,
}

impl RendererScheduler {
    pub fn new(
        ctx: &SyncContext,
        video_decoder: Box<dyn DecoderSink>,
        audio_decoder: Box<dyn DecoderSink>,
        audio_sink: Box<dyn AudioSink>,
    ) -> Result<Self> {
        let config = ctx.config().clone();
        let id = config.instance_id.clone();
        let wall = ctx.wall();
        let capabilities = ctx.capabilities();
        let session_id = ctx.allocate_audio_session_id()?;

        let mut video = VideoOutputPath::new(video_decoder, wall.clone(), &config);
        let mut audio = AudioOutputPath::new(
            audio_decoder,
            audio_sink,
            capabilities.clone(),
            wall.clone(),
            &config,
        );
        video.set_audio_session_id(Some(session_id));
        audio.set_audio_session_id(Some(session_id));

        let playback = match config.playback_mode {
            PlaybackMode::Normal => Renderer::Playback(PlaybackRenderer::new(&id)),
            PlaybackMode::Passthrough => Renderer::Passthrough(PassthroughRenderer::new(&id)),
        };
        let renderers = vec![
            playback,
            Renderer::TrickSmooth(TrickSmoothRenderer::new(&id)),
            Renderer::TrickBySeek(TrickBySeekRenderer::new(&id)),
            Renderer::TrickNoVideo(TrickNoVideoRenderer::new(&id)),
            Renderer::TrickIOnly(TrickIOnlyRenderer::new(&id)),
        ];

        tracing::info!(
            "[{}] RendererScheduler created, mode:{:?}, audio session:{}",
            id,
            config.playback_mode,
            session_id
        );

        Ok(Self {
            targets: RenderTargets {
                id: id.clone(),
                video,
                audio,
                position: PositionHandler::new(id.clone(), wall.clone()),
                wall,
                capabilities: capabilities.clone(),
                events: ctx.events(),
            },
            capability_watch: CapabilityWatch::subscribe(capabilities.as_ref()),
            id,
            config,
            renderers,
            current: None,
            speed: 1.0,
            has_video: false,
            has_audio: false,
            video_started: false,
            audio_started: false,
            ticking: false,
            first_video_frame_rendered: false,
            first_audio_frame_rendered: false,
            last_error: None,
            stopped_by_error: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn current_renderer(&self) -> Option<RendererKind> {
        self.current
    }

    pub fn renderer(&self, kind: RendererKind) -> Option<&Renderer> {
        self.renderers.iter().find(|r| r.kind() == kind)
    }

    /// A track with a format is started, the host should keep ticking.
    pub fn is_ticking(&self) -> bool {
        self.ticking
    }

    /// An emergency stop happened and `prepare_start` has not been called since.
    pub fn is_stopped_by_error(&self) -> bool {
        self.stopped_by_error
    }

    pub fn video_path(&self) -> &VideoOutputPath {
        &self.targets.video
    }

    pub fn audio_path(&self) -> &AudioOutputPath {
        &self.targets.audio
    }

    /// Error that caused the last emergency stop.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapshot(&mut self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            renderer: self.current,
            speed: self.speed,
            position_us: self.targets.position.position_us(),
            ticking: self.ticking,
            video_started: self.video_started,
            audio_started: self.audio_started,
            first_video_frame_rendered: self.first_video_frame_rendered,
            first_audio_frame_rendered: self.first_audio_frame_rendered,
            last_error: self.last_error.clone(),
            stopped_by_error: self.stopped_by_error,
        }
    }

    fn playback_kind(&self) -> RendererKind {
        select_renderer(1.0, None, self.has_video, &self.config)
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    /// Back to 1x on the playback strategy, ready for the tracks to start.
    pub fn prepare_start(&mut self) {
        tracing::info!("[{}] Preparing start", self.id);
        self.speed = 1.0;
        self.last_error = None;
        self.stopped_by_error = false;
        let kind = self.playback_kind();
        let result = self.switch_to(kind);
        self.guard(result);
        self.update_ticking();
    }

    pub fn set_video_params(
        &mut self,
        format: MediaFormat,
        queue: SharedInputQueue,
        descrambler: Option<Descrambler>,
    ) {
        self.targets.video.set_params(format, queue, descrambler);
        self.has_video = true;
        self.update_ticking();
    }

    pub fn set_audio_params(
        &mut self,
        format: MediaFormat,
        queue: SharedInputQueue,
        descrambler: Option<Descrambler>,
    ) {
        self.targets.audio.set_params(format, queue, descrambler);
        self.has_audio = true;
        self.update_ticking();
    }

    pub fn start_video(&mut self) {
        tracing::info!("[{}] start video decoding", self.id);
        self.video_started = true;
        self.first_video_frame_rendered = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.start_video();
        }
        self.update_ticking();
    }

    pub fn stop_video(&mut self) {
        tracing::info!("[{}] stop video decoding", self.id);
        self.video_started = false;
        self.first_video_frame_rendered = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.stop_video();
        }
        self.stop_if_no_track_started();
        tracing::info!("[{}] reset VideoOutputPath", self.id);
        self.targets.video.reset();
        self.update_ticking();
    }

    pub fn pause_video(&mut self) {
        tracing::info!("[{}] pause video decoding", self.id);
        self.video_started = false;
        self.first_video_frame_rendered = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.stop_video();
        }
        self.update_ticking();
        // Tunneled hardware cannot hold video alone.
        if self.config.playback_mode == PlaybackMode::Passthrough {
            self.pause_audio();
        }
    }

    pub fn resume_video(&mut self) {
        tracing::info!("[{}] resume video decoding", self.id);
        self.video_started = true;
        self.first_video_frame_rendered = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.start_video();
        }
        self.update_ticking();
        if self.config.playback_mode == PlaybackMode::Passthrough {
            self.resume_audio();
        }
    }

    pub fn start_audio(&mut self) {
        tracing::info!("[{}] start audio decoding", self.id);
        self.audio_started = true;
        self.first_audio_frame_rendered = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.start_audio();
        }
        self.update_ticking();
    }

    pub fn stop_audio(&mut self) {
        tracing::info!("[{}] stop audio decoding", self.id);
        self.audio_started = false;
        self.first_audio_frame_rendered = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.stop_audio();
        }
        self.stop_if_no_track_started();
        self.targets.audio.reset();
        self.update_ticking();
    }

    pub fn pause_audio(&mut self) {
        tracing::info!("[{}] pause audio decoding", self.id);
        self.audio_started = false;
        self.first_audio_frame_rendered = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.stop_audio();
        }
        self.update_ticking();
        self.targets.audio.pause();
    }

    pub fn resume_audio(&mut self) {
        tracing::info!("[{}] resume audio decoding", self.id);
        self.audio_started = true;
        self.first_audio_frame_rendered = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.start_audio();
        }
        self.update_ticking();
        self.targets.audio.resume();
    }

    pub fn set_audio_volume(&mut self, volume: f32) {
        self.targets.audio.set_volume(volume);
    }

    pub fn set_audio_muted(&mut self, muted: bool) {
        self.targets.audio.set_muted(muted);
    }

    /// Changes below the speed threshold are ignored. Non-finite speeds are
    /// refused; any failure while switching strategy stops the scheduler.
    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        if !speed.is_finite() {
            return Err(AvSyncError::InvalidState(format!(
                "speed must be finite, got {}",
                speed
            )));
        }
        if self.stopped_by_error {
            return Err(AvSyncError::InvalidState(
                "stopped on error, prepare_start is required".to_string(),
            ));
        }
        if speed_equals(self.speed, speed) && self.current.is_some() {
            return Ok(());
        }
        self.speed = speed;
        let result = self.select_renderer_task();
        self.guard(result);
        Ok(())
    }

    /// Seek to `position_us`; the current strategy asks the feeder for it.
    pub fn set_position_us(&mut self, position_us: i64) {
        tracing::info!("[{}] Position set to {}us", self.id, position_us);
        let result = match self.current {
            Some(kind) => match find_strategy(&mut self.renderers, kind) {
                Some(strategy) => strategy.set_position_us(&mut self.targets, position_us),
                None => Ok(()),
            },
            None => {
                self.targets.position.set_position_us(position_us);
                Ok(())
            }
        };
        self.guard(result);
    }

    /// Drop every buffered sample on both tracks.
    pub fn flush(&mut self) {
        tracing::info!("[{}] flush", self.id);
        self.targets.audio.reset();
        self.targets.video.flush();
        self.targets.position.unset_origin();
        self.first_video_frame_rendered = false;
        self.first_audio_frame_rendered = false;
    }

    /// Halt ticking and forget the started tracks. The strategy and the paths
    /// are kept as they are; tracks must be started again.
    pub fn stop(&mut self) {
        tracing::info!("[{}] stop", self.id);
        self.ticking = false;
        self.video_started = false;
        self.audio_started = false;
        if let Some(strategy) = self.current_strategy() {
            strategy.stop_video();
            strategy.stop_audio();
        }
        self.targets.position.reset();
        self.speed = 1.0;
    }

    pub fn release(&mut self) {
        tracing::info!("[{}] release", self.id);
        self.ticking = false;
        self.current = None;
        self.targets.video.release();
        self.targets.audio.release();
        self.has_video = false;
        self.has_audio = false;
    }

    pub fn set_start_position_us(&mut self, position_us: Option<i64>) {
        self.targets.position.set_start_position_us(position_us);
    }

    pub fn set_end_position_us(&mut self, position_us: Option<i64>) {
        self.targets.position.set_end_position_us(position_us);
    }

    /// The feeder has no more data for the current stream.
    pub fn set_end_of_data(&mut self) {
        self.targets.position.set_end_of_data();
    }

    pub fn position_us(&mut self) -> i64 {
        self.targets.position.position_us()
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// Run one scheduling pass and return the delay before the next one, in
    /// microseconds. Never fails: an escaping error stops the scheduler.
    pub fn tick(&mut self) -> i64 {
        let cadence_us = self.config.cadence_ms() as i64 * 1000;
        if !self.ticking {
            return cadence_us;
        }

        let started_ms = self.targets.now_ms();
        let delay_us = match self.run_tick() {
            Ok(delay_us) => delay_us,
            Err(err) => {
                self.emergency_stop(&err);
                return cadence_us;
            }
        };
        let elapsed_us = (self.targets.now_ms() - started_ms) * 1000;
        delay_us.min(cadence_us - elapsed_us).max(0)
    }

    fn run_tick(&mut self) -> Result<i64> {
        self.targets.video.pump_events()?;
        self.targets.audio.pump_events()?;
        self.apply_capability_changes();

        if self.current.is_none() && !self.stopped_by_error {
            self.select_renderer_task()?;
        }
        let delay_us = match self.current {
            Some(kind) => match find_strategy(&mut self.renderers, kind) {
                Some(strategy) => strategy.do_some_work(&mut self.targets)?,
                None => NO_RENDERER_DELAY_US,
            },
            None => NO_RENDERER_DELAY_US,
        };

        self.deliver_notices();
        Ok(delay_us)
    }

    fn apply_capability_changes(&mut self) {
        let changes = self.capability_watch.take_changes();
        if changes.is_empty() {
            return;
        }
        tracing::info!("[{}] capabilities changed: {:?}", self.id, changes);
        if let Some(kind) = self.current {
            if let Some(strategy) = find_strategy(&mut self.renderers, kind) {
                strategy.on_capabilities_changed(&mut self.targets);
            }
        }
    }

    fn deliver_notices(&mut self) {
        for notice in self.targets.video.take_notices() {
            self.on_notice(TrackKind::Video, notice);
        }
        for notice in self.targets.audio.take_notices() {
            self.on_notice(TrackKind::Audio, notice);
        }
    }

    fn on_notice(&mut self, track: TrackKind, notice: PathNotice) {
        let event = match notice {
            PathNotice::FirstData => PlaybackEvent::FirstDataPushed { track },
            PathNotice::FormatChanged(format) => PlaybackEvent::FormatChanged { track, format },
            PathNotice::FirstFrameDecoded { timestamp_us } => {
                PlaybackEvent::FirstFrameDecoded { track, timestamp_us }
            }
            PathNotice::FrameRendered { timestamp_us } => {
                self.on_media_frame(track, timestamp_us);
                return;
            }
        };
        self.targets.events.notify(event);
    }

    fn on_media_frame(&mut self, track: TrackKind, timestamp_us: i64) {
        let position = &mut self.targets.position;
        if !position.is_origin_set() {
            let offset_us = position.position_us();
            position.set_origin(timestamp_us, offset_us);
        }
        if position.is_update_needed() {
            position.set_presentation_timestamp_us(timestamp_us);
        }

        let (present, first_rendered) = match track {
            TrackKind::Video => (self.has_video, &mut self.first_video_frame_rendered),
            TrackKind::Audio => (self.has_audio, &mut self.first_audio_frame_rendered),
        };
        if !present {
            return;
        }
        if !*first_rendered {
            *first_rendered = true;
            tracing::info!("[{}] first {} frame", self.id, track);
            self.targets
                .events
                .notify(PlaybackEvent::FirstFrameRendered { track, timestamp_us });
        }
        if self.config.pts_events_enabled {
            self.targets
                .events
                .notify(PlaybackEvent::FrameRendered { track, timestamp_us });
        }
    }

    // ------------------------------------------------------------------------
    // Strategy selection
    // ------------------------------------------------------------------------

    fn current_strategy(&mut self) -> Option<&mut dyn RendererStrategy> {
        let kind = self.current?;
        find_strategy(&mut self.renderers, kind)
    }

    fn select_renderer_task(&mut self) -> Result<()> {
        tracing::info!("[{}] speed: {}", self.id, self.speed);
        let kind = select_renderer(self.speed, self.current, self.has_video, &self.config);
        self.switch_to(kind)
    }

    fn switch_to(&mut self, kind: RendererKind) -> Result<()> {
        tracing::info!("[{}] Switching to {} strategy", self.id, kind);
        let previous = self.current;
        self.current = Some(kind);

        if let Some(previous_kind) = previous.filter(|p| *p != kind) {
            if let Some(old) = find_strategy(&mut self.renderers, previous_kind) {
                old.reset(&mut self.targets, ResetReason::RendererChanged)?;
            }
        }

        let Some(next) = find_strategy(&mut self.renderers, kind) else {
            return Err(AvSyncError::InvalidState(format!(
                "{} is not available in {:?} mode",
                kind, self.config.playback_mode
            )));
        };
        // Started tracks follow the scheduler, whichever strategy was current.
        if self.video_started {
            next.start_video();
        } else {
            next.stop_video();
        }
        if self.audio_started {
            next.start_audio();
        } else {
            next.stop_audio();
        }
        next.set_speed(&mut self.targets, previous, self.speed)?;

        if previous != Some(kind) {
            self.targets
                .events
                .notify(PlaybackEvent::RendererChanged { from: previous, to: kind });
        }
        Ok(())
    }

    fn update_ticking(&mut self) {
        let video = self.targets.video.has_media_format() && self.video_started;
        let audio = self.targets.audio.has_media_format() && self.audio_started;
        let ticking = (video || audio) && !self.stopped_by_error;
        if ticking != self.ticking {
            tracing::debug!("[{}] ticking: {} -> {}", self.id, self.ticking, ticking);
            self.ticking = ticking;
        }
    }

    fn stop_if_no_track_started(&mut self) {
        if !self.video_started && !self.audio_started {
            self.stop();
        }
    }

    fn guard(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.emergency_stop(&err);
        }
    }

    fn emergency_stop(&mut self, err: &AvSyncError) {
        tracing::warn!("[{}] emergency stop, {}", self.id, err);
        self.last_error = Some(err.to_string());
        self.stop();
        self.current = None;
        self.stopped_by_error = true;
        self.targets.events.notify(PlaybackEvent::EmergencyStop {
            reason: err.to_string(),
        });
    }
}

impl std::fmt::Debug for RendererScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererScheduler")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("speed", &self.speed)
            .field("ticking", &self.ticking)
            .finish()
    }
}
