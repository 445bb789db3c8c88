// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-track configuration and rendering state machines.
//!
//! An output path owns one decoder (and, for audio, the sink it writes into),
//! moves buffers from the demux input queue into the decoder, and presents the
//! decoded output against its own [`MediaClock`].

mod audio;
mod video;

pub use audio::AudioOutputPath;
pub use video::VideoOutputPath;

use crate::clocks::SharedClock;
use crate::config::RetryConfig;
use crate::error::{AvSyncError, Result};
use crate::io::{
    DecoderError, DecoderEventChannel, DecoderResult, Descrambler, MediaFormat, SharedInputQueue,
    TrackKind,
};
use crate::media_clock::MediaClock;
use crate::timestamp_keeper::TimestampKeeper;

/// Longest time spent moving buffers into a decoder per call.
const MAX_PUSH_TIME_MS: i64 = 10;

/// Default delay suggested by `render()` when there is nothing to do.
pub(crate) const IDLE_RENDER_DELAY_US: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigState {
    #[default]
    None,
    Configured,
    /// Terminal until the path is reset.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderingMode {
    #[default]
    None,
    Synchronized,
    FreeRun,
}

/// Things the scheduler must hear about, queued by a path during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PathNotice {
    FirstData,
    FormatChanged(MediaFormat),
    FirstFrameDecoded { timestamp_us: i64 },
    FrameRendered { timestamp_us: i64 },
}

/// State shared by the audio and video paths.
pub struct OutputPathCore {
    pub(crate) id: String,
    pub(crate) track: TrackKind,
    pub(crate) wall: SharedClock,
    pub(crate) clock: MediaClock,
    pub(crate) keeper: TimestampKeeper,
    pub(crate) queue: Option<SharedInputQueue>,
    pub(crate) format: Option<MediaFormat>,
    pub(crate) descrambler: Option<Descrambler>,
    pub(crate) tunneled: bool,
    pub(crate) audio_session_id: Option<u32>,
    pub(crate) events: DecoderEventChannel,
    config_state: ConfigState,
    rendering_mode: RenderingMode,
    retry: RetryConfig,
    retry_count: u32,
    last_failure_ms: Option<i64>,
    error: Option<String>,
    queue_full_since_ms: Option<i64>,
    first_data_pushed: bool,
    push_started_ms: i64,
    notices: Vec<PathNotice>,
}

impl OutputPathCore {
    pub(crate) fn new(
        id: impl Into<String>,
        track: TrackKind,
        wall: SharedClock,
        retry: RetryConfig,
        discontinuity_threshold_us: i64,
    ) -> Self {
        Self {
            id: id.into(),
            track,
            clock: MediaClock::new(wall.clone()),
            wall,
            keeper: TimestampKeeper::with_threshold(track, discontinuity_threshold_us),
            queue: None,
            format: None,
            descrambler: None,
            tunneled: false,
            audio_session_id: None,
            events: DecoderEventChannel::new(),
            config_state: ConfigState::None,
            rendering_mode: RenderingMode::None,
            retry,
            retry_count: 0,
            last_failure_ms: None,
            error: None,
            queue_full_since_ms: None,
            first_data_pushed: false,
            push_started_ms: 0,
            notices: Vec::new(),
        }
    }

    pub fn config_state(&self) -> &ConfigState {
        &self.config_state
    }

    pub fn rendering_mode(&self) -> RenderingMode {
        self.rendering_mode
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("[{}] {} error: {}", self.id, self.track, message);
        self.error = Some(message);
    }

    pub(crate) fn set_configured(&mut self, configured: bool) {
        self.config_state = if configured {
            ConfigState::Configured
        } else {
            ConfigState::None
        };
    }

    /// Whether a configure attempt may run now.
    pub(crate) fn may_configure(&self) -> bool {
        match &self.config_state {
            ConfigState::Configured => {
                tracing::debug!("[{}] {} already configured", self.id, self.track);
                return false;
            }
            ConfigState::Error(message) => {
                tracing::debug!("[{}] {} has configuration error: {}", self.id, self.track, message);
                return false;
            }
            ConfigState::None => {}
        }
        if self.wait_for_configuration_retry() {
            tracing::trace!("[{}] {} wait for configuration retry", self.id, self.track);
            return false;
        }
        if self.format.is_none() {
            tracing::debug!("[{}] {} configure skipped, no media format", self.id, self.track);
            return false;
        }
        true
    }

    pub(crate) fn wait_for_configuration_retry(&self) -> bool {
        self.last_failure_ms.is_some_and(|last| {
            self.wall.now_ms() - last < self.retry.interval_ms as i64
        })
    }

    pub(crate) fn configuration_succeeded(&mut self) {
        self.retry_count = 0;
        self.last_failure_ms = None;
        self.set_configured(true);
    }

    pub(crate) fn handle_configuration_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.retry_count < self.retry.max_attempts {
            self.retry_count += 1;
            self.last_failure_ms = Some(self.wall.now_ms());
            tracing::warn!(
                "[{}] {} configuration failed, retry {}: {}",
                self.id,
                self.track,
                self.retry_count,
                message
            );
        } else {
            tracing::error!(
                "[{}] {} configuration failed after {} retries: {}",
                self.id,
                self.track,
                self.retry_count,
                message
            );
            self.retry_count = 0;
            self.last_failure_ms = None;
            self.config_state = ConfigState::Error(message);
        }
    }

    /// Route a decoder result: recoverable faults land in the error slot,
    /// fatal ones escape.
    pub(crate) fn absorb(&mut self, result: DecoderResult<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(DecoderError::Fatal(message)) => Err(AvSyncError::Codec(message)),
            Err(DecoderError::Transient(message)) | Err(DecoderError::Configuration(message)) => {
                self.set_error(message);
                Ok(())
            }
        }
    }

    pub(crate) fn set_synchro_on(&mut self, origin_us: i64) {
        self.clock.set_origin_timestamp_us(origin_us);
        self.rendering_mode = RenderingMode::Synchronized;
    }

    pub(crate) fn set_free_run_mode(&mut self) {
        self.clock.set_origin_timestamp_us(0);
        self.rendering_mode = RenderingMode::FreeRun;
    }

    pub(crate) fn reset_synchro(&mut self) {
        self.keeper.clear();
        self.clock.reset();
        self.rendering_mode = RenderingMode::None;
    }

    pub(crate) fn set_speed(&mut self, speed: f64) {
        self.clock.set_speed(speed);
        self.queue_full_since_ms = None;
    }

    pub(crate) fn start_push(&mut self) {
        self.push_started_ms = self.wall.now_ms();
    }

    pub(crate) fn is_push_timeout(&self) -> bool {
        self.wall.now_ms() - self.push_started_ms > MAX_PUSH_TIME_MS
    }

    pub(crate) fn notify_buffer_pushed(&mut self) {
        if self.first_data_pushed {
            return;
        }
        self.first_data_pushed = true;
        self.notices.push(PathNotice::FirstData);
    }

    pub(crate) fn notify(&mut self, notice: PathNotice) {
        self.notices.push(notice);
    }

    pub(crate) fn take_notices(&mut self) -> Vec<PathNotice> {
        std::mem::take(&mut self.notices)
    }

    pub(crate) fn timestamp_input_queue_full_if_needed(&mut self) {
        let full = self.queue.as_ref().is_some_and(|q| q.is_full());
        if !full {
            self.queue_full_since_ms = None;
        } else if self.queue_full_since_ms.is_none() {
            self.queue_full_since_ms = Some(self.wall.now_ms());
        }
    }

    pub fn elapsed_since_input_queue_full_ms(&self) -> i64 {
        self.queue_full_since_ms
            .map_or(0, |since| self.wall.now_ms() - since)
    }

    pub fn input_size_us(&self) -> i64 {
        match &self.queue {
            Some(queue) => queue.size_in_us() + self.keeper.size_in_us(),
            None => 0,
        }
    }

    pub fn queue_size_us(&self) -> i64 {
        self.queue.as_ref().map_or(0, |q| q.size_in_us())
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.as_ref().is_none_or(|q| q.is_empty())
    }

    /// Most recent timestamp handed to the decoder.
    pub fn last_output_timestamp_us(&self) -> Option<i64> {
        self.queue.as_ref()?;
        self.keeper.last_timestamp_us()
    }

    pub(crate) fn reset(&mut self) {
        self.config_state = ConfigState::None;
        self.clock.reset();
        self.keeper.clear();
        self.rendering_mode = RenderingMode::None;
        self.error = None;
        self.first_data_pushed = false;
        self.queue_full_since_ms = None;
    }

    pub(crate) fn release(&mut self) {
        tracing::info!("[{}] {} release", self.id, self.track);
        self.reset();
        self.queue = None;
        self.format = None;
        self.descrambler = None;
    }
}

/// Operations the scheduler and renderer strategies drive on either track.
pub trait MediaOutputPath {
    fn core(&self) -> &OutputPathCore;

    fn core_mut(&mut self) -> &mut OutputPathCore;

    /// Bind the decoder to the current format. Returns `false` when nothing
    /// was attempted or the attempt failed and will be retried.
    fn configure(&mut self) -> Result<bool>;

    fn push_input_buffer(&mut self) -> Result<()>;

    /// Drain the decoder callbacks of the current session.
    fn pump_events(&mut self) -> Result<()>;

    fn has_output_buffers(&self) -> bool;

    fn output_buffer_count(&self) -> usize;

    /// Timestamp of the next decoded buffer, 0 when there is none.
    fn next_output_timestamp_us(&self) -> i64;

    /// Lead time this track needs ahead of a discontinuity.
    fn margin_us(&self) -> i64;

    /// Present what is due. Returns the suggested delay before the next call.
    fn render(&mut self) -> Result<i64>;

    fn check_errors(&mut self);

    fn is_display_position_valid(&self) -> bool;

    fn display_position_us(&self) -> i64;

    fn reset(&mut self);

    fn release(&mut self);

    fn set_synchro_on(&mut self, origin_us: i64) {
        self.core_mut().set_synchro_on(origin_us);
    }

    fn set_free_run_mode(&mut self) {
        self.core_mut().set_free_run_mode();
    }

    fn set_speed(&mut self, speed: f64) {
        self.core_mut().set_speed(speed);
    }

    fn set_tunneled(&mut self, tunneled: bool) {
        self.core_mut().tunneled = tunneled;
    }

    fn reset_synchro(&mut self) {
        self.core_mut().reset_synchro();
    }

    fn track(&self) -> TrackKind {
        self.core().track
    }

    fn is_configured(&self) -> bool {
        *self.core().config_state() == ConfigState::Configured
    }

    fn has_configuration_error(&self) -> bool {
        matches!(self.core().config_state(), ConfigState::Error(_))
    }

    fn has_media_format(&self) -> bool {
        self.core().format.is_some()
    }

    /// Stream parameters are known, the track can take part in scheduling.
    fn is_ready(&self) -> bool {
        self.core().format.is_some() && self.core().queue.is_some()
    }

    fn rendering_mode(&self) -> RenderingMode {
        self.core().rendering_mode()
    }

    fn is_tunneled(&self) -> bool {
        self.core().tunneled
    }

    fn is_input_empty(&self) -> bool {
        self.core().keeper.is_empty()
    }

    fn has_input_discontinuity(&self) -> bool {
        self.core().keeper.has_discontinuity()
    }

    fn input_size_us(&self) -> i64 {
        self.core().input_size_us()
    }

    fn last_output_timestamp_us(&self) -> Option<i64> {
        self.core().last_output_timestamp_us()
    }

    fn elapsed_since_input_queue_full_ms(&self) -> i64 {
        self.core().elapsed_since_input_queue_full_ms()
    }

    fn clock_time_us(&self) -> i64 {
        self.core().clock.time_us()
    }

    fn is_clock_started(&self) -> bool {
        self.core().clock.is_started()
    }

    fn take_notices(&mut self) -> Vec<PathNotice> {
        self.core_mut().take_notices()
    }

    /// Pick a rendering mode from this track alone: synchronized on its own
    /// data, or free run while its input holds a discontinuity.
    fn check_standalone_synchro(&mut self) {
        if !self.has_output_buffers() {
            return;
        }
        let mode = if self.has_input_discontinuity() {
            RenderingMode::FreeRun
        } else {
            RenderingMode::Synchronized
        };
        if mode == self.rendering_mode() {
            return;
        }

        match mode {
            RenderingMode::Synchronized => {
                let margin_us = self.margin_us();
                let next_us = self.next_output_timestamp_us();
                let last_us = self.last_output_timestamp_us().unwrap_or(next_us);
                let origin_us = (last_us - margin_us).max(0).min(next_us);
                tracing::info!(
                    "[{}] SYNCHRO {} - input:{}ms, output:{}, margin:{}ms, next:{}ms, origin:{}ms, last:{}ms",
                    self.core().id,
                    self.track(),
                    (last_us - next_us) / 1000,
                    self.output_buffer_count(),
                    margin_us / 1000,
                    next_us / 1000,
                    origin_us / 1000,
                    last_us / 1000
                );
                self.set_synchro_on(origin_us);
            }
            RenderingMode::FreeRun => {
                tracing::info!("[{}] FREE RUN {}", self.core().id, self.track());
                self.set_free_run_mode();
            }
            RenderingMode::None => {}
        }
    }
}
