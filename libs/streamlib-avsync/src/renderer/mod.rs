// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Playback strategies selected by the scheduler according to the speed.
//!
//! Every strategy drives the same two output paths and position handler,
//! borrowed through [`RenderTargets`] for the duration of one call. Only the
//! strategy the scheduler marks current gets ticked.

mod passthrough;
mod playback;
mod playback_task;
mod trick_by_seek;
mod trick_ionly;
mod trick_no_video;
mod trick_smooth;

pub use passthrough::PassthroughRenderer;
pub use playback::{PlaybackRenderer, SynchroMode};
pub use playback_task::{ALWAYS_RUN, PlaybackTask, TaskAdmission, TaskKind, TaskList};
pub use trick_by_seek::TrickBySeekRenderer;
pub use trick_ionly::TrickIOnlyRenderer;
pub use trick_no_video::TrickNoVideoRenderer;
pub use trick_smooth::TrickSmoothRenderer;

use crate::clocks::SharedClock;
use crate::error::Result;
use crate::io::{CapabilitySource, PlaybackEvent, SharedEventSink};
use crate::output_path::{AudioOutputPath, MediaOutputPath, VideoOutputPath};
use crate::position_handler::PositionHandler;
use std::sync::Arc;

/// Speeds closer than this are the same speed.
pub const SPEED_DIFF_THRESHOLD: f64 = 0.001;

pub(crate) fn speed_equals(a: f64, b: f64) -> bool {
    (a - b).abs() < SPEED_DIFF_THRESHOLD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    NewPosition,
    NoMedia,
    BadData,
    NoData,
    Discontinuity,
    DecodersBlocked,
    RendererChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendererKind {
    Playback,
    Passthrough,
    TrickSmooth,
    TrickBySeek,
    TrickNoVideo,
    TrickIOnly,
}

impl std::fmt::Display for RendererKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RendererKind::Playback => "RendererPlayback",
            RendererKind::Passthrough => "RendererPassthrough",
            RendererKind::TrickSmooth => "RendererTrickSmooth",
            RendererKind::TrickBySeek => "RendererTrickBySeek",
            RendererKind::TrickNoVideo => "RendererTrickNoVideo",
            RendererKind::TrickIOnly => "RendererTrickIOnly",
        };
        f.write_str(name)
    }
}

/// Everything a strategy acts on. Owned by the scheduler.
pub struct RenderTargets {
    pub(crate) id: String,
    pub(crate) video: VideoOutputPath,
    pub(crate) audio: AudioOutputPath,
    pub(crate) position: PositionHandler,
    pub(crate) wall: SharedClock,
    pub(crate) capabilities: Arc<dyn CapabilitySource>,
    pub(crate) events: SharedEventSink,
}

impl RenderTargets {
    pub(crate) fn now_ms(&self) -> i64 {
        self.wall.now_ms()
    }

    /// Decoder tunneling is possible and the audio goes out over HDMI.
    pub(crate) fn can_use_tunneled_playback(&self) -> bool {
        self.capabilities.is_tunneled_playback_supported()
            && self.capabilities.is_hdmi_plugged()
            && !self.capabilities.is_bluetooth_sink_ready()
    }

    pub(crate) fn set_tunneled(&mut self, tunneled: bool) {
        self.video.set_tunneled(tunneled);
        self.audio.set_tunneled(tunneled);
    }
}

/// State every strategy carries.
#[derive(Debug)]
pub struct RendererBase {
    kind: RendererKind,
    tag: String,
    pub(crate) speed: f64,
    pub(crate) video_started: bool,
    pub(crate) audio_started: bool,
    requested_position_us: Option<i64>,
}

impl RendererBase {
    pub(crate) fn new(id: &str, kind: RendererKind) -> Self {
        Self {
            kind,
            tag: format!("{}-{}", id, kind),
            speed: 1.0,
            video_started: false,
            audio_started: false,
            requested_position_us: None,
        }
    }

    pub fn kind(&self) -> RendererKind {
        self.kind
    }

    /// Log prefix, instance id and strategy name.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn requested_position_us(&self) -> Option<i64> {
        self.requested_position_us
    }

    /// Ask the feeder for a new position on the next feeding pass.
    pub(crate) fn request_position(&mut self, position_us: i64) {
        self.requested_position_us = Some(position_us);
    }

    fn take_requested_position(&mut self) -> Option<i64> {
        self.requested_position_us.take()
    }
}

pub trait RendererStrategy {
    fn base(&self) -> &RendererBase;

    fn base_mut(&mut self) -> &mut RendererBase;

    /// Become current at `speed`. `previous` is the strategy that was
    /// current before, `None` on the first activation.
    fn set_speed(
        &mut self,
        targets: &mut RenderTargets,
        previous: Option<RendererKind>,
        speed: f64,
    ) -> Result<()>;

    /// One scheduling pass. Returns the delay in microseconds before the next.
    fn do_some_work(&mut self, targets: &mut RenderTargets) -> Result<i64>;

    fn reset(&mut self, targets: &mut RenderTargets, reason: ResetReason) -> Result<()>;

    /// Move demux data towards the decoders.
    fn pump_feeder_data(&mut self, _targets: &mut RenderTargets) -> Result<()> {
        Ok(())
    }

    fn on_capabilities_changed(&mut self, _targets: &mut RenderTargets) {}

    fn kind(&self) -> RendererKind {
        self.base().kind()
    }

    fn set_position_us(&mut self, targets: &mut RenderTargets, position_us: i64) -> Result<()> {
        self.base_mut().request_position(position_us);
        targets.position.set_position_us(position_us);
        Ok(())
    }

    fn start_video(&mut self) {
        self.base_mut().video_started = true;
    }

    fn stop_video(&mut self) {
        self.base_mut().video_started = false;
    }

    fn start_audio(&mut self) {
        self.base_mut().audio_started = true;
    }

    fn stop_audio(&mut self) {
        self.base_mut().audio_started = false;
    }

    /// A pending position request is turned into a reset of the pipeline and
    /// published to the feeder; otherwise data is pumped.
    fn handle_feeding(&mut self, targets: &mut RenderTargets) -> Result<()> {
        let Some(position_us) = self.base_mut().take_requested_position() else {
            return self.pump_feeder_data(targets);
        };
        tracing::info!("[{}] request feeder position {}us", self.base().tag(), position_us);
        self.reset(targets, ResetReason::NewPosition)?;
        targets.position.unset_origin();
        targets
            .events
            .notify(PlaybackEvent::PositionRequested { position_us });
        Ok(())
    }
}

/// The closed set of strategies.
pub enum Renderer {
    Playback(PlaybackRenderer),
    Passthrough(PassthroughRenderer),
    TrickSmooth(TrickSmoothRenderer),
    TrickBySeek(TrickBySeekRenderer),
    TrickNoVideo(TrickNoVideoRenderer),
    TrickIOnly(TrickIOnlyRenderer),
}

impl Renderer {
    pub fn kind(&self) -> RendererKind {
        self.strategy().kind()
    }

    pub fn strategy(&self) -> &dyn RendererStrategy {
        match self {
            Renderer::Playback(r) => r,
            Renderer::Passthrough(r) => r,
            Renderer::TrickSmooth(r) => r,
            Renderer::TrickBySeek(r) => r,
            Renderer::TrickNoVideo(r) => r,
            Renderer::TrickIOnly(r) => r,
        }
    }

    pub fn strategy_mut(&mut self) -> &mut dyn RendererStrategy {
        match self {
            Renderer::Playback(r) => r,
            Renderer::Passthrough(r) => r,
            Renderer::TrickSmooth(r) => r,
            Renderer::TrickBySeek(r) => r,
            Renderer::TrickNoVideo(r) => r,
            Renderer::TrickIOnly(r) => r,
        }
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Renderer").field(&self.kind()).finish()
    }
}
