// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Trick play on key frames only, decoded and shown as they come.

use crate::error::Result;
use crate::io::VideoTrickMode;
use crate::output_path::MediaOutputPath;

use super::{RenderTargets, RendererBase, RendererKind, RendererStrategy, ResetReason, speed_equals};

/// Decoders take the I-frame trick speed in thousandths.
const DECODER_SPEED_SCALE: f64 = 1000.0;
const WORK_DELAY_US: i64 = 10_000;

pub struct TrickIOnlyRenderer {
    base: RendererBase,
}

impl TrickIOnlyRenderer {
    pub fn new(id: &str) -> Self {
        Self {
            base: RendererBase::new(id, RendererKind::TrickIOnly),
        }
    }
}

impl RendererStrategy for TrickIOnlyRenderer {
    fn base(&self) -> &RendererBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RendererBase {
        &mut self.base
    }

    fn set_speed(
        &mut self,
        t: &mut RenderTargets,
        _previous: Option<RendererKind>,
        speed: f64,
    ) -> Result<()> {
        tracing::info!("[{}] set speed: {}", self.base.tag(), speed);
        self.base.speed = speed;

        if t.audio.has_media_format() {
            t.audio.reset();
        }
        if t.video.is_tunneled() {
            t.video.reset();
        }
        t.set_tunneled(false);

        t.video.set_trick_mode(VideoTrickMode::IOnly)?;
        t.video.set_trick_mode_speed(speed * DECODER_SPEED_SCALE)
    }

    fn pump_feeder_data(&mut self, t: &mut RenderTargets) -> Result<()> {
        t.video.push_input_buffer()
    }

    fn do_some_work(&mut self, t: &mut RenderTargets) -> Result<i64> {
        self.handle_feeding(t)?;
        t.video.check_errors();
        t.video.render_next_frame()?;

        if !speed_equals(self.base.speed, 0.0) && t.video.is_first_frame_displayed() {
            return Ok(0);
        }
        Ok(WORK_DELAY_US)
    }

    fn reset(&mut self, t: &mut RenderTargets, reason: ResetReason) -> Result<()> {
        match reason {
            ResetReason::NewPosition => t.video.flush(),
            ResetReason::RendererChanged => t.video.set_trick_mode(VideoTrickMode::None)?,
            _ => {}
        }
        Ok(())
    }
}
