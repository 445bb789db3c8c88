// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Trick play without a video track: the position moves on its own and the
//! feeder is asked to follow.

use crate::error::Result;
use crate::output_path::MediaOutputPath;

use super::{RenderTargets, RendererBase, RendererKind, RendererStrategy, ResetReason};

const BOUNDS_MARGIN_US: i64 = 2_000_000;
const REQUEST_INTERVAL_MS: i64 = 200;
const SEEK_BACKOFF_US: i64 = 1_000_000;
const WORK_DELAY_US: i64 = 10_000;

pub struct TrickNoVideoRenderer {
    base: RendererBase,
    origin_position_us: i64,
    origin_when_ms: i64,
    requested_when_ms: i64,
}

impl TrickNoVideoRenderer {
    pub fn new(id: &str) -> Self {
        Self {
            base: RendererBase::new(id, RendererKind::TrickNoVideo),
            origin_position_us: 0,
            origin_when_ms: 0,
            requested_when_ms: 0,
        }
    }

    fn anchor(&mut self, position_us: i64, now_ms: i64) {
        self.origin_position_us = position_us;
        self.origin_when_ms = now_ms;
        self.requested_when_ms = now_ms;
    }

    fn virtual_position_us(&self, now_ms: i64) -> i64 {
        let elapsed_us = (now_ms - self.origin_when_ms) * 1000;
        self.origin_position_us + (elapsed_us as f64 * self.base.speed) as i64 - SEEK_BACKOFF_US
    }

    fn freeze_to_position(&mut self, position_us: i64, now_ms: i64) {
        tracing::info!("[{}] freeze at {}ms", self.base.tag(), position_us / 1000);
        self.anchor(position_us, now_ms);
        self.base.request_position(position_us);
    }
}

impl RendererStrategy for TrickNoVideoRenderer {
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
        tracing::info!("[{}] speed:{}", self.base.tag(), speed);
        self.base.speed = speed;

        let position_us = t.position.position_us();
        self.anchor(position_us, t.now_ms());
        let mut target_us = position_us;
        if t.position.has_end_position() {
            target_us = target_us.min(t.position.end_position_us() - SEEK_BACKOFF_US);
        }
        if t.position.has_start_position() {
            target_us = target_us.max(t.position.start_position_us());
        }
        self.base.request_position(target_us);

        if t.audio.has_media_format() {
            t.audio.reset();
        }
        t.set_tunneled(false);
        Ok(())
    }

    fn set_position_us(&mut self, t: &mut RenderTargets, position_us: i64) -> Result<()> {
        self.base.request_position(position_us);
        t.position.set_position_us(position_us);
        self.anchor(position_us, t.now_ms());
        Ok(())
    }

    fn do_some_work(&mut self, t: &mut RenderTargets) -> Result<i64> {
        self.handle_feeding(t)?;

        let now_ms = t.now_ms();
        let position_us = self.virtual_position_us(now_ms);
        if now_ms - self.requested_when_ms < REQUEST_INTERVAL_MS {
            t.position.set_position_us(position_us);
            return Ok(WORK_DELAY_US);
        }

        self.requested_when_ms = now_ms;
        let start_us = t.position.start_position_us();
        let end_us = t.position.end_position_us();
        if self.base.speed > 0.0
            && t.position.has_end_position()
            && position_us > end_us - BOUNDS_MARGIN_US
        {
            self.freeze_to_position(end_us - BOUNDS_MARGIN_US, now_ms);
        } else if self.base.speed < 0.0
            && t.position.has_start_position()
            && position_us < start_us + BOUNDS_MARGIN_US
        {
            self.freeze_to_position(start_us, now_ms);
        } else {
            self.base.request_position(position_us.max(0));
        }
        Ok(WORK_DELAY_US)
    }

    fn reset(&mut self, _t: &mut RenderTargets, _reason: ResetReason) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{PlaybackEvent, StaticCapabilities};
    use crate::renderer::test_support::{Harness, harness};

    fn requested(h: &Harness) -> Vec<i64> {
        h.events
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PlaybackEvent::PositionRequested { position_us } => Some(position_us),
                _ => None,
            })
            .collect()
    }

    fn renderer_at(h: &mut Harness, position_us: i64, speed: f64) -> TrickNoVideoRenderer {
        h.targets.position.set_position_us(position_us);
        let mut r = TrickNoVideoRenderer::new("test");
        r.set_speed(&mut h.targets, Some(RendererKind::Playback), speed)
            .unwrap();
        r
    }

    #[test]
    fn test_position_advances_virtually() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_audio();
        let mut r = renderer_at(&mut h, 10_000_000, 4.0);
        r.do_some_work(&mut h.targets).unwrap();
        assert_eq!(requested(&h), vec![10_000_000]);

        h.wall.advance_ms(100);
        r.do_some_work(&mut h.targets).unwrap();
        // 10s + 100ms at 4x - 1s
        assert_eq!(h.targets.position.position_us(), 9_400_000);
    }

    #[test]
    fn test_requests_follow_every_interval() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_audio();
        let mut r = renderer_at(&mut h, 10_000_000, 2.0);
        r.do_some_work(&mut h.targets).unwrap();

        h.wall.advance_ms(150);
        r.do_some_work(&mut h.targets).unwrap();
        assert_eq!(requested(&h).len(), 1);

        h.wall.advance_ms(100);
        r.do_some_work(&mut h.targets).unwrap();
        r.do_some_work(&mut h.targets).unwrap();
        // 10s + 250ms at 2x - 1s
        assert_eq!(requested(&h), vec![10_000_000, 9_500_000]);
    }

    #[test]
    fn test_freezes_before_end() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_audio();
        h.targets.position.set_end_position_us(Some(12_000_000));
        let mut r = renderer_at(&mut h, 10_000_000, 4.0);
        r.do_some_work(&mut h.targets).unwrap();

        h.wall.advance_ms(500);
        r.do_some_work(&mut h.targets).unwrap();
        r.do_some_work(&mut h.targets).unwrap();
        assert_eq!(requested(&h), vec![10_000_000, 10_000_000]);
    }

    #[test]
    fn test_first_request_stays_inside_bounds() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_audio();
        h.targets.position.set_end_position_us(Some(10_000_000));
        let mut r = renderer_at(&mut h, 9_800_000, 2.0);
        r.do_some_work(&mut h.targets).unwrap();
        assert_eq!(requested(&h), vec![9_000_000]);
    }

    #[test]
    fn test_audio_is_stopped() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_audio();
        h.targets.audio.configure().unwrap();
        renderer_at(&mut h, 0, 4.0);
        assert!(!h.targets.audio.is_configured());
    }
}
