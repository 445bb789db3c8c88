// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Trick play by successive seeks: one frame per requested position.

use crate::error::Result;
use crate::io::VideoTrickMode;
use crate::output_path::MediaOutputPath;

use super::{RenderTargets, RendererBase, RendererKind, RendererStrategy, ResetReason, speed_equals};

/// Distance to a stream bound at which the walk freezes.
const BOUNDS_MARGIN_US: i64 = 2_000_000;
/// Settle time between a displayed frame and the next seek.
const DELAY_FOR_FLUSH_MS: i64 = 40;
/// Without a frame for this long the next seek is issued anyway, the jump
/// may have landed between two reference frames.
const FRAME_WAIT_TIMEOUT_MS: i64 = 1_000;
/// Requests lag the virtual position to land on a preceding reference frame.
const SEEK_BACKOFF_US: i64 = 1_000_000;
const WORK_DELAY_US: i64 = 10_000;
const IDLE_DELAY_US: i64 = 40_000;

pub struct TrickBySeekRenderer {
    base: RendererBase,
    origin_position_us: i64,
    origin_when_ms: i64,
    requested_when_ms: i64,
    last_displayed_us: Option<i64>,
    pending_next_ms: Option<i64>,
    /// A stream bound was reached, the last frame stays on screen.
    frozen: bool,
}

impl TrickBySeekRenderer {
    pub fn new(id: &str) -> Self {
        Self {
            base: RendererBase::new(id, RendererKind::TrickBySeek),
            origin_position_us: 0,
            origin_when_ms: 0,
            requested_when_ms: 0,
            last_displayed_us: None,
            pending_next_ms: None,
            frozen: false,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn anchor(&mut self, position_us: i64, now_ms: i64) {
        self.origin_position_us = position_us;
        self.origin_when_ms = now_ms;
        self.requested_when_ms = now_ms;
    }

    fn arm_next_requested_position(&mut self, now_ms: i64) {
        self.pending_next_ms = Some(now_ms + DELAY_FOR_FLUSH_MS);
    }

    fn freeze_to_position(&mut self, position_us: i64, now_ms: i64) {
        tracing::info!("[{}] freeze at {}ms", self.base.tag(), position_us / 1000);
        self.anchor(position_us, now_ms);
        self.frozen = true;
    }

    /// Next target on the virtual timeline, clamped to the known bounds.
    fn apply_pending_next_position(&mut self, t: &mut RenderTargets) {
        let now_ms = t.now_ms();
        self.pending_next_ms = None;
        self.requested_when_ms = now_ms;

        let elapsed_us = (now_ms - self.origin_when_ms) * 1000;
        let mut target_us = self.origin_position_us
            + (elapsed_us as f64 * self.base.speed) as i64
            - SEEK_BACKOFF_US;

        let start_us = t
            .position
            .has_start_position()
            .then(|| t.position.start_position_us());
        let end_us = t
            .position
            .has_end_position()
            .then(|| t.position.end_position_us());
        if let Some(end_us) = end_us {
            target_us = target_us.min(end_us);
        }
        target_us = target_us.max(start_us.unwrap_or(0));

        match (start_us, end_us) {
            (_, Some(end_us)) if self.base.speed > 0.0 && target_us > end_us - BOUNDS_MARGIN_US => {
                target_us = (end_us - BOUNDS_MARGIN_US).max(start_us.unwrap_or(0));
                self.freeze_to_position(target_us, now_ms);
            }
            (Some(start_us), _)
                if self.base.speed < 0.0 && target_us < start_us + BOUNDS_MARGIN_US =>
            {
                target_us = start_us;
                self.freeze_to_position(target_us, now_ms);
            }
            _ => {}
        }

        tracing::debug!("[{}] next position {}ms", self.base.tag(), target_us / 1000);
        self.base.request_position(target_us);
    }
}

impl RendererStrategy for TrickBySeekRenderer {
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
        self.last_displayed_us = None;
        self.pending_next_ms = None;
        self.frozen = false;
        self.base.request_position(position_us);

        if t.audio.has_media_format() {
            t.audio.reset();
        }
        if t.video.is_tunneled() {
            t.video.reset();
        }
        t.set_tunneled(false);

        t.video.set_trick_mode(VideoTrickMode::BySeek)?;
        t.video.set_trick_mode_speed(speed)
    }

    fn set_position_us(&mut self, t: &mut RenderTargets, position_us: i64) -> Result<()> {
        self.base.request_position(position_us);
        t.position.set_position_us(position_us);
        self.anchor(position_us, t.now_ms());
        self.pending_next_ms = None;
        self.frozen = false;
        t.video.flush();
        Ok(())
    }

    fn pump_feeder_data(&mut self, t: &mut RenderTargets) -> Result<()> {
        t.video.push_input_buffer()
    }

    fn do_some_work(&mut self, t: &mut RenderTargets) -> Result<i64> {
        if let Some(pending_ms) = self.pending_next_ms {
            if t.now_ms() < pending_ms {
                return Ok(WORK_DELAY_US);
            }
            self.apply_pending_next_position(t);
        }

        self.handle_feeding(t)?;
        t.video.push_input_buffer()?;
        t.video.check_errors();

        let moving = !speed_equals(self.base.speed, 0.0);
        let need_render = moving || !t.video.is_first_frame_displayed();
        if need_render && t.video.has_output_buffers() {
            if let Some(last_us) = self.last_displayed_us {
                let skipped = t.video.skip_frames_before(last_us, self.base.speed >= 0.0)?;
                if skipped > 0 {
                    tracing::debug!(
                        "[{}] {} frames out of sequence after {}ms",
                        self.base.tag(),
                        skipped,
                        last_us / 1000
                    );
                }
            }
            if t.video.has_output_buffers() && !t.video.is_first_frame_displayed() {
                self.last_displayed_us = Some(t.video.next_output_timestamp_us());
                t.video.render_one_frame()?;
            }
            if t.video.is_first_frame_displayed() {
                if moving && !self.frozen {
                    self.arm_next_requested_position(t.now_ms());
                    return Ok(0);
                }
                return Ok(IDLE_DELAY_US);
            }
        }

        let elapsed_ms = t.now_ms() - self.requested_when_ms;
        if moving && !self.frozen && elapsed_ms > FRAME_WAIT_TIMEOUT_MS {
            tracing::debug!("[{}] no frame after {}ms, jump further", self.base.tag(), elapsed_ms);
            self.arm_next_requested_position(t.now_ms());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{InputBufferQueue, PlaybackEvent, StaticCapabilities};
    use crate::renderer::test_support::{Harness, harness};

    fn tick(r: &mut TrickBySeekRenderer, h: &mut Harness) -> i64 {
        h.targets.video.pump_events().unwrap();
        r.do_some_work(&mut h.targets).unwrap()
    }

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

    fn renderer_at(h: &mut Harness, position_us: i64, speed: f64) -> TrickBySeekRenderer {
        h.targets.position.set_position_us(position_us);
        let mut r = TrickBySeekRenderer::new("test");
        r.set_speed(&mut h.targets, Some(RendererKind::Playback), speed)
            .unwrap();
        r
    }

    #[test]
    fn test_first_request_is_current_position() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        let mut r = renderer_at(&mut h, 5_000_000, 4.0);
        tick(&mut r, &mut h);
        assert_eq!(requested(&h), vec![5_000_000]);
        assert_eq!(h.video_decoder.trick_mode().0, VideoTrickMode::BySeek);
    }

    #[test]
    fn test_one_frame_per_seek() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        let mut r = renderer_at(&mut h, 5_000_000, 4.0);
        tick(&mut r, &mut h);
        h.feed_video([5_000_000, 5_040_000, 5_080_000]);
        tick(&mut r, &mut h);

        assert_eq!(tick(&mut r, &mut h), 0, "next seek armed");
        assert_eq!(h.video_decoder.rendered_timestamps(), vec![5_000_000]);

        // Settle delay not elapsed yet.
        assert_eq!(tick(&mut r, &mut h), WORK_DELAY_US);
        assert_eq!(requested(&h).len(), 1);

        h.wall.advance_ms(500);
        tick(&mut r, &mut h);
        // 5s + 500ms at 4x - 1s
        assert_eq!(requested(&h), vec![5_000_000, 6_000_000]);
        assert!(!h.targets.video.is_first_frame_displayed());
    }

    #[test]
    fn test_rewind_skips_frames_out_of_sequence() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        let mut r = renderer_at(&mut h, 5_000_000, -4.0);
        tick(&mut r, &mut h);
        h.feed_video([5_000_000]);
        tick(&mut r, &mut h);
        tick(&mut r, &mut h);
        h.wall.advance_ms(100);
        tick(&mut r, &mut h);
        assert_eq!(requested(&h).len(), 2);

        // The decoder hands back a frame from after the last one shown.
        h.feed_video([5_100_000, 4_960_000]);
        tick(&mut r, &mut h);
        tick(&mut r, &mut h);
        assert_eq!(h.video_decoder.rendered_timestamps(), vec![5_000_000, 4_960_000]);
        assert_eq!(h.video_decoder.dropped_timestamps(), vec![5_100_000]);
    }

    #[test]
    fn test_jumps_further_without_frame() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        let mut r = renderer_at(&mut h, 5_000_000, 2.0);
        tick(&mut r, &mut h);
        h.wall.advance_ms(500);
        assert_eq!(tick(&mut r, &mut h), WORK_DELAY_US);

        h.wall.advance_ms(501);
        assert_eq!(tick(&mut r, &mut h), 0);
        h.wall.advance_ms(40);
        tick(&mut r, &mut h);
        // 5s + 1041ms at 2x - 1s
        assert_eq!(requested(&h), vec![5_000_000, 6_082_000]);
    }

    #[test]
    fn test_freezes_near_end() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        h.targets.position.set_start_position_us(Some(0));
        h.targets.position.set_end_position_us(Some(10_000_000));
        let mut r = renderer_at(&mut h, 9_500_000, 4.0);
        tick(&mut r, &mut h);
        h.wall.advance_ms(1_001);
        tick(&mut r, &mut h);
        h.wall.advance_ms(40);
        tick(&mut r, &mut h);

        assert!(r.is_frozen());
        assert_eq!(requested(&h), vec![9_500_000, 8_000_000]);

        h.wall.advance_ms(5_000);
        tick(&mut r, &mut h);
        assert_eq!(requested(&h).len(), 2, "no more seeks once frozen");
    }

    #[test]
    fn test_rewind_freezes_at_start() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        h.targets.position.set_start_position_us(Some(1_000_000));
        let mut r = renderer_at(&mut h, 3_000_000, -4.0);
        tick(&mut r, &mut h);
        h.wall.advance_ms(1_001);
        tick(&mut r, &mut h);
        h.wall.advance_ms(40);
        tick(&mut r, &mut h);

        assert!(r.is_frozen());
        assert_eq!(requested(&h).last(), Some(&1_000_000));
    }

    #[test]
    fn test_set_position_reanchors() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        let mut r = renderer_at(&mut h, 5_000_000, 2.0);
        tick(&mut r, &mut h);
        h.feed_video([5_000_000]);

        h.wall.advance_ms(300);
        r.set_position_us(&mut h.targets, 20_000_000).unwrap();
        assert!(h.video_queue.is_empty(), "flushed");
        tick(&mut r, &mut h);
        assert_eq!(requested(&h), vec![5_000_000, 20_000_000]);
    }
}
