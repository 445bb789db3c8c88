// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Continuous variable-speed video, audio muted.

use crate::error::Result;
use crate::io::VideoTrickMode;
use crate::output_path::MediaOutputPath;

use super::{RenderTargets, RendererBase, RendererKind, RendererStrategy, ResetReason};

const END_OF_STREAM_MARGIN_US: i64 = 1_000_000;
const WORK_DELAY_US: i64 = 10_000;

pub struct TrickSmoothRenderer {
    base: RendererBase,
}

impl TrickSmoothRenderer {
    pub fn new(id: &str) -> Self {
        Self {
            base: RendererBase::new(id, RendererKind::TrickSmooth),
        }
    }

    /// Restart the video clock on the next decoded frame at the trick speed.
    fn arm_clock(&self, t: &mut RenderTargets) {
        if t.video.has_output_buffers() {
            let timestamp_us = t.video.next_output_timestamp_us();
            tracing::debug!(
                "[{}] clock origin {}ms at speed {}",
                self.base.tag(),
                timestamp_us / 1000,
                self.base.speed
            );
            t.video.set_synchro_on(timestamp_us);
            t.video.set_speed(self.base.speed);
        } else {
            t.video.core_mut().clock.reset();
        }
    }

    fn freeze_near_end(&self, t: &mut RenderTargets) {
        if self.base.speed <= 0.0 || !t.position.has_end_position() {
            return;
        }
        if t.video.core().clock.speed() == 0.0 {
            return;
        }
        let end_us = t.position.end_position_us();
        if t.position.position_us() >= end_us - END_OF_STREAM_MARGIN_US {
            tracing::info!(
                "[{}] end of stream reached ({}ms), freeze video",
                self.base.tag(),
                end_us / 1000
            );
            t.video.core_mut().clock.set_speed(0.0);
        }
    }
}

impl RendererStrategy for TrickSmoothRenderer {
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
        tracing::info!("[{}] speed:{}->{}", self.base.tag(), self.base.speed, speed);
        self.base.speed = speed;

        if t.audio.has_media_format() {
            t.audio.reset();
        }
        // A tunneled decoder cannot leave the hardware clock, reconfigure it.
        if t.video.is_tunneled() {
            t.video.reset();
        }
        t.set_tunneled(false);

        t.video.set_trick_mode(VideoTrickMode::Smooth)?;
        t.video.set_trick_mode_speed(speed)?;
        self.arm_clock(t);
        Ok(())
    }

    fn pump_feeder_data(&mut self, t: &mut RenderTargets) -> Result<()> {
        t.video.push_input_buffer()
    }

    fn do_some_work(&mut self, t: &mut RenderTargets) -> Result<i64> {
        self.handle_feeding(t)?;
        t.video.push_input_buffer()?;
        t.video.check_errors();

        if t.video.has_output_buffers() && !t.video.is_clock_started() {
            self.arm_clock(t);
        }
        self.freeze_near_end(t);

        t.video.render()?;
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
    use crate::io::{InputBufferQueue, StaticCapabilities};
    use crate::renderer::test_support::{Harness, harness};

    fn tick(r: &mut TrickSmoothRenderer, h: &mut Harness) -> i64 {
        h.targets.video.pump_events().unwrap();
        h.targets.audio.pump_events().unwrap();
        r.do_some_work(&mut h.targets).unwrap()
    }

    #[test]
    fn test_decoder_configured_for_smooth_trick() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        let mut r = TrickSmoothRenderer::new("test");
        r.set_speed(&mut h.targets, Some(RendererKind::Playback), 2.0)
            .unwrap();
        assert_eq!(tick(&mut r, &mut h), WORK_DELAY_US);

        let options = h.video_decoder.last_options().unwrap();
        assert_eq!(options.trick_mode, VideoTrickMode::Smooth);
        assert_eq!(options.trick_speed, 2.0);
        assert!(!options.tunneled);
    }

    #[test]
    fn test_clock_runs_at_trick_speed_from_next_frame() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        h.feed_video((0..8).map(|i| 1_000_000 + i * 40_000));
        let mut r = TrickSmoothRenderer::new("test");
        r.set_speed(&mut h.targets, Some(RendererKind::Playback), 2.0)
            .unwrap();
        assert!(!h.targets.video.is_clock_started());

        for _ in 0..3 {
            tick(&mut r, &mut h);
        }

        assert!(h.targets.video.is_clock_started());
        assert_eq!(h.targets.video.core().clock.speed(), 2.0);
        assert_eq!(h.targets.video.clock_time_us(), 1_000_000);
        assert_eq!(h.video_decoder.rendered_timestamps(), vec![1_000_000]);

        h.wall.advance_ms(100);
        assert_eq!(h.targets.video.clock_time_us(), 1_200_000);
    }

    #[test]
    fn test_audio_is_stopped() {
        let mut h = harness(StaticCapabilities::new(false, false))
            .with_video()
            .with_audio();
        h.targets.audio.configure().unwrap();
        assert!(h.targets.audio.is_configured());

        let mut r = TrickSmoothRenderer::new("test");
        r.set_speed(&mut h.targets, Some(RendererKind::Playback), 1.5)
            .unwrap();
        assert!(!h.targets.audio.is_configured());
    }

    #[test]
    fn test_freezes_before_end_of_stream() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        h.targets.position.set_end_position_us(Some(1_000_000));
        h.targets.position.set_position_us(500_000);
        h.feed_video((0..8).map(|i| i * 40_000));
        let mut r = TrickSmoothRenderer::new("test");
        r.set_speed(&mut h.targets, Some(RendererKind::Playback), 2.0)
            .unwrap();

        for _ in 0..3 {
            tick(&mut r, &mut h);
        }
        assert!(h.targets.video.is_clock_started());
        assert_eq!(h.targets.video.core().clock.speed(), 0.0);
    }

    #[test]
    fn test_new_position_flushes_video() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        let mut r = TrickSmoothRenderer::new("test");
        r.set_speed(&mut h.targets, Some(RendererKind::Playback), 2.0)
            .unwrap();
        h.feed_video((0..4).map(|i| i * 40_000));

        r.reset(&mut h.targets, ResetReason::NewPosition).unwrap();
        assert!(h.video_queue.is_empty());
    }

    #[test]
    fn test_leaving_clears_trick_mode() {
        let mut h = harness(StaticCapabilities::new(false, false)).with_video();
        let mut r = TrickSmoothRenderer::new("test");
        r.set_speed(&mut h.targets, Some(RendererKind::Playback), 2.0)
            .unwrap();
        tick(&mut r, &mut h);
        assert_eq!(h.video_decoder.trick_mode().0, VideoTrickMode::Smooth);

        r.reset(&mut h.targets, ResetReason::RendererChanged).unwrap();
        assert_eq!(h.targets.video.trick_mode(), VideoTrickMode::None);
        assert_eq!(h.video_decoder.trick_mode().0, VideoTrickMode::None);
    }
}
