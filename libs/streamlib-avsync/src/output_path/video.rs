// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::VecDeque;

use crate::clocks::SharedClock;
use crate::config::SyncConfig;
use crate::error::{AvSyncError, Result};
use crate::io::{
    ConfigureOptions, DecoderError, DecoderEvent, DecoderSink, Descrambler, MediaFormat,
    OutputBufferInfo, SharedInputQueue, TrackKind, VideoTrickMode,
};

use super::{IDLE_RENDER_DELAY_US, MediaOutputPath, OutputPathCore, PathNotice, RenderingMode};

/// A frame due further ahead than this means the clock is wrong.
const SYNC_MAX_DELTA_IN_FUTURE_US: i64 = 5_000_000;
/// Free-run frames are shown once they are this close to the clock.
const SYNC_RENDER_WINDOW_US: i64 = 20_000;
const MARGIN_FOR_VSYNC_US: i64 = 40_000;
/// Largest expected gap between audio and video timestamps of one instant.
const MAX_THRESHOLD_BETWEEN_PTS_US: i64 = 600_000;
const LATE_FRAME_THRESHOLD_US: i64 = -100_000;
const RENDER_NOW_THRESHOLD_US: i64 = 10_000;
const FREE_RUN_FRAME_STEP_US: i64 = 40_000;

#[derive(Debug, Clone, Copy)]
struct PendingOutput {
    index: usize,
    info: OutputBufferInfo,
}

pub struct VideoOutputPath {
    core: OutputPathCore,
    decoder: Box<dyn DecoderSink>,
    input_indexes: VecDeque<usize>,
    outputs: VecDeque<PendingOutput>,
    first_frame_displayed: bool,
    free_run_next_timestamp_us: i64,
    decoded_frames: u64,
    suspicious_timestamps: u64,
    trick_mode: VideoTrickMode,
    trick_speed: f64,
}

impl VideoOutputPath {
    pub fn new(decoder: Box<dyn DecoderSink>, wall: SharedClock, config: &SyncConfig) -> Self {
        Self {
            core: OutputPathCore::new(
                config.instance_id.clone(),
                TrackKind::Video,
                wall,
                config.configure_retry,
                config.discontinuity_threshold_us,
            ),
            decoder,
            input_indexes: VecDeque::new(),
            outputs: VecDeque::new(),
            first_frame_displayed: false,
            free_run_next_timestamp_us: 0,
            decoded_frames: 0,
            suspicious_timestamps: 0,
            trick_mode: VideoTrickMode::None,
            trick_speed: 0.0,
        }
    }

    pub fn set_params(
        &mut self,
        format: MediaFormat,
        queue: SharedInputQueue,
        descrambler: Option<Descrambler>,
    ) {
        tracing::info!("[{}] video params {:?}", self.core.id, format);
        self.core.format = Some(format);
        self.core.queue = Some(queue);
        self.core.descrambler = descrambler;
    }

    pub fn set_audio_session_id(&mut self, session_id: Option<u32>) {
        self.core.audio_session_id = session_id;
    }

    pub fn is_first_frame_displayed(&self) -> bool {
        self.first_frame_displayed
    }

    pub fn trick_mode(&self) -> VideoTrickMode {
        self.trick_mode
    }

    /// Drop everything in flight and restart the decoder on the same
    /// configuration.
    pub fn flush(&mut self) {
        tracing::debug!("[{}] flush VideoOutputPath", self.core.id);
        // Callbacks posted before the flush refer to buffers the decoder forgets.
        let _ = self.core.events.drain();
        if self.is_configured() {
            let result = self.decoder.flush().and_then(|()| self.decoder.start());
            if let Err(err) = result {
                self.core.set_error(err.to_string());
            }
        }
        self.first_frame_displayed = false;
        self.input_indexes.clear();
        self.outputs.clear();
        self.core.keeper.clear();
        if let Some(queue) = &self.core.queue {
            queue.clear();
        }
    }

    /// Show the first decoded frame and nothing more until the next flush.
    pub fn render_one_frame(&mut self) -> Result<()> {
        if self.first_frame_displayed {
            return Ok(());
        }
        if self.outputs.is_empty() {
            return Ok(());
        }
        self.display_frame()
    }

    /// Show the next decoded frame regardless of the clock.
    pub fn render_next_frame(&mut self) -> Result<bool> {
        if self.outputs.is_empty() {
            return Ok(false);
        }
        self.display_frame()?;
        Ok(true)
    }

    /// Decoded frames ahead of `timestamp_us` in the wrong playback
    /// direction are released without being shown.
    pub fn skip_frames_before(&mut self, timestamp_us: i64, forward: bool) -> Result<usize> {
        let mut skipped = 0;
        while let Some(head) = self.outputs.front() {
            let wrong_direction = if forward {
                head.info.timestamp_us < timestamp_us
            } else {
                head.info.timestamp_us > timestamp_us
            };
            if !wrong_direction {
                break;
            }
            self.consume()?;
            skipped += 1;
        }
        Ok(skipped)
    }

    pub fn set_trick_mode_speed(&mut self, speed: f64) -> Result<()> {
        self.trick_speed = speed;
        if !self.is_configured() {
            return Ok(());
        }
        let result = self.decoder.set_trick_mode(self.trick_mode, speed);
        self.core.absorb(result)
    }

    pub fn set_trick_mode(&mut self, mode: VideoTrickMode) -> Result<()> {
        if mode == self.trick_mode {
            return Ok(());
        }
        tracing::info!(
            "[{}] video trick mode {:?} -> {:?}",
            self.core.id,
            self.trick_mode,
            mode
        );
        self.trick_mode = mode;
        if !self.is_configured() {
            return Ok(());
        }
        let result = self.decoder.set_trick_mode(mode, self.trick_speed);
        self.core.absorb(result)
    }

    fn display_frame(&mut self) -> Result<()> {
        let Some(output) = self.outputs.pop_front() else {
            return Ok(());
        };
        let result = self.decoder.release_output_buffer(output.index, true);
        self.core.absorb(result)?;
        let timestamp_us = output.info.timestamp_us;
        self.core.keeper.remove_timestamp(timestamp_us)?;
        self.core.notify(PathNotice::FrameRendered { timestamp_us });
        self.first_frame_displayed = true;
        Ok(())
    }

    fn consume(&mut self) -> Result<()> {
        let Some(output) = self.outputs.pop_front() else {
            return Ok(());
        };
        let result = self.decoder.release_output_buffer(output.index, false);
        self.core.absorb(result)?;
        self.core.keeper.remove_timestamp(output.info.timestamp_us)
    }

    fn try_render_first_frame(&mut self) -> Result<i64> {
        if self.outputs.is_empty() {
            return Ok(5_000);
        }
        self.display_frame()?;
        Ok(IDLE_RENDER_DELAY_US)
    }

    fn render_free_run(&mut self) -> Result<i64> {
        let time_us = self.core.clock.time_us();
        if self.free_run_next_timestamp_us - time_us < SYNC_RENDER_WINDOW_US {
            self.display_frame()?;
            self.free_run_next_timestamp_us += FREE_RUN_FRAME_STEP_US;
        }
        Ok(self.free_run_next_timestamp_us - time_us)
    }

    fn render_synchro(&mut self) -> Result<i64> {
        let Some(head) = self.outputs.front().copied() else {
            return Ok(IDLE_RENDER_DELAY_US);
        };
        let delta_us = head.info.timestamp_us - self.core.clock.time_us();

        if delta_us < LATE_FRAME_THRESHOLD_US {
            tracing::info!(
                "[{}] skip frame (delta {}ms, input size {}ms, timestamp {}ms)",
                self.core.id,
                delta_us / 1000,
                self.core.input_size_us() / 1000,
                head.info.timestamp_us / 1000
            );
            self.consume()?;
            Ok(0)
        } else if delta_us < RENDER_NOW_THRESHOLD_US {
            self.display_frame()?;
            Ok((delta_us + MARGIN_FOR_VSYNC_US).max(0))
        } else if delta_us > SYNC_MAX_DELTA_IN_FUTURE_US {
            self.core
                .set_error(format!("delta {} too big, must reset", delta_us));
            Ok(0)
        } else {
            Ok(delta_us)
        }
    }

    fn on_output_buffer(&mut self, index: usize, info: OutputBufferInfo) -> Result<()> {
        self.decoded_frames += 1;
        if self.decoded_frames == 1 {
            self.core.notify(PathNotice::FirstFrameDecoded {
                timestamp_us: info.timestamp_us,
            });
        }

        if self.core.keeper.is_timestamp_out_of_range(info.timestamp_us)
            && self.core.rendering_mode() == RenderingMode::Synchronized
        {
            if self.suspicious_timestamps == 0 {
                tracing::info!(
                    "[{}] suspicious output buffer {}, timestamp[{}] not found in input timestamps",
                    self.core.id,
                    self.decoded_frames,
                    info.timestamp_us
                );
            }
            self.suspicious_timestamps += 1;
            let result = self.decoder.release_output_buffer(index, false);
            return self.core.absorb(result);
        }
        if self.suspicious_timestamps > 0 {
            tracing::info!(
                "[{}] back to acceptable output buffer {}, timestamp[{}], after {} incorrect buffers",
                self.core.id,
                self.decoded_frames,
                info.timestamp_us,
                self.suspicious_timestamps
            );
            self.suspicious_timestamps = 0;
        }
        self.outputs.push_back(PendingOutput { index, info });
        Ok(())
    }
}

impl MediaOutputPath for VideoOutputPath {
    fn core(&self) -> &OutputPathCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OutputPathCore {
        &mut self.core
    }

    fn configure(&mut self) -> Result<bool> {
        if !self.core.may_configure() {
            return Ok(false);
        }
        let Some(format) = self.core.format.clone() else {
            return Ok(false);
        };

        self.decoded_frames = 0;
        self.first_frame_displayed = false;
        self.input_indexes.clear();
        self.outputs.clear();

        let options = ConfigureOptions {
            tunneled: self.core.tunneled,
            audio_session_id: if self.core.tunneled {
                self.core.audio_session_id
            } else {
                None
            },
            descrambler: self.core.descrambler.clone(),
            trick_mode: self.trick_mode,
            trick_speed: self.trick_speed,
        };
        let events = self.core.events.open_session();
        tracing::info!(
            "[{}] configure video decoder {} mime:{} tunneled:{}",
            self.core.id,
            self.decoder.description(),
            format.mime,
            options.tunneled
        );

        match self
            .decoder
            .configure(&format, &options, events)
            .and_then(|()| self.decoder.start())
        {
            Ok(()) => {
                self.core.configuration_succeeded();
                Ok(true)
            }
            Err(DecoderError::Fatal(message)) => Err(AvSyncError::Codec(message)),
            Err(err) => {
                self.decoder.release();
                self.core.handle_configuration_error(err.to_string());
                Ok(false)
            }
        }
    }

    fn push_input_buffer(&mut self) -> Result<()> {
        if !self.is_configured() && !self.configure()? {
            return Ok(());
        }
        let Some(queue) = self.core.queue.clone() else {
            return Ok(());
        };

        self.core.start_push();
        let mut pushed = false;
        while !self.input_indexes.is_empty() && !queue.is_empty() && !self.core.is_push_timeout() {
            let Some(buffer) = queue.pop() else {
                break;
            };
            let Some(index) = self.input_indexes.pop_front() else {
                break;
            };
            if let Err(err) = self.decoder.queue_input_buffer(index, &buffer) {
                if let DecoderError::Fatal(message) = err {
                    return Err(AvSyncError::Codec(message));
                }
                self.core.set_error(err.to_string());
                break;
            }
            self.core.keeper.push_timestamp(buffer.timestamp_us);
            if self.core.keeper.has_discontinuity() {
                break;
            }
            pushed = true;
        }

        if pushed {
            self.core.notify_buffer_pushed();
        }
        self.core.timestamp_input_queue_full_if_needed();
        if self.core.keeper.has_discontinuity() {
            tracing::info!("[{}] video input discontinuity, reset decoder", self.core.id);
            self.reset();
        }
        Ok(())
    }

    fn pump_events(&mut self) -> Result<()> {
        for event in self.core.events.drain() {
            match event {
                DecoderEvent::InputBufferAvailable(index) => self.input_indexes.push_back(index),
                DecoderEvent::OutputBufferAvailable { index, info } => {
                    self.on_output_buffer(index, info)?
                }
                DecoderEvent::OutputFormatChanged(format) => {
                    tracing::info!("[{}] video output format {:?}", self.core.id, format);
                    self.core.notify(PathNotice::FormatChanged(format));
                }
                DecoderEvent::FrameRendered { timestamp_us } => {
                    if self.core.keeper.is_empty() {
                        continue;
                    }
                    self.core.keeper.remove_timestamp(timestamp_us)?;
                    self.first_frame_displayed = true;
                    self.core.notify(PathNotice::FrameRendered { timestamp_us });
                }
                DecoderEvent::Error { message, fatal } => {
                    if fatal {
                        return Err(AvSyncError::Codec(message));
                    }
                    self.core.set_error(message);
                    self.core.set_configured(false);
                }
            }
        }
        Ok(())
    }

    fn has_output_buffers(&self) -> bool {
        !self.outputs.is_empty()
    }

    fn output_buffer_count(&self) -> usize {
        self.outputs.len()
    }

    fn next_output_timestamp_us(&self) -> i64 {
        self.outputs.front().map_or(0, |o| o.info.timestamp_us)
    }

    fn margin_us(&self) -> i64 {
        MAX_THRESHOLD_BETWEEN_PTS_US
    }

    fn render(&mut self) -> Result<i64> {
        if self.core.tunneled {
            return Ok(IDLE_RENDER_DELAY_US);
        }
        if !self.first_frame_displayed {
            return self.try_render_first_frame();
        }
        if self.outputs.is_empty() || !self.core.clock.is_started() || self.core.clock.speed() == 0.0 {
            return Ok(IDLE_RENDER_DELAY_US);
        }
        match self.core.rendering_mode() {
            RenderingMode::FreeRun => self.render_free_run(),
            RenderingMode::Synchronized => self.render_synchro(),
            RenderingMode::None => Ok(IDLE_RENDER_DELAY_US),
        }
    }

    fn check_errors(&mut self) {
        if let Some(error) = self.core.error() {
            tracing::warn!("[{}] video error {}, reset decoder", self.core.id, error);
            self.reset();
        }
    }

    fn is_display_position_valid(&self) -> bool {
        self.core.clock.is_started()
    }

    fn display_position_us(&self) -> i64 {
        if !self.core.clock.is_started() {
            return 0;
        }
        self.core.clock.time_us() - MARGIN_FOR_VSYNC_US
    }

    fn reset(&mut self) {
        tracing::info!("[{}] reset VideoOutputPath", self.core.id);
        self.core.events.close_session();
        if self.is_configured() {
            if let Err(err) = self.decoder.flush() {
                tracing::error!("[{}] reset flush decoder error: {}", self.core.id, err);
            }
            self.decoder.stop();
        }
        self.first_frame_displayed = false;
        self.input_indexes.clear();
        self.outputs.clear();
        self.trick_speed = 0.0;
        self.core.reset();
    }

    fn release(&mut self) {
        self.reset();
        self.decoder.release();
        self.core.release();
    }

    fn set_free_run_mode(&mut self) {
        self.core.set_free_run_mode();
        self.free_run_next_timestamp_us = self.margin_us();
    }
}

impl std::fmt::Debug for VideoOutputPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoOutputPath")
            .field("decoder", &self.decoder.description())
            .field("config_state", self.core.config_state())
            .field("rendering_mode", &self.core.rendering_mode())
            .field("outputs", &self.outputs.len())
            .field("first_frame_displayed", &self.first_frame_displayed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::ManualClock;
    use crate::io::{BoundedInputQueue, InputBuffer, InputBufferQueue};
    use crate::testing::FakeDecoder;
    use std::sync::Arc;

    struct Fixture {
        wall: ManualClock,
        decoder: FakeDecoder,
        queue: Arc<BoundedInputQueue>,
        path: VideoOutputPath,
    }

    fn fixture() -> Fixture {
        let wall = ManualClock::starting_at_ms(1_000);
        let decoder = FakeDecoder::new(4);
        let queue = BoundedInputQueue::shared(64);
        let mut path = VideoOutputPath::new(
            Box::new(decoder.clone()),
            Arc::new(wall.clone()),
            &SyncConfig::default(),
        );
        path.set_params(
            MediaFormat::video("video/avc", 1920, 1080),
            queue.clone(),
            None,
        );
        Fixture {
            wall,
            decoder,
            queue,
            path,
        }
    }

    fn feed(queue: &BoundedInputQueue, timestamps: impl IntoIterator<Item = i64>) {
        for ts in timestamps {
            queue.push(InputBuffer::new(vec![0; 16], ts)).unwrap();
        }
    }

    #[test]
    fn test_configure_then_push() {
        let mut f = fixture();
        assert!(f.path.configure().unwrap());
        assert!(!f.path.configure().unwrap(), "second configure is a no-op");
        f.path.pump_events().unwrap();

        feed(&f.queue, (0..6).map(|i| i * 40_000));
        f.path.push_input_buffer().unwrap();
        assert_eq!(f.decoder.queued_timestamps().len(), 4, "one buffer per free slot");
        assert_eq!(f.queue.len(), 2);
        assert_eq!(f.path.take_notices(), vec![PathNotice::FirstData]);
    }

    #[test]
    fn test_configure_retries_then_gives_up() {
        let mut f = fixture();
        f.decoder.fail_configure(usize::MAX);
        for _ in 0..21 {
            assert!(!f.path.configure().unwrap());
            f.wall.advance_ms(100);
        }
        assert!(f.path.has_configuration_error());
        let attempts = f.decoder.configure_calls();
        assert_eq!(attempts, 21);
        f.wall.advance_ms(1_000);
        assert!(!f.path.configure().unwrap());
        assert_eq!(f.decoder.configure_calls(), attempts, "no attempt after terminal error");
    }

    #[test]
    fn test_fatal_configure_escapes() {
        let mut f = fixture();
        f.decoder.set_fatal_on_configure(true);
        let err = f.path.configure().unwrap_err();
        assert!(matches!(err, AvSyncError::Codec(_)));
    }

    #[test]
    fn test_first_frame_is_shown_without_clock() {
        let mut f = fixture();
        f.decoder.set_loopback(true);
        feed(&f.queue, [0, 40_000]);
        f.path.push_input_buffer().unwrap();
        f.path.pump_events().unwrap();
        f.path.push_input_buffer().unwrap();
        f.path.pump_events().unwrap();
        assert!(f.path.has_output_buffers());

        f.path.render().unwrap();
        assert!(f.path.is_first_frame_displayed());
        assert_eq!(f.decoder.rendered_timestamps(), vec![0]);
    }

    #[test]
    fn test_synchro_render_thresholds() {
        let mut f = fixture();
        f.decoder.set_loopback(true);
        f.path.configure().unwrap();
        f.path.pump_events().unwrap();
        feed(&f.queue, [0, 40_000, 80_000, 400_000]);
        f.path.push_input_buffer().unwrap();
        f.path.pump_events().unwrap();

        f.path.render().unwrap();
        f.path.set_synchro_on(200_000);

        // 40ms and 80ms are more than 100ms late.
        assert_eq!(f.path.render().unwrap(), 0);
        assert_eq!(f.path.render().unwrap(), 0);
        assert_eq!(f.path.output_buffer_count(), 1);
        assert_eq!(f.decoder.rendered_timestamps(), vec![0]);

        // 400ms is 200ms ahead: wait for it.
        assert_eq!(f.path.render().unwrap(), 200_000);
        f.wall.advance_ms(195);
        let delay = f.path.render().unwrap();
        assert_eq!(delay, 45_000);
        assert_eq!(f.decoder.rendered_timestamps(), vec![0, 400_000]);
        assert!(f.path.is_input_empty());
    }

    #[test]
    fn test_far_future_frame_is_an_error() {
        let mut f = fixture();
        f.decoder.set_loopback(true);
        f.path.configure().unwrap();
        f.path.pump_events().unwrap();
        feed(&f.queue, [0, 40_000]);
        f.path.push_input_buffer().unwrap();
        f.path.pump_events().unwrap();
        f.path.render().unwrap();

        f.path.set_synchro_on(-6_000_000);
        f.path.render().unwrap();
        assert!(f.path.core().error().is_some());
        f.path.check_errors();
        assert!(!f.path.is_configured());
        assert!(!f.path.has_output_buffers());
    }

    #[test]
    fn test_discontinuity_resets_path() {
        let mut f = fixture();
        f.path.configure().unwrap();
        f.path.pump_events().unwrap();
        feed(&f.queue, [0, 40_000, 5_000_000]);
        f.path.push_input_buffer().unwrap();
        assert!(!f.path.is_configured());
        assert!(f.path.is_input_empty());
    }

    #[test]
    fn test_free_run_advances_in_fixed_steps() {
        let mut f = fixture();
        f.decoder.set_loopback(true);
        f.path.configure().unwrap();
        f.path.pump_events().unwrap();
        feed(&f.queue, [0, 40_000, 80_000]);
        f.path.push_input_buffer().unwrap();
        f.path.pump_events().unwrap();
        f.path.render().unwrap();

        f.path.set_free_run_mode();
        assert_eq!(f.path.render().unwrap(), 600_000);
        f.wall.advance_ms(590);
        assert_eq!(f.path.render().unwrap(), 50_000);
        assert_eq!(f.decoder.rendered_timestamps(), vec![0, 40_000]);
    }

    #[test]
    fn test_stale_session_output_is_dropped_after_reset() {
        let mut f = fixture();
        f.path.configure().unwrap();
        let stale = f.decoder.event_sender().unwrap();
        f.path.reset();
        stale.send(DecoderEvent::OutputBufferAvailable {
            index: 0,
            info: OutputBufferInfo {
                timestamp_us: 0,
                size: 1,
                flags: Default::default(),
            },
        });
        f.path.pump_events().unwrap();
        assert!(!f.path.has_output_buffers());
    }

    #[test]
    fn test_fatal_decoder_event_escapes() {
        let mut f = fixture();
        f.path.configure().unwrap();
        f.decoder.post(DecoderEvent::Error {
            message: "hardware hang".into(),
            fatal: true,
        });
        assert!(matches!(f.path.pump_events(), Err(AvSyncError::Codec(_))));
    }

    #[test]
    fn test_flush_clears_queue_and_reissues_slots() {
        let mut f = fixture();
        f.path.configure().unwrap();
        f.path.pump_events().unwrap();
        feed(&f.queue, (0..8).map(|i| i * 40_000));
        f.path.push_input_buffer().unwrap();
        f.path.flush();
        assert!(f.queue.is_empty());
        assert!(f.path.is_input_empty());
        f.path.pump_events().unwrap();
        feed(&f.queue, [1_000_000]);
        f.path.push_input_buffer().unwrap();
        assert_eq!(f.decoder.queued_timestamps().last(), Some(&1_000_000));
    }

    #[test]
    fn test_trick_mode_is_forwarded() {
        let mut f = fixture();
        f.path.configure().unwrap();
        f.path.set_trick_mode(VideoTrickMode::IOnly).unwrap();
        f.path.set_trick_mode_speed(8_000.0).unwrap();
        assert_eq!(f.decoder.trick_mode(), (VideoTrickMode::IOnly, 8_000.0));
    }
}
