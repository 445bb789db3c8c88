// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::VecDeque;
use std::sync::Arc;

use crate::audio_position::AudioPositionTracker;
use crate::clocks::SharedClock;
use crate::config::SyncConfig;
use crate::error::{AvSyncError, Result};
use crate::io::{
    best_sample_rate, AudioSink, CapabilitySource, ConfigureOptions, DecoderError, DecoderEvent,
    DecoderSink, Descrambler, MediaFormat, OutputBufferInfo, SharedInputQueue, SinkFormat,
    TrackKind,
};

use super::{IDLE_RENDER_DELAY_US, MediaOutputPath, OutputPathCore, PathNotice, RenderingMode};

const DEFAULT_MARGIN_US: i64 = 200_000;
const MAX_WRITE_TIME_MS: i64 = 10;
/// Delay after a partial write, the sink is full.
const SINK_FULL_DELAY_US: i64 = 20_000;
const WRITE_AGAIN_DELAY_US: i64 = 5_000;

#[derive(Debug, Clone, Copy)]
struct PendingOutput {
    index: usize,
    info: OutputBufferInfo,
}

/// Decoded PCM taken from the decoder and not yet fully accepted by the sink.
#[derive(Debug)]
struct PendingWrite {
    data: Vec<u8>,
    offset: usize,
    timestamp_us: i64,
}

impl PendingWrite {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

pub struct AudioOutputPath {
    core: OutputPathCore,
    decoder: Box<dyn DecoderSink>,
    sink: Box<dyn AudioSink>,
    capabilities: Arc<dyn CapabilitySource>,
    tracker: AudioPositionTracker,
    input_indexes: VecDeque<usize>,
    outputs: VecDeque<PendingOutput>,
    pending: Option<PendingWrite>,
    sink_format: Option<SinkFormat>,
    sink_buffer_duration_us: i64,
    /// Bytes accepted by the sink since it last started from empty.
    sink_bytes: usize,
    /// Bytes taken from the decoder since the sink was configured.
    decoded_bytes: i64,
    priming_done: bool,
    first_timestamp_us: Option<i64>,
    last_underrun_count: u32,
    gain: f32,
    muted: bool,
    format_changed: bool,
    decoded_frames: u64,
}

impl AudioOutputPath {
    pub fn new(
        decoder: Box<dyn DecoderSink>,
        sink: Box<dyn AudioSink>,
        capabilities: Arc<dyn CapabilitySource>,
        wall: SharedClock,
        config: &SyncConfig,
    ) -> Self {
        Self {
            core: OutputPathCore::new(
                config.instance_id.clone(),
                TrackKind::Audio,
                wall.clone(),
                config.configure_retry,
                config.discontinuity_threshold_us,
            ),
            decoder,
            sink,
            capabilities,
            tracker: AudioPositionTracker::new(config.instance_id.clone(), wall),
            input_indexes: VecDeque::new(),
            outputs: VecDeque::new(),
            pending: None,
            sink_format: None,
            sink_buffer_duration_us: 0,
            sink_bytes: 0,
            decoded_bytes: 0,
            priming_done: false,
            first_timestamp_us: None,
            last_underrun_count: 0,
            gain: 1.0,
            muted: false,
            format_changed: false,
            decoded_frames: 0,
        }
    }

    /// Install stream parameters. A format change on a running track is
    /// applied by the next `push_input_buffer`.
    pub fn set_params(
        &mut self,
        format: MediaFormat,
        queue: SharedInputQueue,
        descrambler: Option<Descrambler>,
    ) {
        if let Some(previous) = &self.core.format {
            self.format_changed = self.has_format_changed(previous, &format);
        }
        tracing::info!(
            "[{}] audio params {:?} changed:{}",
            self.core.id,
            format,
            self.format_changed
        );
        self.core.format = Some(format);
        self.core.queue = Some(queue);
        self.core.descrambler = descrambler;
    }

    pub fn set_audio_session_id(&mut self, session_id: Option<u32>) {
        self.core.audio_session_id = session_id;
    }

    fn has_format_changed(&self, previous: &MediaFormat, next: &MediaFormat) -> bool {
        if previous.mime != next.mime {
            return true;
        }
        if self.core.tunneled {
            return false;
        }
        if previous.sample_rate != next.sample_rate {
            return true;
        }
        if previous.is_ac3_family() {
            return false;
        }
        previous.channel_count != next.channel_count
    }

    pub fn is_playing(&self) -> bool {
        self.sink_format.is_some() && self.sink.is_playing()
    }

    pub fn pause(&mut self) {
        if self.sink_format.is_none() {
            return;
        }
        self.sink.pause();
        self.tracker.suspend();
    }

    pub fn resume(&mut self) {
        if self.sink_format.is_none() {
            return;
        }
        self.sink.play();
        self.tracker.resume();
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.gain = if muted { 0.0 } else { 1.0 };
        self.apply_volume();
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Values outside `0..=1` are ignored.
    pub fn set_volume(&mut self, volume: f32) {
        if !(0.0..=1.0).contains(&volume) {
            tracing::warn!("[{}] volume {} out of range, ignored", self.core.id, volume);
            return;
        }
        self.gain = volume;
        self.apply_volume();
    }

    pub fn volume(&self) -> f32 {
        self.gain
    }

    pub fn tracker(&self) -> &AudioPositionTracker {
        &self.tracker
    }

    fn apply_volume(&mut self) {
        if self.sink_format.is_some() {
            self.sink.set_volume(self.gain);
        }
    }

    fn sink_sample_rate(&self, preferred: u32) -> u32 {
        if !self.core.tunneled {
            return preferred;
        }
        let caps = &self.capabilities;
        if !caps.is_hdmi_plugged() || caps.is_bluetooth_sink_ready() {
            tracing::warn!(
                "[{}] unexpected output configuration in tunneled mode: hdmi plugged:{} bluetooth:{}",
                self.core.id,
                caps.is_hdmi_plugged(),
                caps.is_bluetooth_sink_ready()
            );
            return preferred;
        }
        best_sample_rate(&caps.hdmi_sample_rates(), preferred)
    }

    fn configure_sink(&mut self, format: SinkFormat) -> Result<()> {
        if self.sink_format == Some(format) {
            self.sink.pause();
            self.sink.flush();
        } else {
            let result = self.sink.configure(&format);
            if let Err(err) = result {
                self.sink_format = None;
                return self.core.absorb(Err(err));
            }
            self.sink_buffer_duration_us = format.bytes_to_us(self.sink.buffer_size_bytes());
            tracing::info!(
                "[{}] audio sink [{}Hz, {}ch, buffer[size:{}, duration:{}us], session-id:{:?}]",
                self.core.id,
                format.sample_rate,
                format.channel_count,
                self.sink.buffer_size_bytes(),
                self.sink_buffer_duration_us,
                self.core.audio_session_id
            );
        }
        self.sink_format = Some(format);
        self.decoded_bytes = 0;
        self.last_underrun_count = self.sink.underrun_count();
        self.restart_sink_priming();
        self.tracker.set_audio_sink(self.sink.as_ref(), &format);
        self.sink.pause();
        self.tracker.suspend();
        self.sink.set_volume(self.gain);
        Ok(())
    }

    fn restart_sink_priming(&mut self) {
        self.sink_bytes = 0;
        self.priming_done = false;
        self.first_timestamp_us = None;
    }

    fn release_sink(&mut self) {
        if self.sink_format.is_some() {
            self.sink.pause();
            self.sink.flush();
        }
        self.tracker.stop();
        self.pending = None;
        self.restart_sink_priming();
    }

    fn head_timestamp_us(&self) -> Option<i64> {
        match &self.pending {
            Some(pending) => Some(pending.timestamp_us),
            None => self.outputs.front().map(|o| o.info.timestamp_us),
        }
    }

    fn has_data(&self) -> bool {
        self.pending.is_some() || !self.outputs.is_empty()
    }

    fn consume(&mut self) -> Result<()> {
        if self.pending.take().is_some() {
            return Ok(());
        }
        let Some(output) = self.outputs.pop_front() else {
            return Ok(());
        };
        let result = self.decoder.release_output_buffer(output.index, false);
        self.core.absorb(result)?;
        self.core.keeper.remove_timestamp(output.info.timestamp_us)
    }

    /// Take the next decoded buffer out of the decoder.
    fn fill_pending(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        let Some(output) = self.outputs.pop_front() else {
            return Ok(false);
        };
        let timestamp_us = output.info.timestamp_us;
        self.tracker
            .update_reference_in_bytes(self.decoded_bytes, timestamp_us);
        self.decoded_bytes += output.info.size as i64;

        // Decoders without CPU-visible output contribute silence of the
        // reported size.
        let data = self
            .decoder
            .output_buffer(output.index)
            .unwrap_or_else(|| vec![0; output.info.size]);
        let result = self.decoder.release_output_buffer(output.index, false);
        self.core.absorb(result)?;
        self.core.keeper.remove_timestamp(timestamp_us)?;
        self.core.notify(PathNotice::FrameRendered { timestamp_us });

        self.pending = Some(PendingWrite {
            data,
            offset: 0,
            timestamp_us,
        });
        Ok(true)
    }

    fn write_pending(&mut self) -> Result<i64> {
        let started_ms = self.core.wall.now_ms();
        loop {
            if !self.fill_pending()? {
                return Ok(IDLE_RENDER_DELAY_US);
            }
            let Some(pending) = self.pending.as_mut() else {
                return Ok(IDLE_RENDER_DELAY_US);
            };
            let remaining = pending.remaining();
            if remaining == 0 {
                self.pending = None;
                continue;
            }

            let written = match self
                .sink
                .write(&pending.data[pending.offset..], pending.timestamp_us)
            {
                Ok(written) => written,
                Err(DecoderError::Fatal(message)) => return Err(AvSyncError::Codec(message)),
                Err(err) => {
                    self.core.set_error(format!("error while writing data: {}", err));
                    return Ok(SINK_FULL_DELAY_US);
                }
            };
            pending.offset += written;
            self.sink_bytes += written;
            self.priming_done |=
                written != remaining && self.sink_bytes >= self.sink.buffer_size_bytes() * 9 / 10;
            if written != remaining {
                return Ok(SINK_FULL_DELAY_US);
            }
            self.pending = None;

            if self.core.wall.now_ms() - started_ms >= MAX_WRITE_TIME_MS {
                return Ok(WRITE_AGAIN_DELAY_US);
            }
        }
    }

    fn render_free_run(&mut self) -> Result<i64> {
        if !self.has_data() {
            return Ok(IDLE_RENDER_DELAY_US);
        }
        self.tracker.update_position(self.sink.as_mut());
        if !self.sink.is_playing() {
            self.sink.play();
            self.tracker.resume();
        }
        self.write_pending()
    }

    fn render_synchro(&mut self) -> Result<i64> {
        if self.sink.is_playing() {
            let underruns = self.sink.underrun_count();
            if underruns > self.last_underrun_count {
                self.last_underrun_count = underruns;
                if !self.has_data() {
                    tracing::info!(
                        "[{}] underrun detected, input size:{}us underrun:{}",
                        self.core.id,
                        self.core.queue_size_us(),
                        underruns
                    );
                    self.sink.pause();
                    self.tracker.suspend();
                    self.restart_sink_priming();
                    return Ok(IDLE_RENDER_DELAY_US);
                }
            }
        }
        if !self.has_data() {
            return Ok(IDLE_RENDER_DELAY_US);
        }

        self.tracker.update_position(self.sink.as_mut());
        let mut time_us = self.core.clock.time_us();
        let Some(mut timestamp_us) = self.head_timestamp_us() else {
            return Ok(IDLE_RENDER_DELAY_US);
        };

        if !self.sink.is_playing() {
            let queue_us = self.core.queue_size_us();
            let mut discarded = 0usize;
            let mut exhausted = false;
            while timestamp_us + self.sink_buffer_duration_us < time_us && self.sink_bytes == 0 {
                discarded += 1;
                self.consume()?;
                time_us = self.core.clock.time_us();
                match self.head_timestamp_us() {
                    Some(next) => timestamp_us = next,
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
            if exhausted {
                if discarded > 0
                    && timestamp_us + self.sink_buffer_duration_us + queue_us < time_us
                {
                    tracing::warn!(
                        "[{}] suspicious clock, discarded {} buffers, clock:{}ms, inputs:{}ms",
                        self.core.id,
                        discarded,
                        time_us / 1000,
                        queue_us / 1000
                    );
                }
                return Ok(if queue_us > 0 { 1_000 } else { 40_000 });
            }
        }

        let first_timestamp_us = *self.first_timestamp_us.get_or_insert(timestamp_us);
        if !self.sink.is_playing() && self.priming_done && first_timestamp_us < time_us {
            tracing::info!(
                "[{}] audio start, first delta:{}ms (time:{}ms, timestamp:{}ms) pushed:{} buffer-size:{}",
                self.core.id,
                (time_us - first_timestamp_us) / 1000,
                time_us / 1000,
                first_timestamp_us / 1000,
                self.sink_bytes,
                self.sink.buffer_size_bytes()
            );
            self.sink.play();
            self.tracker.resume();
        }
        self.write_pending()
    }

    fn on_output_format_changed(&mut self, format: MediaFormat) -> Result<()> {
        tracing::info!("[{}] audio output format {:?}", self.core.id, format);
        let current = self.sink_format;
        let sink_format = SinkFormat {
            sample_rate: if format.sample_rate > 0 {
                format.sample_rate
            } else {
                current.map_or(48_000, |f| f.sample_rate)
            },
            channel_count: if format.channel_count > 0 {
                format.channel_count
            } else {
                current.map_or(2, |f| f.channel_count)
            },
        };
        self.pending = None;
        self.configure_sink(sink_format)?;
        self.core.notify(PathNotice::FormatChanged(format));
        Ok(())
    }
}

impl MediaOutputPath for AudioOutputPath {
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

        let sample_rate = self.sink_sample_rate(format.sample_rate);
        let adjusted = MediaFormat {
            sample_rate,
            ..format
        };
        self.input_indexes.clear();
        self.outputs.clear();
        self.pending = None;
        self.decoded_frames = 0;
        self.format_changed = false;

        let options = ConfigureOptions {
            tunneled: self.core.tunneled,
            audio_session_id: if self.core.tunneled {
                self.core.audio_session_id
            } else {
                None
            },
            descrambler: self.core.descrambler.clone(),
            ..ConfigureOptions::default()
        };
        let events = self.core.events.open_session();
        tracing::info!(
            "[{}] configure audio decoder {} mime:{} {}Hz {}ch tunneled:{}",
            self.core.id,
            self.decoder.description(),
            adjusted.mime,
            adjusted.sample_rate,
            adjusted.channel_count,
            options.tunneled
        );

        match self
            .decoder
            .configure(&adjusted, &options, events)
            .and_then(|()| self.decoder.start())
        {
            Ok(()) => {
                self.configure_sink(SinkFormat {
                    sample_rate: adjusted.sample_rate,
                    channel_count: adjusted.channel_count,
                })?;
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
        if self.format_changed && self.is_configured() {
            tracing::info!(
                "[{}] audio input format has changed ({:?})",
                self.core.id,
                self.core.format
            );
            self.core.events.close_session();
            self.decoder.stop();
            self.core.set_configured(false);
        }
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
            pushed = true;
            self.core.keeper.push_timestamp(buffer.timestamp_us);
            if self.core.keeper.has_discontinuity() {
                break;
            }
        }

        self.core.timestamp_input_queue_full_if_needed();
        if pushed {
            self.core.notify_buffer_pushed();
        }
        if self.core.keeper.has_discontinuity() {
            tracing::info!("[{}] audio input discontinuity, reset decoder", self.core.id);
            self.reset();
        }
        Ok(())
    }

    fn pump_events(&mut self) -> Result<()> {
        for event in self.core.events.drain() {
            match event {
                DecoderEvent::InputBufferAvailable(index) => self.input_indexes.push_back(index),
                DecoderEvent::OutputBufferAvailable { index, info } => {
                    if self.sink_format.is_none() {
                        tracing::warn!("[{}] no audio sink, ignore output {}", self.core.id, index);
                        let result = self.decoder.release_output_buffer(index, false);
                        self.core.absorb(result)?;
                        continue;
                    }
                    self.decoded_frames += 1;
                    if self.decoded_frames == 1 {
                        self.core.notify(PathNotice::FirstFrameDecoded {
                            timestamp_us: info.timestamp_us,
                        });
                    }
                    self.outputs.push_back(PendingOutput { index, info });
                }
                DecoderEvent::OutputFormatChanged(format) => self.on_output_format_changed(format)?,
                DecoderEvent::FrameRendered { timestamp_us } => {
                    tracing::trace!("[{}] audio frame rendered {}", self.core.id, timestamp_us);
                }
                DecoderEvent::Error { message, fatal } => {
                    if fatal {
                        return Err(AvSyncError::Codec(message));
                    }
                    self.core.set_error(message);
                }
            }
        }
        Ok(())
    }

    fn has_output_buffers(&self) -> bool {
        self.has_data()
    }

    fn output_buffer_count(&self) -> usize {
        self.outputs.len() + usize::from(self.pending.is_some())
    }

    fn next_output_timestamp_us(&self) -> i64 {
        self.head_timestamp_us().unwrap_or(0)
    }

    fn margin_us(&self) -> i64 {
        DEFAULT_MARGIN_US
    }

    fn render(&mut self) -> Result<i64> {
        if self.sink_format.is_none() || !self.core.clock.is_started() {
            return Ok(IDLE_RENDER_DELAY_US);
        }
        if self.core.clock.speed() == 0.0 {
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
            tracing::warn!("[{}] audio error {}, reset", self.core.id, error);
            self.reset();
        }
    }

    fn is_display_position_valid(&self) -> bool {
        self.sink_format.is_some() && self.tracker.is_position_valid()
    }

    fn display_position_us(&self) -> i64 {
        if !self.is_display_position_valid() {
            return 0;
        }
        self.tracker.position_us()
    }

    fn reset(&mut self) {
        tracing::info!("[{}] reset AudioOutputPath", self.core.id);
        self.core.events.close_session();
        if self.is_configured() {
            self.decoder.stop();
        }
        self.release_sink();
        self.input_indexes.clear();
        self.outputs.clear();
        self.format_changed = false;
        self.core.reset();
    }

    fn release(&mut self) {
        self.reset();
        self.decoder.release();
        self.sink_format = None;
        self.muted = false;
        self.gain = 1.0;
        self.core.release();
    }

    fn set_synchro_on(&mut self, origin_us: i64) {
        self.core.set_synchro_on(origin_us);
        self.tracker.stop();
        if self.is_playing() {
            self.sink.pause();
            self.tracker.suspend();
        }
    }

    fn set_free_run_mode(&mut self) {
        self.core.set_free_run_mode();
        self.tracker.stop();
        if self.is_playing() {
            self.sink.pause();
            self.tracker.suspend();
        }
    }

    fn set_speed(&mut self, speed: f64) {
        self.core.set_speed(speed);
        if self.sink_format.is_none() {
            return;
        }
        if speed == 0.0 {
            self.sink.pause();
            self.tracker.suspend();
        } else if speed == 1.0 {
            if self.sink_bytes > 0 {
                self.sink.play();
                self.tracker.resume();
            }
        } else {
            tracing::warn!("[{}] unexpected audio speed {}, should be 0 or 1", self.core.id, speed);
        }
    }
}

impl std::fmt::Debug for AudioOutputPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioOutputPath")
            .field("decoder", &self.decoder.description())
            .field("config_state", self.core.config_state())
            .field("rendering_mode", &self.core.rendering_mode())
            .field("sink_format", &self.sink_format)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}
