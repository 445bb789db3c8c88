// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::decoder_events::DecoderEventSender;
use super::input_queue::InputBuffer;

/// Fault reported by a decoder or audio device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecoderError {
    /// The format or parameters were refused. Retried with backoff.
    #[error("configuration refused: {0}")]
    Configuration(String),

    /// The operation failed but the codec is still usable after a reset.
    #[error("transient decoder fault: {0}")]
    Transient(String),

    /// The codec is gone; playback cannot continue.
    #[error("fatal decoder fault: {0}")]
    Fatal(String),
}

pub type DecoderResult<T> = std::result::Result<T, DecoderError>;

/// Stream parameters of one elementary stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaFormat {
    pub mime: String,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channel_count: u16,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl MediaFormat {
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width,
            height,
            ..Self::default()
        }
    }

    pub fn audio(mime: impl Into<String>, sample_rate: u32, channel_count: u16) -> Self {
        Self {
            mime: mime.into(),
            sample_rate,
            channel_count,
            ..Self::default()
        }
    }

    /// Dolby streams whose channel layout is decided by the decoder.
    pub fn is_ac3_family(&self) -> bool {
        matches!(self.mime.as_str(), "audio/ac3" | "audio/eac3" | "audio/eac3-joc")
    }
}

/// Opaque descrambling session attached to a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descrambler {
    pub session_id: u32,
}

/// Trick behaviour requested from a video decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoTrickMode {
    #[default]
    None,
    Smooth,
    BySeek,
    /// Decode and output key frames only.
    IOnly,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigureOptions {
    pub tunneled: bool,
    /// Hardware A/V sync id shared by the two decoders of a tunneled session.
    pub audio_session_id: Option<u32>,
    pub descrambler: Option<Descrambler>,
    pub trick_mode: VideoTrickMode,
    pub trick_speed: f64,
}

/// Asynchronous hardware decoder.
///
/// Input slots, output buffers, format changes and errors are reported through
/// the [`DecoderEventSender`] handed to `configure`. Events are drained on the
/// scheduler thread only.
pub trait DecoderSink: Send {
    fn configure(
        &mut self,
        format: &MediaFormat,
        options: &ConfigureOptions,
        events: DecoderEventSender,
    ) -> DecoderResult<()>;

    fn start(&mut self) -> DecoderResult<()>;

    /// Drop every queued input and pending output. Slot indexes are reissued.
    fn flush(&mut self) -> DecoderResult<()>;

    fn stop(&mut self);

    fn release(&mut self);

    fn queue_input_buffer(&mut self, index: usize, buffer: &InputBuffer) -> DecoderResult<()>;

    /// Return an output buffer, presenting it when `render` is set.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> DecoderResult<()>;

    /// Decoded payload of an output buffer (PCM for audio decoders).
    fn output_buffer(&mut self, _index: usize) -> Option<Vec<u8>> {
        None
    }

    fn set_trick_mode(&mut self, _mode: VideoTrickMode, _speed: f64) -> DecoderResult<()> {
        Ok(())
    }

    fn description(&self) -> &str;
}

/// Device-reported rendering progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTimestamp {
    /// Frames presented so far, wraps at 32 bits.
    pub frame_position: u32,
    /// Device time of `frame_position`, in nanoseconds.
    pub nano_time: i64,
}

/// PCM layout of an audio sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkFormat {
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl SinkFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.channel_count.max(1) as usize * 2
    }

    pub fn bytes_to_us(&self, bytes: usize) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (bytes / self.bytes_per_frame()) as i64 * 1_000_000 / self.sample_rate as i64
    }
}

/// Audio output device.
pub trait AudioSink: Send {
    fn configure(&mut self, format: &SinkFormat) -> DecoderResult<()>;

    /// Non-blocking write; returns how many bytes were accepted.
    fn write(&mut self, data: &[u8], timestamp_us: i64) -> DecoderResult<usize>;

    fn play(&mut self);

    fn pause(&mut self);

    fn flush(&mut self);

    fn is_playing(&self) -> bool;

    fn buffer_size_bytes(&self) -> usize;

    /// Latest (frames, device time) sample, when the device provides one.
    fn timestamp(&mut self) -> Option<AudioTimestamp>;

    /// Frames presented so far, wraps at 32 bits.
    fn playback_head_position(&mut self) -> u32;

    fn underrun_count(&self) -> u32 {
        0
    }

    /// Static output latency estimate.
    fn latency_us(&self) -> i64 {
        0
    }

    fn set_volume(&mut self, _gain: f32) {}
}
