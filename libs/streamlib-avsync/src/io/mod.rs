// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Boundaries to the collaborators the engine drives but does not own:
//! hardware decoders, the audio device, the demux input queues, platform
//! capabilities and the host event listener.

mod capabilities;
mod decoder;
mod decoder_events;
mod events;
mod input_queue;

pub use capabilities::{
    best_sample_rate, CapabilityChange, CapabilityNotifier, CapabilitySource, CapabilityWatch,
    StaticCapabilities,
};
pub use decoder::{
    AudioSink, AudioTimestamp, ConfigureOptions, DecoderError, DecoderResult, DecoderSink,
    Descrambler, MediaFormat, SinkFormat, VideoTrickMode,
};
pub use decoder_events::{BufferFlags, DecoderEvent, DecoderEventSender, OutputBufferInfo};
pub(crate) use decoder_events::DecoderEventChannel;
pub use events::{ChannelEventSink, EventSink, NullEventSink, PlaybackEvent, SharedEventSink};
pub use input_queue::{BoundedInputQueue, InputBuffer, InputBufferQueue, SharedInputQueue};

/// Elementary stream handled by an output path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => f.write_str("video"),
            TrackKind::Audio => f.write_str("audio"),
        }
    }
}
