// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Deterministic collaborators for tests and benches.
//!
//! Every fake is a cheap handle over shared state: keep a clone to drive or
//! inspect it after handing the other clone to the engine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::io::{
    AudioSink, AudioTimestamp, BufferFlags, CapabilityChange, CapabilityNotifier,
    CapabilitySource, ConfigureOptions, DecoderError, DecoderEvent, DecoderEventSender,
    DecoderResult, DecoderSink, EventSink, InputBuffer, MediaFormat, OutputBufferInfo,
    PlaybackEvent, SinkFormat, VideoTrickMode,
};

pub use crate::clocks::ManualClock;

// ============================================================================
// FakeDecoder
// ============================================================================

#[derive(Default)]
struct FakeDecoderState {
    input_slots: usize,
    events: Option<DecoderEventSender>,
    loopback: bool,
    output_size: Option<usize>,
    next_output_index: usize,
    outputs: HashMap<usize, OutputBufferInfo>,
    configure_failures: usize,
    fatal_on_configure: bool,
    configure_calls: usize,
    last_format: Option<MediaFormat>,
    last_options: Option<ConfigureOptions>,
    queued: Vec<i64>,
    rendered: Vec<i64>,
    dropped: Vec<i64>,
    trick: (VideoTrickMode, f64),
    started: bool,
    flushes: usize,
}

impl FakeDecoderState {
    fn post(&self, event: DecoderEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    fn emit_output(&mut self, info: OutputBufferInfo) -> usize {
        let index = self.next_output_index;
        self.next_output_index += 1;
        self.outputs.insert(index, info);
        self.post(DecoderEvent::OutputBufferAvailable { index, info });
        index
    }
}

/// Decoder with a fixed number of input slots.
///
/// In loopback mode every queued input comes straight back as a decoded
/// output with the same timestamp and its slot is handed out again. While the
/// I-frame trick mode is active only key frames come back.
#[derive(Clone)]
pub struct FakeDecoder {
    state: Arc<Mutex<FakeDecoderState>>,
}

impl FakeDecoder {
    pub fn new(input_slots: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeDecoderState {
                input_slots,
                ..FakeDecoderState::default()
            })),
        }
    }

    pub fn set_loopback(&self, loopback: bool) {
        self.state.lock().loopback = loopback;
    }

    /// Size reported for loopback outputs instead of the input payload size.
    pub fn set_output_size(&self, bytes: usize) {
        self.state.lock().output_size = Some(bytes);
    }

    /// Refuse the next `count` configure calls.
    pub fn fail_configure(&self, count: usize) {
        self.state.lock().configure_failures = count;
    }

    pub fn set_fatal_on_configure(&self, fatal: bool) {
        self.state.lock().fatal_on_configure = fatal;
    }

    pub fn configure_calls(&self) -> usize {
        self.state.lock().configure_calls
    }

    pub fn last_format(&self) -> Option<MediaFormat> {
        self.state.lock().last_format.clone()
    }

    pub fn last_options(&self) -> Option<ConfigureOptions> {
        self.state.lock().last_options.clone()
    }

    pub fn queued_timestamps(&self) -> Vec<i64> {
        self.state.lock().queued.clone()
    }

    pub fn rendered_timestamps(&self) -> Vec<i64> {
        self.state.lock().rendered.clone()
    }

    /// Outputs released without being presented.
    pub fn dropped_timestamps(&self) -> Vec<i64> {
        self.state.lock().dropped.clone()
    }

    pub fn trick_mode(&self) -> (VideoTrickMode, f64) {
        self.state.lock().trick
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    /// Sender of the current session, as handed over by `configure`.
    pub fn event_sender(&self) -> Option<DecoderEventSender> {
        self.state.lock().events.clone()
    }

    /// Post a callback on the current session.
    pub fn post(&self, event: DecoderEvent) {
        self.state.lock().post(event);
    }

    /// Produce a decoded output without a matching input.
    pub fn emit_output(&self, timestamp_us: i64, size: usize) -> usize {
        self.state.lock().emit_output(OutputBufferInfo {
            timestamp_us,
            size,
            flags: BufferFlags::empty(),
        })
    }
}

impl DecoderSink for FakeDecoder {
    fn configure(
        &mut self,
        format: &MediaFormat,
        options: &ConfigureOptions,
        events: DecoderEventSender,
    ) -> DecoderResult<()> {
        let mut state = self.state.lock();
        state.configure_calls += 1;
        if state.fatal_on_configure {
            return Err(DecoderError::Fatal("decoder died during configure".to_string()));
        }
        if state.configure_failures > 0 {
            state.configure_failures -= 1;
            return Err(DecoderError::Configuration(format!(
                "no decoder for {}",
                format.mime
            )));
        }
        state.events = Some(events);
        state.last_format = Some(format.clone());
        state.last_options = Some(options.clone());
        state.trick = (options.trick_mode, options.trick_speed);
        state.outputs.clear();
        Ok(())
    }

    fn start(&mut self) -> DecoderResult<()> {
        let mut state = self.state.lock();
        state.started = true;
        for index in 0..state.input_slots {
            state.post(DecoderEvent::InputBufferAvailable(index));
        }
        Ok(())
    }

    fn flush(&mut self) -> DecoderResult<()> {
        let mut state = self.state.lock();
        state.flushes += 1;
        state.started = false;
        state.outputs.clear();
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        state.started = false;
        state.outputs.clear();
    }

    fn release(&mut self) {
        let mut state = self.state.lock();
        state.started = false;
        state.events = None;
        state.outputs.clear();
    }

    fn queue_input_buffer(&mut self, index: usize, buffer: &InputBuffer) -> DecoderResult<()> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(DecoderError::Transient("decoder not started".to_string()));
        }
        state.queued.push(buffer.timestamp_us);
        if !state.loopback {
            return Ok(());
        }
        state.post(DecoderEvent::InputBufferAvailable(index));
        let key_frames_only = state.trick.0 == VideoTrickMode::IOnly;
        if key_frames_only && !buffer.flags.contains(BufferFlags::KEY_FRAME) {
            return Ok(());
        }
        let size = state.output_size.unwrap_or(buffer.payload.len());
        state.emit_output(OutputBufferInfo {
            timestamp_us: buffer.timestamp_us,
            size,
            flags: buffer.flags,
        });
        Ok(())
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> DecoderResult<()> {
        let mut state = self.state.lock();
        let Some(info) = state.outputs.remove(&index) else {
            return Err(DecoderError::Transient(format!("unknown output buffer {}", index)));
        };
        if render {
            state.rendered.push(info.timestamp_us);
        } else {
            state.dropped.push(info.timestamp_us);
        }
        Ok(())
    }

    fn output_buffer(&mut self, index: usize) -> Option<Vec<u8>> {
        self.state.lock().outputs.get(&index).map(|info| vec![0; info.size])
    }

    fn set_trick_mode(&mut self, mode: VideoTrickMode, speed: f64) -> DecoderResult<()> {
        self.state.lock().trick = (mode, speed);
        Ok(())
    }

    fn description(&self) -> &str {
        "fake-decoder"
    }
}

// ============================================================================
// FakeAudioSink
// ============================================================================

const DEFAULT_SINK_CAPACITY: usize = 19_200;

struct FakeAudioSinkState {
    format: Option<SinkFormat>,
    capacity: usize,
    buffered: usize,
    written: usize,
    written_timestamps: Vec<i64>,
    playing: bool,
    head_position: u32,
    manual_timestamps: bool,
    timestamp: Option<AudioTimestamp>,
    clock: Option<ManualClock>,
    underruns: u32,
    latency_us: i64,
    volume: f32,
    flushes: usize,
}

/// Audio device with a byte-counted buffer.
///
/// Nothing drains on its own: `play_out` simulates the device consuming data.
/// Timestamps are either set by hand (`set_manual_timestamps(true)`) or, when a
/// clock is attached, reported as (head position, clock time) while playing.
#[derive(Clone)]
pub struct FakeAudioSink {
    state: Arc<Mutex<FakeAudioSinkState>>,
}

impl Default for FakeAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAudioSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SINK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeAudioSinkState {
                format: None,
                capacity,
                buffered: 0,
                written: 0,
                written_timestamps: Vec::new(),
                playing: false,
                head_position: 0,
                manual_timestamps: false,
                timestamp: None,
                clock: None,
                underruns: 0,
                latency_us: 0,
                volume: 1.0,
                flushes: 0,
            })),
        }
    }

    pub fn with_clock(self, clock: ManualClock) -> Self {
        self.state.lock().clock = Some(clock);
        self
    }

    pub fn set_manual_timestamps(&self, manual: bool) {
        self.state.lock().manual_timestamps = manual;
    }

    pub fn set_timestamp(&self, frame_position: u32, nano_time: i64) {
        self.state.lock().timestamp = Some(AudioTimestamp {
            frame_position,
            nano_time,
        });
    }

    pub fn clear_timestamp(&self) {
        self.state.lock().timestamp = None;
    }

    pub fn set_head_position(&self, frames: u32) {
        self.state.lock().head_position = frames;
    }

    pub fn set_latency_us(&self, latency_us: i64) {
        self.state.lock().latency_us = latency_us;
    }

    /// Consume up to `bytes` of buffered data, advancing the head position.
    pub fn play_out(&self, bytes: usize) {
        let mut state = self.state.lock();
        let consumed = bytes.min(state.buffered);
        state.buffered -= consumed;
        let bytes_per_frame = state.format.map_or(4, |f| f.bytes_per_frame());
        state.head_position = state
            .head_position
            .wrapping_add((consumed / bytes_per_frame) as u32);
    }

    pub fn add_underrun(&self) {
        self.state.lock().underruns += 1;
    }

    pub fn configured_format(&self) -> Option<SinkFormat> {
        self.state.lock().format
    }

    pub fn is_playing_now(&self) -> bool {
        self.state.lock().playing
    }

    pub fn written_bytes(&self) -> usize {
        self.state.lock().written
    }

    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().buffered
    }

    /// Timestamp of every write that was at least partly accepted.
    pub fn written_timestamps(&self) -> Vec<i64> {
        self.state.lock().written_timestamps.clone()
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }
}

impl AudioSink for FakeAudioSink {
    fn configure(&mut self, format: &SinkFormat) -> DecoderResult<()> {
        let mut state = self.state.lock();
        state.format = Some(*format);
        state.buffered = 0;
        state.head_position = 0;
        state.playing = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8], timestamp_us: i64) -> DecoderResult<usize> {
        let mut state = self.state.lock();
        if state.format.is_none() {
            return Err(DecoderError::Transient("sink not configured".to_string()));
        }
        let accepted = data.len().min(state.capacity - state.buffered);
        state.buffered += accepted;
        state.written += accepted;
        if accepted > 0 {
            state.written_timestamps.push(timestamp_us);
        }
        Ok(accepted)
    }

    fn play(&mut self) {
        self.state.lock().playing = true;
    }

    fn pause(&mut self) {
        self.state.lock().playing = false;
    }

    fn flush(&mut self) {
        let mut state = self.state.lock();
        state.buffered = 0;
        state.head_position = 0;
        state.flushes += 1;
    }

    fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    fn buffer_size_bytes(&self) -> usize {
        self.state.lock().capacity
    }

    fn timestamp(&mut self) -> Option<AudioTimestamp> {
        let state = self.state.lock();
        if state.manual_timestamps {
            return state.timestamp;
        }
        match &state.clock {
            Some(clock) if state.playing => Some(AudioTimestamp {
                frame_position: state.head_position,
                nano_time: crate::clocks::Clock::now_ns(clock),
            }),
            _ => None,
        }
    }

    fn playback_head_position(&mut self) -> u32 {
        self.state.lock().head_position
    }

    fn underrun_count(&self) -> u32 {
        self.state.lock().underruns
    }

    fn latency_us(&self) -> i64 {
        self.state.lock().latency_us
    }

    fn set_volume(&mut self, gain: f32) {
        self.state.lock().volume = gain;
    }
}

// ============================================================================
// FakeCapabilities
// ============================================================================

#[derive(Default)]
struct FakeCapabilitiesState {
    tunneled_playback: bool,
    hdmi_plugged: bool,
    bluetooth_sink_ready: bool,
    hdmi_sample_rates: Vec<u32>,
    notifiers: Vec<CapabilityNotifier>,
}

/// Capability source whose state tests flip at will. Every change is pushed
/// to the subscribers.
#[derive(Clone, Default)]
pub struct FakeCapabilities {
    state: Arc<Mutex<FakeCapabilitiesState>>,
}

impl FakeCapabilities {
    pub fn new(tunneled_playback: bool, hdmi_plugged: bool) -> Self {
        let caps = Self::default();
        {
            let mut state = caps.state.lock();
            state.tunneled_playback = tunneled_playback;
            state.hdmi_plugged = hdmi_plugged;
        }
        caps
    }

    pub fn shared(&self) -> Arc<dyn CapabilitySource> {
        Arc::new(self.clone())
    }

    pub fn set_hdmi_plugged(&self, plugged: bool) {
        let mut state = self.state.lock();
        state.hdmi_plugged = plugged;
        Self::broadcast(&mut state, CapabilityChange::HdmiPlugged(plugged));
    }

    pub fn set_bluetooth_sink_ready(&self, ready: bool) {
        let mut state = self.state.lock();
        state.bluetooth_sink_ready = ready;
        Self::broadcast(&mut state, CapabilityChange::BluetoothSinkReady(ready));
    }

    pub fn set_hdmi_sample_rates(&self, rates: Vec<u32>) {
        let mut state = self.state.lock();
        state.hdmi_sample_rates = rates;
        Self::broadcast(&mut state, CapabilityChange::AudioCapabilities);
    }

    fn broadcast(state: &mut FakeCapabilitiesState, change: CapabilityChange) {
        state.notifiers.retain(|notifier| notifier.notify(change));
    }
}

impl CapabilitySource for FakeCapabilities {
    fn is_tunneled_playback_supported(&self) -> bool {
        self.state.lock().tunneled_playback
    }

    fn is_hdmi_plugged(&self) -> bool {
        self.state.lock().hdmi_plugged
    }

    fn is_bluetooth_sink_ready(&self) -> bool {
        self.state.lock().bluetooth_sink_ready
    }

    fn hdmi_sample_rates(&self) -> Vec<u32> {
        self.state.lock().hdmi_sample_rates.clone()
    }

    fn subscribe(&self, notifier: CapabilityNotifier) {
        self.state.lock().notifiers.push(notifier);
    }
}

// ============================================================================
// RecordingEventSink
// ============================================================================

/// Keeps every event it receives.
#[derive(Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<PlaybackEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn EventSink> {
        Arc::new(self.clone())
    }

    pub fn events(&self) -> Vec<PlaybackEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<PlaybackEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count(&self, predicate: impl Fn(&PlaybackEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingEventSink {
    fn notify(&self, event: PlaybackEvent) {
        self.events.lock().push(event);
    }
}
