// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use super::{
    FramePoint, FrameUnwrapper, References, Tracker, DRIFT_ADJUSTMENT_US, DRIFT_MAX_US,
    DRIFT_TOLERANCE_US,
};
use crate::io::AudioSink;

/// Without a device timestamp for this long the strategy gives up.
const NO_TIMESTAMP_MAX_DURATION_MS: i64 = 1_000;
const UPDATE_RATE_ADJUSTING_DRIFT_MS: i64 = 100;
const ACCURACY_WAITING_FOR_PLAY_US: i64 = 100_000;
const ACCURACY_MONITORING_US: i64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    None,
    WaitingForReference,
    WaitingForPlay,
    Monitoring,
}

impl State {
    fn update_rate_ms(self) -> i64 {
        match self {
            State::None | State::WaitingForReference | State::WaitingForPlay => 10,
            State::Monitoring => 10_000,
        }
    }
}

/// Latest device sample, unwrapped.
#[derive(Debug, Default, Clone, Copy)]
struct DeviceSample {
    frames: i64,
    time_ns: i64,
    /// Wall time the sample was read.
    read_ms: i64,
}

pub(crate) struct ByTimestamp {
    id: String,
    state: State,
    state_start_ms: i64,
    last_update_ms: Option<i64>,
    update_rate_ms: i64,
    first: DeviceSample,
    display_offset_us: i64,
    drift_device_us: i64,
    drift_position_us: i64,
    sample: DeviceSample,
    unwrapper: FrameUnwrapper,
    suspended: bool,
}

impl ByTimestamp {
    pub fn new(id: String) -> Self {
        Self {
            id,
            state: State::None,
            state_start_ms: 0,
            last_update_ms: None,
            update_rate_ms: State::WaitingForReference.update_rate_ms(),
            first: DeviceSample::default(),
            display_offset_us: 0,
            drift_device_us: 0,
            drift_position_us: 0,
            sample: DeviceSample::default(),
            unwrapper: FrameUnwrapper::default(),
            suspended: false,
        }
    }

    fn restart(&mut self) {
        let id = std::mem::take(&mut self.id);
        *self = Self::new(id);
    }

    fn need_update(&mut self, now_ms: i64) -> bool {
        if self.suspended {
            return false;
        }
        if let Some(last) = self.last_update_ms {
            if now_ms - last < self.update_rate_ms {
                return false;
            }
        }
        self.last_update_ms = Some(now_ms);
        true
    }

    fn read_sample(&mut self, sink: &mut dyn AudioSink, now_ms: i64) -> bool {
        let Some(ts) = sink.timestamp() else {
            return false;
        };
        self.sample = DeviceSample {
            frames: self.unwrapper.unwrap(ts.frame_position),
            time_ns: ts.nano_time,
            read_ms: now_ms,
        };
        true
    }

    fn set_state(&mut self, state: State, now_ms: i64) {
        if state == self.state {
            return;
        }
        tracing::debug!("[{}] audio timestamp tracker {:?} -> {:?}", self.id, self.state, state);
        self.update_rate_ms = state.update_rate_ms();
        self.state = state;
        self.state_start_ms = now_ms;
        self.last_update_ms = Some(now_ms);
    }

    fn record_first_position(&mut self, reference: FramePoint, refs: &References) {
        self.first = self.sample;
        self.display_offset_us =
            reference.timestamp_us + refs.frames_to_us(self.sample.frames - reference.frames);
    }

    fn position_without_elapsed_us(&self) -> i64 {
        self.display_offset_us
            + self.drift_device_us
            + self.drift_position_us
            + (self.sample.time_ns - self.first.time_ns) / 1_000
    }

    fn check_drifts(&mut self, refs: &mut References) {
        // Device clock against rendered frames.
        let rendered_us = refs.frames_to_us(self.sample.frames - self.first.frames);
        let device_elapsed_us = (self.sample.time_ns - self.first.time_ns) / 1_000;
        let drift_device_us = (device_elapsed_us - rendered_us) + self.drift_device_us;
        if drift_device_us.abs() > DRIFT_MAX_US {
            tracing::info!(
                "[{}] drift in audio device:{}us, reset reference and tracker",
                self.id,
                drift_device_us
            );
            self.reset(refs);
            return;
        }
        if drift_device_us.abs() > DRIFT_TOLERANCE_US {
            tracing::info!(
                "[{}] drift in audio device:{}us, adjust offset (was:{})",
                self.id,
                drift_device_us,
                self.drift_device_us
            );
            self.update_rate_ms = UPDATE_RATE_ADJUSTING_DRIFT_MS;
            self.drift_device_us -= DRIFT_ADJUSTMENT_US * drift_device_us.signum();
            return;
        }

        // Modelled position against the debounced check reference.
        let Some(check) = refs.check else {
            return;
        };
        if self.sample.frames < check.frames {
            return;
        }
        let expected_us = check.timestamp_us + refs.frames_to_us(self.sample.frames - check.frames);
        let drift_position_us = (self.position_without_elapsed_us() - expected_us) + self.drift_position_us;
        if drift_position_us.abs() > DRIFT_MAX_US {
            tracing::info!(
                "[{}] drift in position:{}us, reset reference and tracker",
                self.id,
                drift_position_us
            );
            self.reset(refs);
            return;
        }
        if drift_position_us.abs() > DRIFT_TOLERANCE_US {
            tracing::info!(
                "[{}] drift in position:{}us, adjust offset (was:{})",
                self.id,
                drift_position_us,
                self.drift_position_us
            );
            self.update_rate_ms = UPDATE_RATE_ADJUSTING_DRIFT_MS;
            self.drift_position_us -= DRIFT_ADJUSTMENT_US * drift_position_us.signum();
            return;
        }
        refs.check = None;
        self.update_rate_ms = State::Monitoring.update_rate_ms();
    }
}

impl Tracker for ByTimestamp {
    fn reset(&mut self, refs: &mut References) {
        self.restart();
        refs.clear();
    }

    fn is_broken(&self, now_ms: i64) -> bool {
        self.state == State::WaitingForReference
            && now_ms - self.state_start_ms > NO_TIMESTAMP_MAX_DURATION_MS
    }

    fn update_position(&mut self, refs: &mut References, sink: &mut dyn AudioSink, now_ms: i64) {
        let Some(reference) = refs.reference else {
            return;
        };
        if !self.need_update(now_ms) || self.is_broken(now_ms) {
            return;
        }
        if !self.read_sample(sink, now_ms) {
            self.set_state(State::WaitingForReference, now_ms);
            return;
        }

        match self.state {
            State::None => self.set_state(State::WaitingForReference, now_ms),
            State::WaitingForReference => {
                if self.sample.frames > reference.frames {
                    self.record_first_position(reference, refs);
                    self.set_state(State::WaitingForPlay, now_ms);
                }
            }
            State::WaitingForPlay => {
                if self.sample.frames > self.first.frames {
                    self.record_first_position(reference, refs);
                    self.set_state(State::Monitoring, now_ms);
                }
            }
            State::Monitoring => self.check_drifts(refs),
        }
    }

    fn is_position_valid(&self) -> bool {
        self.state == State::Monitoring
    }

    fn position_us(&self, now_ms: i64) -> i64 {
        self.position_without_elapsed_us() + (now_ms - self.sample.read_ms) * 1_000
    }

    fn accuracy_us(&self) -> i64 {
        match self.state {
            State::WaitingForPlay => ACCURACY_WAITING_FOR_PLAY_US,
            State::Monitoring => ACCURACY_MONITORING_US,
            State::None | State::WaitingForReference => 0,
        }
    }

    fn suspend(&mut self) {
        self.suspended = true;
    }

    fn resume(&mut self) {
        self.restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAudioSink;

    fn monitoring(refs: &mut References, sink: &FakeAudioSink) -> ByTimestamp {
        let mut tracker = ByTimestamp::new("test".into());
        let mut device = sink.clone();
        refs.reference = Some(FramePoint {
            frames: 0,
            timestamp_us: 0,
        });
        for (step, now_ms) in [0i64, 10, 20].into_iter().enumerate() {
            sink.set_timestamp(((step as i64 + 1) * 480) as u32, now_ms * 1_000_000);
            tracker.update_position(refs, &mut device, now_ms);
        }
        assert_eq!(tracker.state, State::Monitoring);
        tracker
    }

    #[test]
    fn test_reaches_monitoring() {
        let sink = FakeAudioSink::new();
        sink.set_manual_timestamps(true);
        let mut refs = References::new();
        let tracker = monitoring(&mut refs, &sink);
        assert!(tracker.is_position_valid());
        // Monitoring starts at 1440 frames, 30ms after the reference.
        assert_eq!(tracker.display_offset_us, 30_000);
    }

    #[test]
    fn test_small_device_drift_is_corrected_in_steps() {
        let sink = FakeAudioSink::new();
        sink.set_manual_timestamps(true);
        let mut refs = References::new();
        let mut tracker = monitoring(&mut refs, &sink);
        let mut device = sink.clone();

        // Device clock reports 60ms more elapsed time than frames rendered.
        sink.set_timestamp(1440 + 48_000, (20 + 1_000 + 60) * 1_000_000);
        tracker.update_position(&mut refs, &mut device, 10_020);
        assert_eq!(tracker.drift_device_us, -10_000);
        assert_eq!(tracker.update_rate_ms, UPDATE_RATE_ADJUSTING_DRIFT_MS);

        tracker.update_position(&mut refs, &mut device, 10_120);
        assert_eq!(tracker.drift_device_us, -20_000);
        tracker.update_position(&mut refs, &mut device, 10_220);
        assert_eq!(tracker.drift_device_us, -20_000, "within tolerance after two steps");
    }

    #[test]
    fn test_large_device_drift_resets() {
        let sink = FakeAudioSink::new();
        sink.set_manual_timestamps(true);
        let mut refs = References::new();
        let mut tracker = monitoring(&mut refs, &sink);
        let mut device = sink.clone();

        sink.set_timestamp(1440 + 48_000, (20 + 1_000 + 150) * 1_000_000);
        tracker.update_position(&mut refs, &mut device, 10_020);
        assert_eq!(tracker.state, State::None);
        assert!(refs.reference.is_none());
    }

    #[test]
    fn test_check_reference_is_consumed_when_consistent() {
        let sink = FakeAudioSink::new();
        sink.set_manual_timestamps(true);
        let mut refs = References::new();
        let mut tracker = monitoring(&mut refs, &sink);
        let mut device = sink.clone();

        refs.check = Some(FramePoint {
            frames: 4_800,
            timestamp_us: 100_000,
        });
        sink.set_timestamp(1440 + 48_000, (20 + 1_000) * 1_000_000);
        tracker.update_position(&mut refs, &mut device, 10_020);
        assert!(refs.check.is_none());
        assert_eq!(tracker.update_rate_ms, State::Monitoring.update_rate_ms());
    }

    #[test]
    fn test_suspended_tracker_does_not_poll() {
        let sink = FakeAudioSink::new();
        sink.set_manual_timestamps(true);
        let mut refs = References::new();
        refs.reference = Some(FramePoint {
            frames: 0,
            timestamp_us: 0,
        });
        let mut tracker = ByTimestamp::new("test".into());
        tracker.suspend();
        let mut device = sink.clone();
        sink.set_timestamp(480, 0);
        tracker.update_position(&mut refs, &mut device, 0);
        assert_eq!(tracker.state, State::None);

        tracker.resume();
        tracker.update_position(&mut refs, &mut device, 0);
        assert_eq!(tracker.state, State::WaitingForReference);
        assert!(refs.reference.is_some(), "resume keeps the reference");
    }
}
