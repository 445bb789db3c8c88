// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use super::{
    FrameUnwrapper, References, Tracker, DRIFT_ADJUSTMENT_US, DRIFT_MAX_US, DRIFT_TOLERANCE_US,
};
use crate::io::AudioSink;

const ACCURACY_HEAD_POSITION_US: i64 = 20_000;

/// Fallback for devices that stopped reporting timestamps: frames played
/// according to the head position, minus a static latency estimate.
pub(crate) struct ByHeadPosition {
    id: String,
    latency_us: i64,
    unwrapper: FrameUnwrapper,
    playback_position_us: i64,
    playback_position_when_ms: Option<i64>,
    drift_position_us: i64,
}

impl ByHeadPosition {
    pub fn new(id: String, latency_us: i64) -> Self {
        Self {
            id,
            latency_us,
            unwrapper: FrameUnwrapper::default(),
            playback_position_us: 0,
            playback_position_when_ms: None,
            drift_position_us: 0,
        }
    }
}

impl Tracker for ByHeadPosition {
    fn reset(&mut self, _refs: &mut References) {
        self.playback_position_us = 0;
        self.playback_position_when_ms = None;
        self.drift_position_us = 0;
    }

    fn is_broken(&self, _now_ms: i64) -> bool {
        false
    }

    fn update_position(&mut self, refs: &mut References, sink: &mut dyn AudioSink, now_ms: i64) {
        let Some(reference) = refs.reference else {
            return;
        };
        let frames = self.unwrapper.unwrap(sink.playback_head_position());
        let position_us = refs.frames_to_us(frames - reference.frames) + reference.timestamp_us;
        self.playback_position_us = (position_us - self.latency_us).max(0);
        self.playback_position_when_ms = Some(now_ms);

        let Some(check) = refs.check else {
            return;
        };
        if frames < check.frames {
            return;
        }
        let expected_us = check.timestamp_us + refs.frames_to_us(frames - check.frames);
        let drift_us = position_us - expected_us;
        if drift_us.abs() > DRIFT_MAX_US {
            tracing::info!(
                "[{}] drift in position:{}us, reset head position tracker",
                self.id,
                drift_us
            );
            self.reset(refs);
        } else if drift_us.abs() > DRIFT_TOLERANCE_US {
            tracing::info!(
                "[{}] drift in position:{}us, adjust offset (was:{})",
                self.id,
                drift_us,
                self.drift_position_us
            );
            self.drift_position_us -= DRIFT_ADJUSTMENT_US * drift_us.signum();
        }
        refs.check = None;
    }

    fn is_position_valid(&self) -> bool {
        self.playback_position_when_ms.is_some()
    }

    fn position_us(&self, now_ms: i64) -> i64 {
        let elapsed_ms = self.playback_position_when_ms.map_or(0, |when| now_ms - when);
        self.playback_position_us + self.drift_position_us + elapsed_ms * 1_000
    }

    fn accuracy_us(&self) -> i64 {
        ACCURACY_HEAD_POSITION_US
    }

    fn suspend(&mut self) {}

    fn resume(&mut self) {
        self.playback_position_us = 0;
        self.playback_position_when_ms = None;
        self.drift_position_us = 0;
    }
}
