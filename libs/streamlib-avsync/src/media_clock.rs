// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Virtual presentation clock with adjustable origin, offset and speed.

use crate::clocks::SharedClock;

/// Presentation clock of one track.
///
/// The clock is stopped until an origin is set. Once started it advances at
/// `speed` times the wall clock rate. Changing the speed re-anchors the clock
/// at the current value, so `time_us()` never jumps at the instant of a call.
pub struct MediaClock {
    wall: SharedClock,
    started: bool,
    origin_timestamp_us: i64,
    origin_wall_us: i64,
    offset_us: i64,
    speed: f64,
    speed_origin_timestamp_us: i64,
    speed_origin_wall_us: i64,
}

impl MediaClock {
    pub fn new(wall: SharedClock) -> Self {
        Self {
            wall,
            started: false,
            origin_timestamp_us: 0,
            origin_wall_us: 0,
            offset_us: 0,
            speed: 1.0,
            speed_origin_timestamp_us: 0,
            speed_origin_wall_us: 0,
        }
    }

    /// Stop the clock and forget origin, offset and speed.
    pub fn reset(&mut self) {
        self.started = false;
        self.origin_timestamp_us = 0;
        self.origin_wall_us = 0;
        self.offset_us = 0;
        self.speed = 1.0;
        self.speed_origin_timestamp_us = 0;
        self.speed_origin_wall_us = 0;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn set_offset_us(&mut self, offset_us: i64) {
        self.offset_us = offset_us;
    }

    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    /// Start the clock at `timestamp_us`. The speed is kept, the offset cleared.
    pub fn set_origin_timestamp_us(&mut self, timestamp_us: i64) {
        let now_us = self.wall.now_us();
        self.started = true;
        self.origin_timestamp_us = timestamp_us;
        self.origin_wall_us = now_us;
        self.offset_us = 0;
        self.speed_origin_timestamp_us = timestamp_us;
        self.speed_origin_wall_us = now_us;
    }

    pub fn origin_timestamp_us(&self) -> i64 {
        if !self.started {
            return 0;
        }
        self.origin_timestamp_us
    }

    pub fn set_speed(&mut self, speed: f64) {
        // The offset is re-added by time_us(), keep it out of the anchor.
        self.speed_origin_timestamp_us = self.time_us() - self.offset_us;
        self.speed_origin_wall_us = self.wall.now_us();
        self.speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn time_us(&self) -> i64 {
        if !self.started {
            return 0;
        }
        let delta_us = ((self.wall.now_us() - self.speed_origin_wall_us) as f64 * self.speed) as i64;
        self.speed_origin_timestamp_us + delta_us + self.offset_us
    }

    /// Wall time since the origin was set, independent of speed.
    pub fn elapsed_time_us(&self) -> i64 {
        if !self.started {
            return 0;
        }
        self.wall.now_us() - self.origin_wall_us
    }
}

impl std::fmt::Debug for MediaClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaClock")
            .field("started", &self.started)
            .field("time_us", &self.time_us())
            .field("speed", &self.speed)
            .field("offset_us", &self.offset_us)
            .finish()
    }
}
