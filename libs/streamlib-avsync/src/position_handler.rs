// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Last known presentation position on the source timeline.

use crate::clocks::SharedClock;

/// Positions further than this outside the stream bounds are rejected.
const OUT_OF_BOUNDS_MARGIN_US: i64 = 5_000_000;
/// After end of data, position is pinned to the end once wall time runs this
/// far ahead of position progress.
const END_MARGIN_MS: i64 = 1_000;
const UPDATE_INTERVAL_MS: i64 = 200;
const LOG_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy)]
struct Origin {
    timestamp_us: i64,
    offset_us: i64,
}

#[derive(Debug, Clone, Copy)]
struct EndOfData {
    wall_ms: i64,
    position_us: i64,
}

pub struct PositionHandler {
    id: String,
    wall: SharedClock,
    origin: Option<Origin>,
    position_us: i64,
    start_us: Option<i64>,
    end_us: Option<i64>,
    end_of_data: Option<EndOfData>,
    last_update_ms: Option<i64>,
    last_log_ms: Option<i64>,
}

impl PositionHandler {
    pub fn new(id: impl Into<String>, wall: SharedClock) -> Self {
        Self {
            id: id.into(),
            wall,
            origin: None,
            position_us: 0,
            start_us: None,
            end_us: None,
            end_of_data: None,
            last_update_ms: None,
            last_log_ms: None,
        }
    }

    /// Forget origin, position and end of data. Stream bounds are kept.
    pub fn reset(&mut self) {
        tracing::info!("[{}] position reset", self.id);
        self.origin = None;
        self.position_us = 0;
        self.end_of_data = None;
        self.last_update_ms = None;
        self.last_log_ms = None;
    }

    /// Anchor source timestamp `timestamp_us` at position `offset_us`.
    pub fn set_origin(&mut self, timestamp_us: i64, offset_us: i64) {
        tracing::info!(
            "[{}] position origin timestamp:{}us offset:{}us",
            self.id,
            timestamp_us,
            offset_us
        );
        self.origin = Some(Origin {
            timestamp_us,
            offset_us,
        });
    }

    pub fn unset_origin(&mut self) {
        tracing::debug!("[{}] position origin unset", self.id);
        self.origin = None;
    }

    pub fn is_origin_set(&self) -> bool {
        self.origin.is_some()
    }

    pub fn set_end_of_data(&mut self) {
        tracing::info!("[{}] end of data at {}us", self.id, self.position_us);
        self.end_of_data = Some(EndOfData {
            wall_ms: self.wall.now_ms(),
            position_us: self.position_us,
        });
    }

    pub fn is_update_needed(&self) -> bool {
        match self.last_update_ms {
            None => true,
            Some(last) => self.wall.now_ms() - last > UPDATE_INTERVAL_MS,
        }
    }

    pub fn set_presentation_timestamp_us(&mut self, timestamp_us: i64) {
        let Some(origin) = self.origin else {
            return;
        };

        let position_us = timestamp_us - origin.timestamp_us + origin.offset_us;
        let below = self
            .start_us
            .is_some_and(|start| position_us < start - OUT_OF_BOUNDS_MARGIN_US);
        let above = self
            .end_us
            .is_some_and(|end| position_us > end + OUT_OF_BOUNDS_MARGIN_US);
        if below || above {
            tracing::warn!(
                "[{}] new position seems not correct:{}ms [{:?}, {:?}], timestamp:{}ms origin-timestamp:{}ms, origin-offset:{}ms => ignored",
                self.id,
                position_us / 1000,
                self.start_us.map(|v| v / 1000),
                self.end_us.map(|v| v / 1000),
                timestamp_us / 1000,
                origin.timestamp_us / 1000,
                origin.offset_us / 1000
            );
        } else {
            self.position_us = position_us;
        }
        self.last_update_ms = Some(self.wall.now_ms());
    }

    pub fn set_position_us(&mut self, position_us: i64) {
        self.position_us = position_us;
    }

    pub fn set_start_position_us(&mut self, position_us: Option<i64>) {
        self.start_us = position_us;
    }

    pub fn set_end_position_us(&mut self, position_us: Option<i64>) {
        self.end_us = position_us;
    }

    pub fn has_start_position(&self) -> bool {
        self.start_us.is_some()
    }

    pub fn has_end_position(&self) -> bool {
        self.end_us.is_some()
    }

    /// Start bound, or the current position when unknown.
    pub fn start_position_us(&mut self) -> i64 {
        match self.start_us {
            Some(start) => start,
            None => self.position_us(),
        }
    }

    /// End bound, or the current position when unknown.
    pub fn end_position_us(&mut self) -> i64 {
        match self.end_us {
            Some(end) => end,
            None => self.position_us(),
        }
    }

    pub fn position_us(&mut self) -> i64 {
        self.check_end_of_data();

        let now_ms = self.wall.now_ms();
        if self.last_log_ms.is_none_or(|last| last + LOG_INTERVAL_MS < now_ms) {
            tracing::info!(
                "[{}] [{} {}] current: {}",
                self.id,
                format_bound(self.start_us),
                format_bound(self.end_us),
                format_time(self.position_us)
            );
            self.last_log_ms = Some(now_ms);
        }

        if let Some(end) = self.end_us {
            self.position_us = self.position_us.min(end);
        }
        if let Some(start) = self.start_us {
            self.position_us = self.position_us.max(start);
        }
        self.position_us
    }

    fn check_end_of_data(&mut self) {
        let (Some(eod), Some(end)) = (self.end_of_data, self.end_us) else {
            return;
        };
        if self.position_us == end {
            return;
        }
        let elapsed_ms = self.wall.now_ms() - eod.wall_ms;
        let progress_ms = (self.position_us - eod.position_us) / 1000;
        tracing::debug!(
            "[{}] elapsed since end of data: {}ms, position progress: {}ms",
            self.id,
            elapsed_ms,
            progress_ms
        );
        if elapsed_ms - progress_ms > END_MARGIN_MS {
            self.position_us = end;
        }
    }
}

fn format_time(us: i64) -> String {
    let total_s = us / 1_000_000;
    let sign = if us < 0 { "-" } else { "" };
    let total_s = total_s.abs();
    format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        total_s / 3600,
        (total_s / 60) % 60,
        total_s % 60
    )
}

fn format_bound(us: Option<i64>) -> String {
    us.map_or_else(|| "--:--:--".to_string(), format_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::ManualClock;
    use std::sync::Arc;

    fn handler() -> (ManualClock, PositionHandler) {
        let wall = ManualClock::starting_at_ms(10_000);
        let handler = PositionHandler::new("test", Arc::new(wall.clone()));
        (wall, handler)
    }

    #[test]
    fn test_timestamp_ignored_without_origin() {
        let (_wall, mut h) = handler();
        h.set_presentation_timestamp_us(1_000_000);
        assert_eq!(h.position_us(), 0);
        assert!(h.is_update_needed());
    }

    #[test]
    fn test_position_follows_origin() {
        let (_wall, mut h) = handler();
        h.set_origin(90_000_000, 2_000_000);
        h.set_presentation_timestamp_us(90_500_000);
        assert_eq!(h.position_us(), 2_500_000);
        assert!(!h.is_update_needed());
    }

    #[test]
    fn test_update_interval() {
        let (wall, mut h) = handler();
        h.set_origin(0, 0);
        h.set_presentation_timestamp_us(40_000);
        wall.advance_ms(200);
        assert!(!h.is_update_needed());
        wall.advance_ms(1);
        assert!(h.is_update_needed());
    }

    #[test]
    fn test_out_of_bounds_position_is_rejected() {
        let (_wall, mut h) = handler();
        h.set_start_position_us(Some(0));
        h.set_end_position_us(Some(60_000_000));
        h.set_origin(0, 0);
        h.set_presentation_timestamp_us(30_000_000);
        h.set_presentation_timestamp_us(70_000_000);
        assert_eq!(h.position_us(), 30_000_000);
    }

    #[test]
    fn test_position_is_clamped_to_bounds() {
        let (_wall, mut h) = handler();
        h.set_start_position_us(Some(1_000_000));
        h.set_end_position_us(Some(60_000_000));
        h.set_origin(0, 0);
        h.set_presentation_timestamp_us(62_000_000);
        assert_eq!(h.position_us(), 60_000_000);
        h.set_position_us(0);
        assert_eq!(h.position_us(), 1_000_000);
    }

    #[test]
    fn test_bounds_fall_back_to_position() {
        let (_wall, mut h) = handler();
        h.set_position_us(4_000_000);
        assert_eq!(h.start_position_us(), 4_000_000);
        assert_eq!(h.end_position_us(), 4_000_000);
        h.set_end_position_us(Some(9_000_000));
        assert_eq!(h.end_position_us(), 9_000_000);
    }

    #[test]
    fn test_end_of_data_pins_to_end() {
        let (wall, mut h) = handler();
        h.set_end_position_us(Some(60_000_000));
        h.set_position_us(58_000_000);
        h.set_end_of_data();
        wall.advance_ms(900);
        assert_eq!(h.position_us(), 58_000_000);
        wall.advance_ms(200);
        assert_eq!(h.position_us(), 60_000_000);
    }

    #[test]
    fn test_reset_and_unset_origin() {
        let (_wall, mut h) = handler();
        h.set_origin(0, 0);
        h.unset_origin();
        assert!(!h.is_origin_set());
        h.set_origin(0, 0);
        h.set_presentation_timestamp_us(1_000);
        h.reset();
        assert!(!h.is_origin_set());
        assert_eq!(h.position_us(), 0);
        assert!(h.is_update_needed());
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(3_723_000_000), "01:02:03");
        assert_eq!(format_bound(None), "--:--:--");
    }
}
