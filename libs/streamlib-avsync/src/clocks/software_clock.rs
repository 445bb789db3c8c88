// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Instant;

use super::Clock;

pub struct SoftwareClock {
    start_time: Instant,
    description: String,
}

impl SoftwareClock {
    pub fn new() -> Self {
        Self::with_description("Software Clock".to_string())
    }

    pub fn with_description(description: String) -> Self {
        Self {
            start_time: Instant::now(),
            description,
        }
    }
}

impl Default for SoftwareClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SoftwareClock {
    fn now_ns(&self) -> i64 {
        self.start_time.elapsed().as_nanos() as i64
    }

    fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_software_clock_now() {
        let clock = SoftwareClock::new();
        let t1 = clock.now_ns();

        thread::sleep(Duration::from_millis(10));

        let t2 = clock.now_ns();
        assert!(t2 > t1, "Time should increase");
        assert!(t2 - t1 >= 10_000_000, "Should be at least 10ms");
    }

    #[test]
    fn test_software_clock_monotonic() {
        let clock = SoftwareClock::new();
        let mut last_time = clock.now_ns();

        for _ in 0..100 {
            let current_time = clock.now_ns();
            assert!(current_time >= last_time, "Time must be monotonic");
            last_time = current_time;
        }
    }

    #[test]
    fn test_unit_conversions_agree() {
        let clock = SoftwareClock::with_description("Wall".to_string());
        assert_eq!(clock.description(), "Wall");
        let ms = clock.now_ms();
        let us = clock.now_us();
        assert!(us / 1_000 >= ms);
    }
}
