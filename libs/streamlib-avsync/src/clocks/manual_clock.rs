// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::Clock;

/// Clock that only moves when told to.
///
/// Clones share the same counter, so a test can keep one handle and give the
/// other to the engine.
#[derive(Clone, Default)]
pub struct ManualClock {
    now_ns: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at_ms(ms: i64) -> Self {
        let clock = Self::new();
        clock.set_ns(ms * 1_000_000);
        clock
    }

    pub fn set_ns(&self, ns: i64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, ns: i64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn advance_us(&self, us: i64) {
        self.advance_ns(us * 1_000);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance_ns(ms * 1_000_000);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn description(&self) -> &str {
        "Manual Clock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_time() {
        let clock = ManualClock::starting_at_ms(5);
        let other = clock.clone();
        other.advance_ms(10);
        assert_eq!(clock.now_ms(), 15);
        clock.advance_us(500);
        assert_eq!(other.now_us(), 15_500);
    }
}
