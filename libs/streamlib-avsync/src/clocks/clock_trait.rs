// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Clock trait - wall time reference for the synchronization engine.
//!
//! Every timing decision in the engine (media clock progression, drift checks,
//! retry backoff, blocking detection) reads wall time through this trait so
//! tests can substitute a [`ManualClock`](super::ManualClock).

use std::sync::Arc;

/// Passive monotonic time source.
///
/// ## Implementations
///
/// - `SoftwareClock`: `Instant` based, for production.
/// - `ManualClock`: advanced explicitly, for deterministic tests.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds (monotonic, arbitrary epoch).
    fn now_ns(&self) -> i64;

    fn now_us(&self) -> i64 {
        self.now_ns() / 1_000
    }

    fn now_ms(&self) -> i64 {
        self.now_ns() / 1_000_000
    }

    /// Human-readable clock description
    ///
    /// Used for debugging and logging.
    fn description(&self) -> &str;
}

pub type SharedClock = Arc<dyn Clock>;
