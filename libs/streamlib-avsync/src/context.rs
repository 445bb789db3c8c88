// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process-scoped state shared by every scheduler instance.
//!
//! Holds the wall clock, the platform capability source, the host event sink
//! and the validated configuration. Schedulers take what they need from it
//! at construction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::clocks::{SharedClock, SoftwareClock};
use crate::config::SyncConfig;
use crate::error::{AvSyncError, Result};
use crate::io::{CapabilitySource, NullEventSink, SharedEventSink, StaticCapabilities};

/// Session ids start above zero, zero means "no session" to most platforms.
const FIRST_AUDIO_SESSION_ID: u32 = 1;

pub struct SyncContext {
    config: SyncConfig,
    wall: SharedClock,
    capabilities: Arc<dyn CapabilitySource>,
    events: SharedEventSink,
    next_audio_session_id: AtomicU32,
    torn_down: AtomicBool,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        wall: SharedClock,
        capabilities: Arc<dyn CapabilitySource>,
        events: SharedEventSink,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "[{}] sync context created, mode:{:?}, clock:{}",
            config.instance_id,
            config.playback_mode,
            wall.description()
        );
        Ok(Self {
            config,
            wall,
            capabilities,
            events,
            next_audio_session_id: AtomicU32::new(FIRST_AUDIO_SESSION_ID),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Software wall clock, no tunneling, no HDMI and events discarded.
    pub fn with_defaults(config: SyncConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(SoftwareClock::new()),
            StaticCapabilities::new(false, false).shared(),
            Arc::new(NullEventSink),
        )
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn wall(&self) -> SharedClock {
        self.wall.clone()
    }

    pub fn capabilities(&self) -> Arc<dyn CapabilitySource> {
        self.capabilities.clone()
    }

    pub fn events(&self) -> SharedEventSink {
        self.events.clone()
    }

    /// Id pairing a tunneled video decoder with its audio track.
    pub fn allocate_audio_session_id(&self) -> Result<u32> {
        if self.is_torn_down() {
            return Err(AvSyncError::InvalidState(
                "sync context already torn down".into(),
            ));
        }
        Ok(self.next_audio_session_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Refuse further allocations. Schedulers already built keep running
    /// until released.
    pub fn teardown(&self) {
        if !self.torn_down.swap(true, Ordering::AcqRel) {
            tracing::info!("[{}] sync context teardown", self.config.instance_id);
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("instance_id", &self.config.instance_id)
            .field("playback_mode", &self.config.playback_mode)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    #[test]
    fn test_session_ids_are_unique() {
        let ctx = SyncContext::with_defaults(SyncConfig::default()).unwrap();
        let a = ctx.allocate_audio_session_id().unwrap();
        let b = ctx.allocate_audio_session_id().unwrap();
        assert_eq!(a, FIRST_AUDIO_SESSION_ID);
        assert_ne!(a, b, "each scheduler gets its own session");
    }

    #[test]
    fn test_teardown_refuses_allocation() {
        let ctx = SyncContext::with_defaults(SyncConfig::default()).unwrap();
        ctx.teardown();
        ctx.teardown();
        assert!(ctx.is_torn_down());
        assert!(matches!(
            ctx.allocate_audio_session_id(),
            Err(AvSyncError::InvalidState(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SyncConfig {
            tick_cadence_ms: 0,
            ..SyncConfig::default()
        };
        let result = SyncContext::new(
            config,
            Arc::new(ManualClock::new()),
            StaticCapabilities::new(false, false).shared(),
            Arc::new(NullEventSink),
        );
        assert!(matches!(result, Err(AvSyncError::Configuration(_))));
    }
}
