// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Construction-time configuration for the synchronization engine.
//!
//! A [`SyncConfig`] can be built in code (see the presets), or loaded from a
//! TOML, YAML or JSON file. Every field has a default, so partial files are fine.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AvSyncError, Result};

/// Which playback strategy fills the 1x slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Software A/V synchronization driven by the media clocks.
    #[default]
    Normal,
    /// Tunneled hardware playback, the engine only feeds decoders.
    Passthrough,
}

/// Strategy used for speeds outside the smooth trick ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekTrickMode {
    #[default]
    BySeek,
    IOnly,
}

/// Inclusive speed interval rendered by continuous decoding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedRange {
    pub min: f64,
    pub max: f64,
}

impl SpeedRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, speed: f64) -> bool {
        speed >= self.min && speed <= self.max
    }
}

/// Backoff applied when a decoder refuses its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix used in every log line of this instance.
    pub instance_id: String,
    pub playback_mode: PlaybackMode,
    pub seek_trick_mode: SeekTrickMode,
    /// Gap between consecutive timestamps that counts as a discontinuity.
    pub discontinuity_threshold_us: i64,
    /// Upper bound between two scheduler ticks in normal playback.
    pub tick_cadence_ms: u64,
    /// Upper bound between two scheduler ticks in passthrough playback.
    pub passthrough_cadence_ms: u64,
    /// Emit a `FrameRendered` event for every presented frame.
    pub pts_events_enabled: bool,
    pub smooth_trick_speeds: Vec<SpeedRange>,
    pub configure_retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            instance_id: "avsync".to_string(),
            playback_mode: PlaybackMode::Normal,
            smooth_trick_speeds: vec![SpeedRange::new(0.0, 2.0)],
            seek_trick_mode: SeekTrickMode::BySeek,
            discontinuity_threshold_us: 500_000,
            tick_cadence_ms: 40,
            passthrough_cadence_ms: 1000,
            configure_retry: RetryConfig::default(),
            pts_events_enabled: false,
        }
    }
}

impl SyncConfig {
    /// Software synchronized playback with the stock thresholds.
    pub fn normal() -> Self {
        Self::default()
    }

    /// Tunneled playback where decoders render on their own.
    pub fn passthrough() -> Self {
        Self {
            playback_mode: PlaybackMode::Passthrough,
            ..Self::default()
        }
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Tick cadence of the active playback mode.
    pub fn cadence_ms(&self) -> u64 {
        match self.playback_mode {
            PlaybackMode::Normal => self.tick_cadence_ms,
            PlaybackMode::Passthrough => self.passthrough_cadence_ms,
        }
    }

    pub fn is_smooth_trick_speed(&self, speed: f64) -> bool {
        self.smooth_trick_speeds.iter().any(|r| r.contains(speed))
    }

    pub fn validate(&self) -> Result<()> {
        if self.discontinuity_threshold_us <= 0 {
            return Err(AvSyncError::Configuration(format!(
                "discontinuity_threshold_us must be positive, got {}",
                self.discontinuity_threshold_us
            )));
        }
        if self.tick_cadence_ms == 0 || self.passthrough_cadence_ms == 0 {
            return Err(AvSyncError::Configuration(
                "tick cadences must be non-zero".to_string(),
            ));
        }
        if self.configure_retry.max_attempts == 0 {
            return Err(AvSyncError::Configuration(
                "configure_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        for range in &self.smooth_trick_speeds {
            if !range.min.is_finite() || !range.max.is_finite() || range.min > range.max {
                return Err(AvSyncError::Configuration(format!(
                    "invalid smooth trick speed range [{}, {}]",
                    range.min, range.max
                )));
            }
            if range.min < 0.0 {
                tracing::warn!(
                    "[{}] smooth trick range [{}, {}] includes negative speeds, rewind is never smooth",
                    self.instance_id,
                    range.min,
                    range.max
                );
            }
        }
        if self.discontinuity_threshold_us < 40_000 {
            tracing::warn!(
                "[{}] discontinuity threshold {}us is below one frame period",
                self.instance_id,
                self.discontinuity_threshold_us
            );
        }
        if self.tick_cadence_ms > 100 {
            tracing::warn!(
                "[{}] tick cadence {}ms is coarse for synchronized playback",
                self.instance_id,
                self.tick_cadence_ms
            );
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, picking the format from its extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AvSyncError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let config = match extension.as_deref() {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            other => {
                return Err(AvSyncError::Configuration(format!(
                    "Unsupported config extension {:?} for {}",
                    other,
                    path.display()
                )));
            }
        };

        tracing::info!("[{}] Loaded sync config from {}", config.instance_id, path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AvSyncError::ConfigParse(format!("toml: {}", e)))
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.playback_mode, PlaybackMode::Normal);
        assert_eq!(config.discontinuity_threshold_us, 500_000);
        assert_eq!(config.configure_retry.max_attempts, 20);
        assert_eq!(config.cadence_ms(), 40);
        assert!(config.is_smooth_trick_speed(2.0));
        assert!(!config.is_smooth_trick_speed(4.0));
        assert!(!config.is_smooth_trick_speed(-1.0));
        config.validate().expect("default config must validate");
    }

    #[test]
    fn test_passthrough_preset_uses_slow_cadence() {
        let config = SyncConfig::passthrough();
        assert_eq!(config.playback_mode, PlaybackMode::Passthrough);
        assert_eq!(config.cadence_ms(), 1000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            instance_id = "tuner0"
            seek_trick_mode = "i_only"

            [[smooth_trick_speeds]]
            min = 0.5
            max = 4.0
            "#,
        )
        .expect("parse");
        assert_eq!(config.instance_id, "tuner0");
        assert_eq!(config.seek_trick_mode, SeekTrickMode::IOnly);
        assert!(config.is_smooth_trick_speed(4.0));
        assert_eq!(config.tick_cadence_ms, 40);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = SyncConfig::from_json_str(r#"{"smooth_trick_speeds":[{"min":3.0,"max":1.0}]}"#)
            .unwrap_err();
        assert!(matches!(err, AvSyncError::Configuration(_)));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = SyncConfig::from_yaml_str("discontinuity_threshold_us: 0\n").unwrap_err();
        assert!(matches!(err, AvSyncError::Configuration(_)));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = SyncConfig::from_toml_str("tick_cadence_ms = \"fast\"").unwrap_err();
        assert!(matches!(err, AvSyncError::ConfigParse(_)));
    }
}
