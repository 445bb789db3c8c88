// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

use crate::io::DecoderError;

#[derive(Error, Debug)]
pub enum AvSyncError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Codec failure: {0}")]
    Codec(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AvSyncError>;

impl From<DecoderError> for AvSyncError {
    fn from(err: DecoderError) -> Self {
        match err {
            DecoderError::Configuration(msg) => AvSyncError::Configuration(msg),
            DecoderError::Transient(msg) | DecoderError::Fatal(msg) => AvSyncError::Codec(msg),
        }
    }
}

impl From<toml::de::Error> for AvSyncError {
    fn from(err: toml::de::Error) -> Self {
        AvSyncError::ConfigParse(format!("toml: {}", err))
    }
}

impl From<serde_yaml::Error> for AvSyncError {
    fn from(err: serde_yaml::Error) -> Self {
        AvSyncError::ConfigParse(format!("yaml: {}", err))
    }
}

impl From<serde_json::Error> for AvSyncError {
    fn from(err: serde_json::Error) -> Self {
        AvSyncError::ConfigParse(format!("json: {}", err))
    }
}
