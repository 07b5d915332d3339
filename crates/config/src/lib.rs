//! Configuration for the lyra TTS service
//!
//! Layered settings (files + `LYRA_` environment overrides) and the
//! calibrated constants behind their defaults.

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, DaemonSettings, LifecycleSettings, ModelSettings, ObservabilitySettings,
    PoolSettings, SchedulerSettings, SegmenterSettings, SelectorSettings, ServerSettings, Settings,
    SloSettings,
};

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment error: {0}")]
    Environment(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
