//! Configuration management for voxstream services
//!
//! Supports loading configuration from:
//! - An optional config file (`config/default`, plus `config/{env}`)
//! - Environment variables, both the flat names every service recognizes
//!   (`BROKER_URL`, `GATEWAY_PORT`, `SILENCE_THRESHOLD_MS`, ...) and the
//!   structured `VOXSTREAM__` prefix form

pub mod settings;

pub use settings::{
    load_settings, BrokerConfig, FlowConfig, GatewayConfig, ObservabilityConfig,
    RuntimeEnvironment, SegmenterConfig, Settings, VadConfig, WorkerConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
