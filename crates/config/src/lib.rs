//! Configuration management for the dialogue orchestrator
//!
//! Supports loading configuration from:
//! - YAML/TOML files under `config/`
//! - Environment variables (`DIALOGUE__` prefix)
//! - Flow definitions in YAML or JSON

pub mod flow;
pub mod pipeline;
pub mod session;
pub mod settings;

pub use flow::{
    BranchDefinition, EntryAction, FlowDefinition, GroupDefinition, GroupExit, StageDefinition,
};
pub use pipeline::{InterruptionConfig, SilenceConfig, TurnConfig};
pub use session::{GenerationConfig, SessionConfig};
pub use settings::{load_settings, FlowSource, ObservabilityConfig, Settings};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
