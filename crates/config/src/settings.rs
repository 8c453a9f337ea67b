//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{
    ConfigError, FlowDefinition, GenerationConfig, InterruptionConfig, SessionConfig,
    SilenceConfig, TurnConfig,
};

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Turn boundary detection
    #[serde(default)]
    pub turn: TurnConfig,

    /// Barge-in handling
    #[serde(default)]
    pub interruption: InterruptionConfig,

    /// Silence re-engagement
    #[serde(default)]
    pub silence: SilenceConfig,

    /// Reply generation
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Session loop
    #[serde(default)]
    pub session: SessionConfig,

    /// Where the conversation flow comes from
    #[serde(default)]
    pub flow: FlowSource,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.turn.tentative_silence_ms >= self.turn.force_commit_ms {
            return Err(ConfigError::InvalidValue {
                field: "turn.force_commit_ms".to_string(),
                message: "must be longer than turn.tentative_silence_ms".to_string(),
            });
        }

        if self.interruption.min_words == 0 {
            return Err(ConfigError::InvalidValue {
                field: "interruption.min_words".to_string(),
                message: "at least one word is required".to_string(),
            });
        }

        if self.silence.check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "silence.check_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.silence.threshold_ms < self.silence.check_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "silence.threshold_ms".to_string(),
                message: "must not be shorter than silence.check_interval_ms".to_string(),
            });
        }

        if self.session.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.poll_interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.session.input_buffer == 0 || self.session.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session".to_string(),
                message: "channel capacities must be greater than zero".to_string(),
            });
        }

        if self.generation.fallback_utterance.trim().is_empty() {
            return Err(ConfigError::MissingField(
                "generation.fallback_utterance".to_string(),
            ));
        }

        Ok(())
    }

    /// Flow definition named by `flow.path`, or the built-in intake flow
    pub fn load_flow(&self) -> Result<FlowDefinition, ConfigError> {
        match &self.flow.path {
            Some(path) => FlowDefinition::from_file(path),
            None => {
                tracing::debug!("No flow path configured, using built-in flow");
                Ok(FlowDefinition::default())
            }
        }
    }
}

/// Flow definition source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSource {
    /// YAML or JSON flow definition
    #[serde(default)]
    pub path: Option<String>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (DIALOGUE__ prefix)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder = builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("DIALOGUE")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.turn.force_commit_ms, 3000);
        assert_eq!(settings.silence.max_reengagements, 2);
        assert!(settings.generation.speculative);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();
        settings.turn.force_commit_ms = 100;
        assert!(settings.validate().is_err());

        settings.turn.force_commit_ms = 3000;
        settings.interruption.min_words = 0;
        assert!(settings.validate().is_err());

        settings.interruption.min_words = 1;
        settings.silence.threshold_ms = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_flow_path_uses_builtin() {
        let flow = Settings::default().load_flow().unwrap();
        assert_eq!(flow.entry, "opening");
    }

    #[test]
    fn test_missing_flow_file_is_reported() {
        let mut settings = Settings::default();
        settings.flow.path = Some("does/not/exist.yaml".to_string());
        assert!(matches!(
            settings.load_flow(),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
