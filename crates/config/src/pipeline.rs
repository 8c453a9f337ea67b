//! Turn-taking configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Turn boundary detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Voice activity shorter than this is ignored (ms)
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,

    /// Silence after speech before a tentative turn end (ms)
    #[serde(default = "default_tentative_silence_ms")]
    pub tentative_silence_ms: u64,

    /// Wait for final text after a tentative end before force-committing (ms)
    #[serde(default = "default_force_commit_ms")]
    pub force_commit_ms: u64,
}

fn default_min_speech_ms() -> u64 {
    50
}
fn default_tentative_silence_ms() -> u64 {
    250
}
fn default_force_commit_ms() -> u64 {
    3000
}
fn default_true() -> bool {
    true
}

impl TurnConfig {
    pub fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn tentative_silence(&self) -> Duration {
        Duration::from_millis(self.tentative_silence_ms)
    }

    pub fn force_commit(&self) -> Duration {
        Duration::from_millis(self.force_commit_ms)
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            min_speech_ms: default_min_speech_ms(),
            tentative_silence_ms: default_tentative_silence_ms(),
            force_commit_ms: default_force_commit_ms(),
        }
    }
}

/// Barge-in handling while the agent speaks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptionConfig {
    /// Allow the user to interrupt agent speech
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Overlapping speech must last at least this long (ms)
    #[serde(default = "default_min_duration_ms")]
    pub min_duration_ms: u64,

    /// ... and contain at least this many recognized words
    #[serde(default = "default_min_words")]
    pub min_words: usize,

    /// Resume halted speech if no text is committed within this window (ms)
    #[serde(default = "default_false_interruption_timeout_ms")]
    pub false_interruption_timeout_ms: u64,
}

fn default_min_duration_ms() -> u64 {
    500
}
fn default_min_words() -> usize {
    2
}
fn default_false_interruption_timeout_ms() -> u64 {
    2000
}

impl InterruptionConfig {
    pub fn min_duration(&self) -> Duration {
        Duration::from_millis(self.min_duration_ms)
    }

    pub fn false_interruption_timeout(&self) -> Duration {
        Duration::from_millis(self.false_interruption_timeout_ms)
    }
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_duration_ms: default_min_duration_ms(),
            min_words: default_min_words(),
            false_interruption_timeout_ms: default_false_interruption_timeout_ms(),
        }
    }
}

/// Re-engagement after prolonged user silence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Monitor tick (ms)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Silence that triggers a re-engagement prompt (ms)
    #[serde(default = "default_threshold_ms")]
    pub threshold_ms: u64,

    /// Grace period after agent speech ends (ms)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Prompts allowed before the flow is pushed to its closing stage
    #[serde(default = "default_max_reengagements")]
    pub max_reengagements: u32,

    /// Spoken re-engagement prompt
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

fn default_check_interval_ms() -> u64 {
    1000
}
fn default_threshold_ms() -> u64 {
    10_000
}
fn default_cooldown_ms() -> u64 {
    2000
}
fn default_max_reengagements() -> u32 {
    2
}
fn default_prompt() -> String {
    "Are you still there?".to_string()
}

impl SilenceConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: default_check_interval_ms(),
            threshold_ms: default_threshold_ms(),
            cooldown_ms: default_cooldown_ms(),
            max_reengagements: default_max_reengagements(),
            prompt: default_prompt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let silence: SilenceConfig = serde_yaml::from_str("threshold_ms: 4000").unwrap();
        assert_eq!(silence.threshold(), Duration::from_secs(4));
        assert_eq!(silence.check_interval_ms, 1000);
        assert_eq!(silence.prompt, "Are you still there?");
    }

    #[test]
    fn test_interruption_defaults() {
        let config = InterruptionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.min_duration(), Duration::from_millis(500));
        assert_eq!(config.min_words, 2);
    }
}
