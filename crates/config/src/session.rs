//! Reply generation and session loop configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reply generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Start generating on a tentative turn end
    #[serde(default = "default_true")]
    pub speculative: bool,

    /// Max wait for the first reply chunk (ms)
    #[serde(default = "default_first_token_timeout_ms")]
    pub first_token_timeout_ms: u64,

    /// Max gap between reply or audio chunks (ms)
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,

    /// Retries with the same snapshot before falling back
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Spoken when the reply backend keeps failing
    #[serde(default = "default_fallback_utterance")]
    pub fallback_utterance: String,

    /// Move past the current stage after a fallback
    #[serde(default = "default_true")]
    pub skip_stage_on_fallback: bool,

    /// Knowledge lookup budget (ms)
    #[serde(default = "default_retrieval_timeout_ms")]
    pub retrieval_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_first_token_timeout_ms() -> u64 {
    5000
}
fn default_stream_idle_timeout_ms() -> u64 {
    3000
}
fn default_max_retries() -> u32 {
    1
}
fn default_fallback_utterance() -> String {
    "I'm sorry, I'm having a little trouble right now. Let's move on.".to_string()
}
fn default_retrieval_timeout_ms() -> u64 {
    300
}

impl GenerationConfig {
    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_millis(self.first_token_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            speculative: true,
            first_token_timeout_ms: default_first_token_timeout_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            max_retries: default_max_retries(),
            fallback_utterance: default_fallback_utterance(),
            skip_stage_on_fallback: true,
            retrieval_timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}

/// Session event loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timer tick driving turn and interruption deadlines (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Budget for collapsing history at group boundaries (ms)
    #[serde(default = "default_summary_timeout_ms")]
    pub summary_timeout_ms: u64,

    /// Budget for delivering the final report (ms)
    #[serde(default = "default_report_timeout_ms")]
    pub report_timeout_ms: u64,

    /// End the call once the terminal stage completes
    #[serde(default = "default_true")]
    pub end_on_flow_complete: bool,

    /// Capacity of the external input channel
    #[serde(default = "default_input_buffer")]
    pub input_buffer: usize,

    /// Capacity of the observer broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_poll_interval_ms() -> u64 {
    20
}
fn default_summary_timeout_ms() -> u64 {
    2000
}
fn default_report_timeout_ms() -> u64 {
    15_000
}
fn default_input_buffer() -> usize {
    256
}
fn default_event_buffer() -> usize {
    128
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_millis(self.summary_timeout_ms)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            summary_timeout_ms: default_summary_timeout_ms(),
            report_timeout_ms: default_report_timeout_ms(),
            end_on_flow_complete: true,
            input_buffer: default_input_buffer(),
            event_buffer: default_event_buffer(),
        }
    }
}
