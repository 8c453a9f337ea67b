//! Turn-boundary signals

use serde::{Deserialize, Serialize};

/// Voice activity boundary reported by the VAD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VadBoundary {
    SpeechStart,
    SpeechEnd,
}

/// Discrete turn event consumed by the session loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TurnEvent {
    /// User speech passed the minimum duration.
    /// `resumed` is set when speech continues an utterance that was
    /// already tentatively ended.
    SpeechStarted { resumed: bool },
    /// Silence after speech with no final text yet
    SpeechEndedTentative { text: String },
    /// Turn text is final and safe to act on
    SpeechEndedCommitted { text: String, degraded: bool },
    /// Utterance produced no usable text (noise)
    SpeechAbandoned,
    /// No user speech for a full threshold period
    SilenceTimeout { consecutive: u32 },
    AgentSpeaking { generation: u64 },
    AgentSpeechDone { generation: u64, interrupted: bool },
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::SpeechStarted { .. } => "speech_started",
            TurnEvent::SpeechEndedTentative { .. } => "speech_ended_tentative",
            TurnEvent::SpeechEndedCommitted { .. } => "speech_ended_committed",
            TurnEvent::SpeechAbandoned => "speech_abandoned",
            TurnEvent::SilenceTimeout { .. } => "silence_timeout",
            TurnEvent::AgentSpeaking { .. } => "agent_speaking",
            TurnEvent::AgentSpeechDone { .. } => "agent_speech_done",
        }
    }
}
