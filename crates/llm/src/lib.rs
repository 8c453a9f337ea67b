//! Reply generation for the dialogue orchestrator
//!
//! Features:
//! - Streaming replies chunked at sentence and clause boundaries
//! - Incremental synthesis so audio starts before the reply is complete
//! - Gated (speculative) generation that can be confirmed or discarded
//! - Resumption of halted utterances
//! - History summarization for context collapse

pub mod generation;
pub mod streaming;
pub mod summarizer;

pub use generation::{
    normalize, GenerationEvent, GenerationHandle, GenerationOutput, GenerationTiming,
    UtteranceGenerator,
};
pub use streaming::{SpeechChunk, SpeechChunker};
pub use summarizer::{BackendSummarizer, TranscriptSummarizer};

use dialogue_core::BackendError;
use thiserror::Error;

/// Generation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Timed out waiting for {what} after {ms}ms")]
    Timeout { what: &'static str, ms: u64 },

    #[error("Reply backend returned nothing")]
    EmptyReply,

    #[error("Generation cancelled")]
    Cancelled,
}

impl LlmError {
    pub(crate) fn timeout(what: &'static str, after: std::time::Duration) -> Self {
        LlmError::Timeout {
            what,
            ms: after.as_millis() as u64,
        }
    }
}
