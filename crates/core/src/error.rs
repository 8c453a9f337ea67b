//! Error types shared by collaborator traits

use thiserror::Error;

/// Failure reported by an external collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Reply generation error: {0}")]
    Generation(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Summarization error: {0}")]
    Summarization(String),

    #[error("Report delivery error: {0}")]
    Delivery(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}
