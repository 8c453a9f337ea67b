//! Core types and collaborator traits for the dialogue orchestrator
//!
//! This crate provides foundational types used across all other crates:
//! - Conversation turns and caller metadata
//! - Recognizer output and turn-boundary events
//! - Stage outcome values
//! - The end-of-call report payload
//! - Traits for the external collaborators (reply, synthesis, playback,
//!   retrieval, summarization, report delivery)

pub mod conversation;
pub mod error;
pub mod outcome;
pub mod report;
pub mod signal;
pub mod traits;
pub mod transcript;

pub use conversation::{CallerInfo, Turn, TurnRole};
pub use error::BackendError;
pub use outcome::{FieldValue, OutcomeField};
pub use report::{
    Degradation, EndReason, NoopHooks, ReportSink, SessionHooks, SessionReport, TranscriptEntry,
};
pub use signal::{TurnEvent, VadBoundary};
pub use traits::{
    AudioSink, AudioStream, KnowledgeRetriever, PlaybackFrame, ReplyBackend, ReplyChunk,
    ReplyRequest, ReplyStream, SpeechSynthesizer, Summarizer, SynthesizedAudio,
};
pub use transcript::TranscriptResult;
