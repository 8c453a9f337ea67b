//! Collaborator traits
//!
//! The orchestrator talks to every provider through these traits so that
//! backends can be swapped without code changes and mocked in tests.
//!
//! ```text
//! ReplyBackend:       ReplyRequest → stream of ReplyChunk
//! SpeechSynthesizer:  text → stream of SynthesizedAudio
//! AudioSink:          PlaybackFrame → speaker, clear()
//! KnowledgeRetriever: query → optional reference text
//! Summarizer:         turns → compact summary
//! ```

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::conversation::Turn;
use crate::error::BackendError;
use crate::outcome::{FieldValue, OutcomeField};

/// Stream of reply chunks. Dropping it cancels the request.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<ReplyChunk, BackendError>> + Send>>;

/// Stream of synthesized audio. Dropping it cancels synthesis.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<SynthesizedAudio, BackendError>> + Send>>;

/// Everything the reply backend needs for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRequest {
    /// Context generation this request was built from
    pub generation: u64,
    /// Active instructions (plus any one-off additions)
    pub instructions: String,
    pub history: Vec<Turn>,
    /// Fields the backend may record for the current stage
    #[serde(default)]
    pub outcome_fields: Vec<OutcomeField>,
}

/// One item of a streamed reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyChunk {
    /// Spoken reply text
    Text(String),
    /// Structured outcome extracted from the exchange
    Record { field: String, value: FieldValue },
    /// The backend considers the current stage finished
    StageDone,
}

/// A block of synthesized audio
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Mono PCM samples
    pub samples: Arc<[f32]>,
    /// Byte offset in the source text covered once this block has played
    pub text_end: usize,
}

/// Audio tagged with the generation that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFrame {
    pub generation: u64,
    pub samples: Arc<[f32]>,
}

/// Streaming reply generation
#[async_trait]
pub trait ReplyBackend: Send + Sync {
    async fn generate(&self, request: ReplyRequest) -> Result<ReplyStream, BackendError>;

    fn name(&self) -> &str {
        "reply"
    }
}

/// Incremental speech synthesis
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, BackendError>;

    /// Synthesize `text` starting at byte `offset`.
    ///
    /// `text_end` offsets in the returned stream refer to the full text.
    async fn synthesize_from(&self, text: &str, offset: usize) -> Result<AudioStream, BackendError> {
        let suffix = text.get(offset..).unwrap_or_default();
        let stream = self.synthesize(suffix).await?;
        Ok(Box::pin(stream.map(move |item| {
            item.map(|mut audio| {
                audio.text_end += offset;
                audio
            })
        })))
    }
}

/// Playback collaborator
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue a frame; resolves once the frame has been handed to the speaker
    async fn play(&self, frame: PlaybackFrame) -> Result<(), BackendError>;

    /// Drop anything queued but not yet heard
    fn clear(&self);
}

/// Best-effort reference lookup used to enrich replies
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn search(&self, query: &str) -> Option<String>;
}

/// Produces a compact summary of conversation history
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[Turn]) -> Result<String, BackendError>;
}
