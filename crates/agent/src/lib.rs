//! Dialogue agent
//!
//! Runs one phone conversation end to end:
//! - Validates the stage flow and walks a session through it
//! - Keeps the conversation context and collapses it at group boundaries
//! - Owns the per-session event loop that ties turn detection,
//!   interruption handling, silence monitoring and utterance generation
//! - Builds and delivers the end-of-call report

pub mod context;
pub mod report;
pub mod session;
pub mod stage;

pub use context::{ContextManager, ContextSnapshot};
pub use report::SessionReporter;
pub use session::{
    Collaborators, DialogueSession, SessionEvent, SessionHandle, SessionInput, TurnMetrics,
};
pub use stage::{
    CompletionReason, FlowError, FlowPath, StageAdvance, StageCompletion, StageEntry, StageFlow,
    StageFlowEngine, StageResult,
};

use dialogue_core::BackendError;
use thiserror::Error;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Report delivery timed out after {0}ms")]
    ReportTimeout(u64),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Session task failed: {0}")]
    Join(String),
}
