//! Stage-based conversation flow
//!
//! A [`StageFlow`] is a validated flow definition: every path from the entry
//! group is finite, never repeats a stage, and ends on the terminal stage.
//! A [`StageFlowEngine`] walks one session through it, recording outcome
//! fields and deciding when each stage is complete.

mod engine;
mod graph;

pub use engine::{StageAdvance, StageCompletion, StageEntry, StageFlowEngine};
pub use graph::{FlowPath, StageFlow};

use std::collections::BTreeMap;

use dialogue_core::FieldValue;
use serde::Serialize;
use thiserror::Error;

/// Why a stage completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Every required field was recorded
    FieldsCaptured,
    /// No required fields; one full exchange happened
    ExchangeComplete,
    /// The reply backend signalled the stage is done
    Signalled,
    /// Turn budget ran out
    TurnBudget,
    /// Skipped after a backend failure
    Skipped,
    /// Closed early to reach the terminal stage
    ForcedClose,
}

impl CompletionReason {
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            CompletionReason::TurnBudget | CompletionReason::Skipped | CompletionReason::ForcedClose
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::FieldsCaptured => "fields_captured",
            CompletionReason::ExchangeComplete => "exchange_complete",
            CompletionReason::Signalled => "signalled",
            CompletionReason::TurnBudget => "turn_budget",
            CompletionReason::Skipped => "skipped",
            CompletionReason::ForcedClose => "forced_close",
        }
    }
}

/// Outcome of one completed stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub reason: CompletionReason,
    pub degraded: bool,
}

/// Flow definition and runtime errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    #[error("Unknown group '{0}'")]
    UnknownGroup(String),

    #[error("Group '{group}' references unknown stage '{stage}'")]
    UnknownStage { group: String, stage: String },

    #[error("Terminal stage '{0}' is not defined")]
    UnknownTerminal(String),

    #[error("Group '{0}' has no stages")]
    EmptyGroup(String),

    #[error("Duplicate {kind} id '{id}'")]
    Duplicate { kind: &'static str, id: String },

    #[error("Cycle through group '{0}'")]
    Cycle(String),

    #[error("Stage '{stage}' repeats on path {path}")]
    RepeatedStage { stage: String, path: String },

    #[error("Path {path} ends on '{last}' instead of terminal stage '{terminal}'")]
    TerminalMismatch {
        path: String,
        last: String,
        terminal: String,
    },

    #[error("Terminal stage '{stage}' must be the last stage of an ending group (found in '{group}')")]
    TerminalNotLast { stage: String, group: String },

    #[error("Branch field '{field}' is not declared by stage '{stage}'")]
    UndeclaredBranchField { stage: String, field: String },

    #[error("Branch in group '{group}' inspects stage '{stage}' which does not precede it")]
    BranchStageNotVisited { group: String, stage: String },

    #[error("Group '{0}' is unreachable from the entry group")]
    UnreachableGroup(String),

    #[error("Stage '{stage}' does not declare field '{field}'")]
    UndeclaredField { stage: String, field: String },

    #[error("Stage '{0}' was already visited")]
    Revisit(String),

    #[error("Flow is not running")]
    NotRunning,
}
