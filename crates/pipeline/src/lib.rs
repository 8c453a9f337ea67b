//! Turn-taking machinery
//!
//! This crate provides the state machines that decide when the user has
//! spoken and how agent speech reacts to it:
//! - Turn boundary detection from voice activity and recognizer finality
//! - Interruption (barge-in) classification and false-interruption recovery
//! - Silence monitoring for re-engagement
//!
//! Everything here is driven by explicit timestamps so the session loop can
//! own the clock.

pub mod interruption;
pub mod silence;
pub mod turn_detection;

pub use interruption::{CommitAction, InterruptionController, InterruptionDecision, InterruptionState};
pub use silence::{Activity, SilenceMonitor};
pub use turn_detection::{TurnPhase, TurnSignalAggregator};
