//! Turn boundary detection
//!
//! Fuses voice activity boundaries with recognizer finality. Final text
//! commits a turn on its own; silence without final text produces a
//! tentative end that either gets confirmed, continued, or force-committed.

mod aggregator;

pub use aggregator::{TurnPhase, TurnSignalAggregator};
