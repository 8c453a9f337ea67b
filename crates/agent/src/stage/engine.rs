//! Runtime walk through a validated flow

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dialogue_config::{EntryAction, GroupExit, StageDefinition};
use dialogue_core::{FieldValue, OutcomeField};

use super::{CompletionReason, FlowError, StageFlow, StageResult};

/// A stage that was just entered
#[derive(Debug, Clone, PartialEq)]
pub struct StageEntry {
    pub stage: String,
    pub group: String,
    pub instructions: String,
    pub on_enter: Option<EntryAction>,
    /// The group just left asked for its history to be summarized
    pub summarize_previous: bool,
}

/// What follows a completed stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageAdvance {
    Entered(StageEntry),
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageCompletion {
    pub result: StageResult,
    pub next: StageAdvance,
}

#[derive(Debug, Clone)]
struct Position {
    group: String,
    index: usize,
}

/// Per-stage progress
#[derive(Debug, Default)]
struct StageProgress {
    fields: BTreeMap<String, FieldValue>,
    signalled: bool,
    user_turns: u32,
    exchanges: u32,
    awaiting_reply: bool,
}

/// Tracks the current stage and decides when it is complete
#[derive(Debug)]
pub struct StageFlowEngine {
    flow: Arc<StageFlow>,
    position: Option<Position>,
    progress: StageProgress,
    results: Vec<StageResult>,
    visited: HashSet<String>,
    finished: bool,
}

impl StageFlowEngine {
    pub fn new(flow: Arc<StageFlow>) -> Self {
        Self {
            flow,
            position: None,
            progress: StageProgress::default(),
            results: Vec::new(),
            visited: HashSet::new(),
            finished: false,
        }
    }

    pub fn flow(&self) -> &StageFlow {
        &self.flow
    }

    /// Enter the first stage of the entry group
    pub fn start(&mut self) -> Result<StageEntry, FlowError> {
        if self.position.is_some() || self.finished {
            return Err(FlowError::NotRunning);
        }
        let entry = self.flow.entry_group().to_string();
        self.enter(&entry, 0, false)
    }

    pub fn current_stage_id(&self) -> Option<&str> {
        let position = self.position.as_ref()?;
        self.flow
            .group(&position.group)
            .and_then(|g| g.stages.get(position.index))
            .map(String::as_str)
    }

    pub fn current_stage(&self) -> Option<&StageDefinition> {
        self.current_stage_id().and_then(|id| self.flow.stage(id))
    }

    /// Fields the current stage may record
    pub fn outcome_fields(&self) -> Vec<OutcomeField> {
        self.current_stage()
            .map(|s| s.fields.clone())
            .unwrap_or_default()
    }

    /// Record an outcome for the current stage
    pub fn record(&mut self, field: &str, value: FieldValue) -> Result<(), FlowError> {
        let stage = self.current_stage().ok_or(FlowError::NotRunning)?;
        if !stage.declares(field) {
            return Err(FlowError::UndeclaredField {
                stage: stage.id.clone(),
                field: field.to_string(),
            });
        }
        tracing::debug!(stage = %stage.id, field, value = %value, "Outcome recorded");
        self.progress.fields.insert(field.to_string(), value);
        Ok(())
    }

    /// The reply backend declared the current stage finished
    pub fn signal_done(&mut self) {
        self.progress.signalled = true;
    }

    /// A user turn was committed in the current stage
    pub fn record_turn(&mut self) {
        self.progress.user_turns += 1;
        self.progress.awaiting_reply = true;
    }

    /// The agent finished replying to the latest user turn
    pub fn reply_completed(&mut self) {
        if self.progress.awaiting_reply {
            self.progress.awaiting_reply = false;
            self.progress.exchanges += 1;
        }
    }

    /// Complete the current stage if its conditions are met
    pub fn evaluate(&mut self) -> Result<Option<StageCompletion>, FlowError> {
        let Some(stage) = self.current_stage() else {
            return Ok(None);
        };

        let required: Vec<&str> = stage
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        let progress = &self.progress;

        let reason = if progress.signalled {
            Some(CompletionReason::Signalled)
        } else if !required.is_empty() && required.iter().all(|f| progress.fields.contains_key(*f)) {
            Some(CompletionReason::FieldsCaptured)
        } else if required.is_empty() && progress.exchanges > 0 {
            Some(CompletionReason::ExchangeComplete)
        } else if progress.user_turns >= self.flow.max_turns(stage) && !progress.awaiting_reply {
            tracing::warn!(
                stage = %stage.id,
                turns = progress.user_turns,
                "Stage turn budget exhausted"
            );
            Some(CompletionReason::TurnBudget)
        } else {
            None
        };

        match reason {
            Some(reason) => self.complete(reason).map(Some),
            None => Ok(None),
        }
    }

    /// Complete the current stage unconditionally and move on
    pub fn skip_current(&mut self) -> Result<StageCompletion, FlowError> {
        self.complete(CompletionReason::Skipped)
    }

    /// Close the current stage and jump straight to the terminal stage
    pub fn force_close(&mut self) -> Result<StageCompletion, FlowError> {
        if self.in_terminal() {
            return self.complete(CompletionReason::ForcedClose);
        }

        let from_group = self.position.as_ref().ok_or(FlowError::NotRunning)?.group.clone();
        let result = self.close_stage(CompletionReason::ForcedClose)?;

        let target = self
            .flow
            .terminal_group()
            .map(|g| (g.id.clone(), g.stages.len() - 1))
            .ok_or_else(|| FlowError::UnknownTerminal(self.flow.terminal().to_string()))?;
        let summarize = self.flow.group(&from_group).map_or(false, |g| g.summarize);
        let entry = self.enter(&target.0, target.1, summarize && target.0 != from_group)?;

        Ok(StageCompletion {
            result,
            next: StageAdvance::Entered(entry),
        })
    }

    pub fn in_terminal(&self) -> bool {
        self.current_stage_id() == Some(self.flow.terminal())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Completed stages in completion order
    pub fn results(&self) -> &[StageResult] {
        &self.results
    }

    fn value_of(&self, stage: &str, field: &str) -> Option<&FieldValue> {
        self.results
            .iter()
            .find(|r| r.stage == stage)
            .and_then(|r| r.fields.get(field))
    }

    fn close_stage(&mut self, reason: CompletionReason) -> Result<StageResult, FlowError> {
        let stage = self.current_stage_id().ok_or(FlowError::NotRunning)?.to_string();
        let progress = std::mem::take(&mut self.progress);
        let result = StageResult {
            stage,
            fields: progress.fields,
            reason,
            degraded: reason.is_degraded(),
        };
        tracing::info!(
            stage = %result.stage,
            reason = reason.as_str(),
            fields = result.fields.len(),
            "Stage completed"
        );
        self.results.push(result.clone());
        Ok(result)
    }

    fn complete(&mut self, reason: CompletionReason) -> Result<StageCompletion, FlowError> {
        let position = self.position.clone().ok_or(FlowError::NotRunning)?;
        let result = self.close_stage(reason)?;

        let flow = self.flow.clone();
        let group = flow
            .group(&position.group)
            .ok_or_else(|| FlowError::UnknownGroup(position.group.clone()))?;

        if position.index + 1 < group.stages.len() {
            let entry = self.enter(&position.group, position.index + 1, false)?;
            return Ok(StageCompletion {
                result,
                next: StageAdvance::Entered(entry),
            });
        }

        let next_group = match &group.exit {
            GroupExit::End => None,
            GroupExit::Next { group } => Some(group.clone()),
            GroupExit::Branch(branch) => {
                let matched = self
                    .value_of(&branch.stage, &branch.field)
                    .map_or(false, |value| value.matches(&branch.equals));
                tracing::debug!(
                    stage = %branch.stage,
                    field = %branch.field,
                    matched,
                    "Evaluated branch"
                );
                Some(if matched {
                    branch.then.clone()
                } else {
                    branch.otherwise.clone()
                })
            }
        };

        match next_group {
            Some(next) => {
                let entry = self.enter(&next, 0, group.summarize)?;
                Ok(StageCompletion {
                    result,
                    next: StageAdvance::Entered(entry),
                })
            }
            None => {
                tracing::info!(flow = %flow.name(), "Flow finished");
                self.position = None;
                self.finished = true;
                Ok(StageCompletion {
                    result,
                    next: StageAdvance::Finished,
                })
            }
        }
    }

    fn enter(&mut self, group_id: &str, index: usize, summarize_previous: bool) -> Result<StageEntry, FlowError> {
        let group = self
            .flow
            .group(group_id)
            .ok_or_else(|| FlowError::UnknownGroup(group_id.to_string()))?;
        let stage_id = group.stages.get(index).ok_or_else(|| FlowError::UnknownStage {
            group: group_id.to_string(),
            stage: format!("#{}", index),
        })?;
        let stage = self.flow.stage(stage_id).ok_or_else(|| FlowError::UnknownStage {
            group: group_id.to_string(),
            stage: stage_id.clone(),
        })?;

        if !self.visited.insert(stage.id.clone()) {
            return Err(FlowError::Revisit(stage.id.clone()));
        }

        let entry = StageEntry {
            stage: stage.id.clone(),
            group: group_id.to_string(),
            instructions: stage.instructions.clone(),
            on_enter: stage.on_enter.clone(),
            summarize_previous,
        };

        tracing::info!(stage = %entry.stage, group = %entry.group, "Entered stage");
        self.position = Some(Position {
            group: group_id.to_string(),
            index,
        });
        self.progress = StageProgress::default();
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialogue_config::FlowDefinition;

    fn engine() -> StageFlowEngine {
        let flow = StageFlow::build(FlowDefinition::default()).unwrap();
        StageFlowEngine::new(Arc::new(flow))
    }

    fn exchange(engine: &mut StageFlowEngine) -> Option<StageCompletion> {
        engine.record_turn();
        engine.reply_completed();
        engine.evaluate().unwrap()
    }

    fn entered(completion: &StageCompletion) -> &StageEntry {
        match &completion.next {
            StageAdvance::Entered(entry) => entry,
            StageAdvance::Finished => panic!("flow finished early"),
        }
    }

    #[test]
    fn test_start_enters_opening() {
        let mut engine = engine();
        let entry = engine.start().unwrap();
        assert_eq!(entry.stage, "opening");
        assert_eq!(entry.group, "opening");
        assert!(matches!(entry.on_enter, Some(EntryAction::Greet { .. })));
        assert_eq!(engine.outcome_fields()[0].name, "proceed");
        assert!(engine.start().is_err());
    }

    #[test]
    fn test_required_field_completes_stage_and_branches() {
        let mut engine = engine();
        engine.start().unwrap();

        engine.record_turn();
        assert!(engine.evaluate().unwrap().is_none());

        engine.record("proceed", FieldValue::Text("no".into())).unwrap();
        engine.reply_completed();
        let completion = engine.evaluate().unwrap().unwrap();
        assert_eq!(completion.result.reason, CompletionReason::FieldsCaptured);
        assert!(!completion.result.degraded);

        let entry = entered(&completion);
        assert_eq!(entry.stage, "schedule_callback");
        assert_eq!(entry.group, "callback");
        assert!(!entry.summarize_previous);
    }

    #[test]
    fn test_missing_branch_field_takes_otherwise() {
        let mut engine = engine();
        engine.start().unwrap();
        let completion = engine.force_close().unwrap();
        assert_eq!(entered(&completion).stage, "closing");

        let mut engine = self::engine();
        engine.start().unwrap();
        for _ in 0..4 {
            engine.record_turn();
            engine.reply_completed();
        }
        let completion = engine.evaluate().unwrap().unwrap();
        assert_eq!(completion.result.reason, CompletionReason::TurnBudget);
        assert!(completion.result.degraded);
        assert_eq!(entered(&completion).stage, "schedule_callback");
    }

    #[test]
    fn test_undeclared_field_rejected() {
        let mut engine = engine();
        engine.start().unwrap();
        assert!(matches!(
            engine.record("hospital", FieldValue::Text("City".into())),
            Err(FlowError::UndeclaredField { .. })
        ));
    }

    #[test]
    fn test_exchange_completes_stage_without_required_fields() {
        let mut engine = engine();
        engine.start().unwrap();
        engine.record("proceed", FieldValue::Bool(true)).unwrap();
        let completion = exchange(&mut engine).unwrap();
        let entry = entered(&completion);
        assert_eq!(entry.stage, "confirmation");
        assert!(!entry.summarize_previous);

        engine.signal_done();
        let completion = engine.evaluate().unwrap().unwrap();
        assert_eq!(completion.result.reason, CompletionReason::Signalled);
        assert_eq!(entered(&completion).stage, "diagnosis");

        // No user turn yet, so no exchange
        assert!(engine.evaluate().unwrap().is_none());
        let completion = exchange(&mut engine).unwrap();
        assert_eq!(completion.result.reason, CompletionReason::ExchangeComplete);
        assert_eq!(entered(&completion).stage, "treatment");

        engine.record("started", FieldValue::Bool(false)).unwrap();
        let completion = exchange(&mut engine).unwrap();
        let entry = entered(&completion);
        assert_eq!(entry.stage, "timeline");
        assert!(entry.summarize_previous);
    }

    #[test]
    fn test_terminal_stage_finishes_flow() {
        let mut engine = engine();
        engine.start().unwrap();
        engine.record("proceed", FieldValue::Bool(false)).unwrap();
        exchange(&mut engine).unwrap();
        engine.record("callback_preference", FieldValue::Text("tomorrow".into())).unwrap();
        exchange(&mut engine).unwrap();
        assert!(engine.in_terminal());

        engine.signal_done();
        let completion = engine.evaluate().unwrap().unwrap();
        assert_eq!(completion.next, StageAdvance::Finished);
        assert!(engine.is_finished());

        let results = engine.results();
        let stages: Vec<&str> = results.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(stages, vec!["opening", "schedule_callback", "closing"]);
        assert_eq!(results[0].fields["proceed"], FieldValue::Bool(false));
        assert!(results[2].fields.is_empty());
    }

    #[test]
    fn test_force_close_from_terminal_completes_it() {
        let mut engine = engine();
        engine.start().unwrap();
        engine.force_close().unwrap();
        assert!(engine.in_terminal());

        let completion = engine.force_close().unwrap();
        assert_eq!(completion.result.reason, CompletionReason::ForcedClose);
        assert_eq!(completion.next, StageAdvance::Finished);
    }
}
