//! Conversation context
//!
//! Holds the turn history the reply backend sees and the full transcript
//! the report is built from. Each snapshot is stamped with a fresh
//! generation number so late events from superseded utterances can be told
//! apart from current ones.

use dialogue_core::{BackendError, OutcomeField, ReplyRequest, Summarizer, Turn, TurnRole};

/// Immutable view of the context for one generation
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    pub generation: u64,
    pub instructions: String,
    pub history: Vec<Turn>,
}

impl ContextSnapshot {
    pub fn into_request(self, outcome_fields: Vec<OutcomeField>) -> ReplyRequest {
        ReplyRequest {
            generation: self.generation,
            instructions: self.instructions,
            history: self.history,
            outcome_fields,
        }
    }
}

#[derive(Debug)]
pub struct ContextManager {
    preamble: String,
    instructions: String,
    /// History sent to the reply backend; collapsed at group boundaries
    turns: Vec<Turn>,
    /// Everything said, never collapsed
    transcript: Vec<Turn>,
    generation: u64,
}

impl ContextManager {
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into(),
            instructions: String::new(),
            turns: Vec::new(),
            transcript: Vec::new(),
            generation: 0,
        }
    }

    /// Replace the active stage instructions
    pub fn set_instructions(&mut self, instructions: impl Into<String>) {
        self.instructions = instructions.into();
    }

    /// Preamble and stage instructions as sent to the backend
    pub fn instructions(&self) -> String {
        match (self.preamble.trim(), self.instructions.trim()) {
            ("", stage) => stage.to_string(),
            (preamble, "") => preamble.to_string(),
            (preamble, stage) => format!("{}\n\n{}", preamble, stage),
        }
    }

    pub fn append_turn(&mut self, role: TurnRole, content: impl Into<String>) {
        let turn = Turn::new(role, content);
        self.transcript.push(turn.clone());
        self.turns.push(turn);
    }

    pub fn history(&self) -> &[Turn] {
        &self.turns
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reserve a generation number for an utterance that needs no snapshot
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn snapshot(&mut self) -> ContextSnapshot {
        ContextSnapshot {
            generation: self.next_generation(),
            instructions: self.instructions(),
            history: self.turns.clone(),
        }
    }

    /// Snapshot with a user turn that has not been committed yet
    pub fn snapshot_with_user(&mut self, provisional: &str) -> ContextSnapshot {
        let mut snapshot = self.snapshot();
        snapshot.history.push(Turn::user(provisional.trim()));
        snapshot
    }

    /// Snapshot whose instructions carry a one-off addition
    pub fn ephemeral_instructions(&mut self, extra: &str) -> ContextSnapshot {
        let mut snapshot = self.snapshot();
        if !extra.trim().is_empty() {
            snapshot.instructions = format!("{}\n\n{}", snapshot.instructions, extra.trim());
        }
        snapshot
    }

    /// Replace the history (including any earlier summary) with a single
    /// summary turn. Instructions and transcript are untouched.
    ///
    /// Returns `None` when there was nothing to summarize.
    pub async fn summarize_and_collapse(
        &mut self,
        summarizer: &dyn Summarizer,
    ) -> Result<Option<String>, BackendError> {
        if self.turns.is_empty() {
            return Ok(None);
        }
        let summary = summarizer.summarize(&self.turns).await?;
        tracing::debug!(
            turns = self.turns.len(),
            summary_len = summary.len(),
            "Collapsed conversation history"
        );
        self.turns = vec![Turn::summary(summary.clone())];
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialogue_llm::TranscriptSummarizer;

    #[test]
    fn test_snapshots_take_fresh_generations() {
        let mut context = ContextManager::new("Be kind.");
        context.set_instructions("Ask about timing.");
        context.append_turn(TurnRole::Assistant, "Is now a good time?");

        let first = context.snapshot();
        let second = context.snapshot_with_user(" yes it is ");
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(first.instructions, "Be kind.\n\nAsk about timing.");
        assert_eq!(second.history.last().unwrap().content, "yes it is");
        assert_eq!(context.history().len(), 1);
    }

    #[test]
    fn test_ephemeral_instructions_do_not_stick() {
        let mut context = ContextManager::new("");
        context.set_instructions("Stage rules.");
        let snapshot = context.ephemeral_instructions("Say goodbye.");
        assert_eq!(snapshot.instructions, "Stage rules.\n\nSay goodbye.");
        assert_eq!(context.instructions(), "Stage rules.");

        let request = snapshot.into_request(vec![OutcomeField::required("proceed", "")]);
        assert_eq!(request.outcome_fields.len(), 1);
    }

    #[tokio::test]
    async fn test_collapse_keeps_instructions_and_transcript() {
        let mut context = ContextManager::new("Preamble.");
        context.set_instructions("Intake rules.");
        context.append_turn(TurnRole::Assistant, "Have you seen a doctor?");
        context.append_turn(TurnRole::User, "Yes, last week.");

        let summary = context
            .summarize_and_collapse(&TranscriptSummarizer::default())
            .await
            .unwrap();
        assert!(summary.is_some());
        assert_eq!(context.history().len(), 1);
        assert_eq!(context.history()[0].role, TurnRole::Summary);

        context.set_instructions("Geography rules.");
        context.append_turn(TurnRole::User, "I'm from Pune.");
        context
            .summarize_and_collapse(&TranscriptSummarizer::default())
            .await
            .unwrap();

        let summaries = context
            .history()
            .iter()
            .filter(|t| t.role == TurnRole::Summary)
            .count();
        assert_eq!(summaries, 1);
        assert_eq!(context.history().len(), 1);
        assert!(context.history()[0].content.contains("Earlier:"));
        assert_eq!(context.instructions(), "Preamble.\n\nGeography rules.");
        assert_eq!(context.transcript().len(), 3);
    }

    #[tokio::test]
    async fn test_collapse_empty_history() {
        let mut context = ContextManager::new("");
        let summary = context
            .summarize_and_collapse(&TranscriptSummarizer::default())
            .await
            .unwrap();
        assert!(summary.is_none());
    }
}
