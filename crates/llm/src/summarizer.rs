//! History summarization
//!
//! Used when a stage group is left with summarization enabled: the history
//! since the previous collapse is replaced by one compact summary turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dialogue_core::{BackendError, ReplyBackend, ReplyChunk, ReplyRequest, Summarizer, Turn, TurnRole};
use futures::StreamExt;
use tokio::time::timeout;

const SUMMARY_INSTRUCTIONS: &str = "Summarize the conversation so far in a few short sentences. \
Keep every fact the caller shared (names, dates, answers to questions). \
Write in the third person. Output only the summary.";

/// Extractive fallback: keeps the gist of each turn
#[derive(Debug, Clone)]
pub struct TranscriptSummarizer {
    max_chars_per_turn: usize,
}

impl TranscriptSummarizer {
    pub fn new(max_chars_per_turn: usize) -> Self {
        Self { max_chars_per_turn }
    }

    pub fn summarize_turns(&self, turns: &[Turn]) -> String {
        let lines: Vec<String> = turns
            .iter()
            .filter(|turn| !turn.content.trim().is_empty())
            .map(|turn| {
                let speaker = match turn.role {
                    TurnRole::User => "Caller",
                    TurnRole::Assistant => "Agent",
                    TurnRole::Summary => "Earlier",
                };
                format!("{}: {}", speaker, truncate(turn.content.trim(), self.max_chars_per_turn))
            })
            .collect();
        lines.join("\n")
    }
}

impl Default for TranscriptSummarizer {
    fn default() -> Self {
        Self::new(160)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(' ') {
        Some(space) if space > 0 => format!("{}…", &cut[..space]),
        _ => format!("{}…", cut),
    }
}

#[async_trait]
impl Summarizer for TranscriptSummarizer {
    async fn summarize(&self, turns: &[Turn]) -> Result<String, BackendError> {
        Ok(self.summarize_turns(turns))
    }
}

/// Asks the reply backend for a summary, falling back to the extractive one
pub struct BackendSummarizer {
    backend: Arc<dyn ReplyBackend>,
    timeout: Duration,
    fallback: TranscriptSummarizer,
}

impl BackendSummarizer {
    pub fn new(backend: Arc<dyn ReplyBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            fallback: TranscriptSummarizer::default(),
        }
    }

    async fn request_summary(&self, turns: &[Turn]) -> Result<String, BackendError> {
        let request = ReplyRequest {
            generation: 0,
            instructions: SUMMARY_INSTRUCTIONS.to_string(),
            history: turns.to_vec(),
            outcome_fields: Vec::new(),
        };

        let mut stream = self.backend.generate(request).await?;
        let mut summary = String::new();
        while let Some(chunk) = stream.next().await {
            if let ReplyChunk::Text(text) = chunk? {
                summary.push_str(&text);
            }
        }
        Ok(summary.trim().to_string())
    }
}

#[async_trait]
impl Summarizer for BackendSummarizer {
    async fn summarize(&self, turns: &[Turn]) -> Result<String, BackendError> {
        match timeout(self.timeout, self.request_summary(turns)).await {
            Ok(Ok(summary)) if !summary.is_empty() => return Ok(summary),
            Ok(Ok(_)) => tracing::warn!("Summary backend returned nothing, using transcript summary"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Summary backend failed, using transcript summary"),
            Err(_) => tracing::warn!(
                timeout_ms = self.timeout.as_millis() as u64,
                "Summary backend timed out, using transcript summary"
            ),
        }
        Ok(self.fallback.summarize_turns(turns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialogue_core::ReplyStream;
    use futures::stream;

    struct FixedReply(Option<&'static str>);

    #[async_trait]
    impl ReplyBackend for FixedReply {
        async fn generate(&self, _request: ReplyRequest) -> Result<ReplyStream, BackendError> {
            match self.0 {
                Some(text) => Ok(Box::pin(stream::iter(vec![
                    Ok(ReplyChunk::Text(text.to_string())),
                    Ok(ReplyChunk::StageDone),
                ]))),
                None => Ok(Box::pin(stream::pending())),
            }
        }
    }

    fn turns() -> Vec<Turn> {
        vec![
            Turn::assistant("Is this a good time to talk?"),
            Turn::user("Yes, go ahead."),
        ]
    }

    #[test]
    fn test_transcript_summary() {
        let summary = TranscriptSummarizer::default().summarize_turns(&turns());
        assert_eq!(summary, "Agent: Is this a good time to talk?\nCaller: Yes, go ahead.");
    }

    #[test]
    fn test_truncate_at_word() {
        assert_eq!(truncate("one two three", 9), "one two…");
        assert_eq!(truncate("short", 9), "short");
    }

    #[tokio::test]
    async fn test_backend_summary() {
        let summarizer = BackendSummarizer::new(
            Arc::new(FixedReply(Some(" Caller is free to talk. "))),
            Duration::from_secs(1),
        );
        assert_eq!(summarizer.summarize(&turns()).await.unwrap(), "Caller is free to talk.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeout_falls_back() {
        let summarizer = BackendSummarizer::new(Arc::new(FixedReply(None)), Duration::from_secs(2));
        let summary = summarizer.summarize(&turns()).await.unwrap();
        assert!(summary.starts_with("Agent:"));
    }
}
