//! Recognizer output

use serde::{Deserialize, Serialize};

/// One recognizer hypothesis for the current user utterance.
///
/// Partial results replace each other; a final result closes the utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptResult {
    pub fn partial_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count_ignores_extra_spaces() {
        let result = TranscriptResult::final_text("  wait   hold on ");
        assert!(result.is_final);
        assert_eq!(result.word_count(), 3);
    }

    #[test]
    fn test_whitespace_only_is_empty() {
        let result = TranscriptResult::partial_text("   ");
        assert!(!result.is_final);
        assert!(result.is_empty());
        assert_eq!(result.word_count(), 0);
    }

    #[test]
    fn test_deserializes_recognizer_payload() {
        let result: TranscriptResult =
            serde_json::from_str(r#"{"text":"yes please","is_final":true}"#).unwrap();
        assert_eq!(result, TranscriptResult::final_text("yes please"));
    }
}
