//! Conversation turn types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    /// Synthetic turn produced by collapsing earlier history
    Summary,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::Summary => "summary",
        }
    }
}

/// One contiguous span of speech (or a synthetic summary)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Summary, content)
    }
}

/// Caller metadata handed over when a session starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    /// Phone number or participant identity
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Campaign or channel the call originated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl CallerInfo {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: None,
            source: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_info_serializes_camel_case() {
        let caller = CallerInfo::new("+911234567890").with_display_name("Asha");
        let json = serde_json::to_value(&caller).unwrap();

        assert_eq!(json["identifier"], "+911234567890");
        assert_eq!(json["displayName"], "Asha");
        assert!(json.get("source").is_none());
    }

    #[test]
    fn test_turn_constructors() {
        assert_eq!(Turn::user("hi").role, TurnRole::User);
        assert_eq!(Turn::summary("s").role.as_str(), "summary");
    }
}
