//! End-of-call report payload and the hooks that receive it

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::{CallerInfo, Turn};
use crate::error::BackendError;
use crate::outcome::FieldValue;

/// Why the session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EndReason {
    FlowCompleted,
    CallerHangup,
    SilenceTimeout,
    TransportLost { reason: String },
    Internal { reason: String },
}

impl EndReason {
    /// Transport loss is the only outcome treated as a failed session
    pub fn is_failure(&self) -> bool {
        matches!(self, EndReason::TransportLost { .. })
    }
}

/// A recovered failure worth flagging in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Degradation {
    /// Recognizer never finalized; best partial text was used
    #[serde(rename_all = "camelCase")]
    RecognizerForceCommit { text: String },
    /// Stage closed without all required outcomes
    #[serde(rename_all = "camelCase")]
    StageForceCompleted { stage: String, reason: String },
    /// Reply backend failed and the fallback utterance was played
    #[serde(rename_all = "camelCase")]
    BackendFallback { stage: String, error: String },
    /// Reply failed after some audio had already played
    #[serde(rename_all = "camelCase")]
    PartialReply { stage: String, error: String },
}

/// One line of the final transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub speaker: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Turn> for TranscriptEntry {
    fn from(turn: &Turn) -> Self {
        Self {
            speaker: turn.role.as_str().to_string(),
            text: turn.content.clone(),
            timestamp: turn.timestamp,
        }
    }
}

/// Final report handed to the delivery collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub caller: CallerInfo,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: EndReason,
    pub degraded: bool,
    pub degradations: Vec<Degradation>,
    pub transcript: Vec<TranscriptEntry>,
    /// stage id → field name → value
    pub stage_results: BTreeMap<String, BTreeMap<String, FieldValue>>,
}

impl SessionReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Delivers the final report (webhook, queue, database ...)
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, report: &SessionReport) -> Result<(), BackendError>;
}

/// Session lifecycle callbacks
#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn on_start(&self, _session_id: &str, _caller: &CallerInfo) {}

    async fn on_end(&self, _report: &SessionReport) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> SessionReport {
        let mut fields = BTreeMap::new();
        fields.insert("proceed".to_string(), FieldValue::Bool(false));
        let mut stage_results = BTreeMap::new();
        stage_results.insert("opening".to_string(), fields);
        stage_results.insert("closing".to_string(), BTreeMap::new());

        SessionReport {
            session_id: "s-1".into(),
            caller: CallerInfo::new("+15550100"),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            end_reason: EndReason::TransportLost {
                reason: "socket closed".into(),
            },
            degraded: true,
            degradations: vec![Degradation::RecognizerForceCommit {
                text: "uh".into(),
            }],
            transcript: vec![TranscriptEntry::from(&Turn::user("hello"))],
            stage_results,
        }
    }

    #[test]
    fn test_report_payload_shape() {
        let json = serde_json::to_value(sample_report()).unwrap();

        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["endReason"]["type"], "transportLost");
        assert_eq!(json["degradations"][0]["kind"], "recognizerForceCommit");
        assert_eq!(json["transcript"][0]["speaker"], "user");
        assert_eq!(json["stageResults"]["opening"]["proceed"], false);
        assert!(json["stageResults"]["closing"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_only_transport_loss_is_failure() {
        assert!(sample_report().end_reason.is_failure());
        assert!(!EndReason::SilenceTimeout.is_failure());
        assert!(!EndReason::CallerHangup.is_failure());
    }
}
