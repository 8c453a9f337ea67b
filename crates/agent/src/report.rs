//! End-of-call report assembly and delivery

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dialogue_core::{
    CallerInfo, Degradation, EndReason, ReportSink, SessionHooks, SessionReport, TranscriptEntry,
    Turn,
};
use tokio::time::timeout;

use crate::stage::StageResult;
use crate::AgentError;

pub struct SessionReporter {
    sink: Option<Arc<dyn ReportSink>>,
    hooks: Arc<dyn SessionHooks>,
    timeout: Duration,
}

impl SessionReporter {
    pub fn new(
        sink: Option<Arc<dyn ReportSink>>,
        hooks: Arc<dyn SessionHooks>,
        timeout: Duration,
    ) -> Self {
        Self {
            sink,
            hooks,
            timeout,
        }
    }

    pub fn hooks(&self) -> &Arc<dyn SessionHooks> {
        &self.hooks
    }

    /// Assemble the report. Every completed stage appears, even with no
    /// recorded fields.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        session_id: &str,
        caller: &CallerInfo,
        started_at: DateTime<Utc>,
        end_reason: EndReason,
        degradations: Vec<Degradation>,
        transcript: &[Turn],
        stages: &[StageResult],
    ) -> SessionReport {
        SessionReport {
            session_id: session_id.to_string(),
            caller: caller.clone(),
            started_at,
            ended_at: Utc::now(),
            end_reason,
            degraded: !degradations.is_empty(),
            degradations,
            transcript: transcript.iter().map(TranscriptEntry::from).collect(),
            stage_results: stages
                .iter()
                .map(|r| (r.stage.clone(), r.fields.clone()))
                .collect(),
        }
    }

    /// Run the end hook, then hand the report to the sink
    pub async fn emit(&self, report: &SessionReport) -> Result<(), AgentError> {
        self.hooks.on_end(report).await;

        let Some(sink) = &self.sink else {
            tracing::debug!(session_id = %report.session_id, "No report sink configured");
            return Ok(());
        };

        match timeout(self.timeout, sink.deliver(report)).await {
            Ok(Ok(())) => {
                tracing::info!(
                    session_id = %report.session_id,
                    stages = report.stage_results.len(),
                    degraded = report.degraded,
                    "Session report delivered"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(AgentError::Backend(e)),
            Err(_) => Err(AgentError::ReportTimeout(self.timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::CompletionReason;
    use async_trait::async_trait;
    use dialogue_core::{BackendError, FieldValue, NoopHooks};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Collecting {
        reports: Mutex<Vec<SessionReport>>,
    }

    #[async_trait]
    impl ReportSink for Collecting {
        async fn deliver(&self, report: &SessionReport) -> Result<(), BackendError> {
            self.reports.lock().push(report.clone());
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl ReportSink for Stuck {
        async fn deliver(&self, _report: &SessionReport) -> Result<(), BackendError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn results() -> Vec<StageResult> {
        let mut fields = BTreeMap::new();
        fields.insert("proceed".to_string(), FieldValue::Bool(true));
        vec![
            StageResult {
                stage: "opening".into(),
                fields,
                reason: CompletionReason::FieldsCaptured,
                degraded: false,
            },
            StageResult {
                stage: "closing".into(),
                fields: BTreeMap::new(),
                reason: CompletionReason::Signalled,
                degraded: false,
            },
        ]
    }

    #[tokio::test]
    async fn test_build_and_deliver() {
        let sink = Arc::new(Collecting::default());
        let reporter = SessionReporter::new(
            Some(sink.clone() as Arc<dyn ReportSink>),
            Arc::new(NoopHooks),
            Duration::from_secs(1),
        );
        let report = reporter.build(
            "s-1",
            &CallerInfo::new("+15550100"),
            Utc::now(),
            EndReason::FlowCompleted,
            Vec::new(),
            &[Turn::assistant("Hello"), Turn::user("Hi")],
            &results(),
        );
        assert!(!report.degraded);
        assert_eq!(report.transcript[1].speaker, "user");
        assert!(report.stage_results["closing"].is_empty());

        reporter.emit(&report).await.unwrap();
        assert_eq!(sink.reports.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_timeout() {
        let reporter = SessionReporter::new(
            Some(Arc::new(Stuck) as Arc<dyn ReportSink>),
            Arc::new(NoopHooks),
            Duration::from_secs(3),
        );
        let report = reporter.build(
            "s-2",
            &CallerInfo::default(),
            Utc::now(),
            EndReason::CallerHangup,
            vec![Degradation::RecognizerForceCommit { text: "hm".into() }],
            &[],
            &[],
        );
        assert!(report.degraded);
        assert!(matches!(
            reporter.emit(&report).await,
            Err(AgentError::ReportTimeout(3000))
        ));
    }
}
