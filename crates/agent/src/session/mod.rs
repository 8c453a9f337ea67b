//! Per-call dialogue session
//!
//! A [`DialogueSession`] owns everything one call needs and runs it on a
//! single task. Audio-side inputs (voice activity, recognizer output,
//! hangup) go in through a bounded channel on the [`SessionHandle`];
//! progress comes out as a broadcast of [`SessionEvent`]s and, at the end,
//! a [`SessionReport`].

mod event_loop;

use std::sync::Arc;

use dialogue_config::Settings;
use dialogue_core::{
    AudioSink, CallerInfo, EndReason, KnowledgeRetriever, NoopHooks, ReplyBackend, ReportSink,
    SessionHooks, SessionReport, SpeechSynthesizer, Summarizer, TranscriptResult, TurnEvent,
    VadBoundary,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::stage::{StageFlow, StageResult};
use crate::AgentError;

/// External services a session talks to
#[derive(Clone)]
pub struct Collaborators {
    pub reply: Arc<dyn ReplyBackend>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sink: Arc<dyn AudioSink>,
    pub retriever: Option<Arc<dyn KnowledgeRetriever>>,
    /// Defaults to asking the reply backend for a summary
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub report_sink: Option<Arc<dyn ReportSink>>,
    pub hooks: Arc<dyn SessionHooks>,
}

impl Collaborators {
    pub fn new(
        reply: Arc<dyn ReplyBackend>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            reply,
            synthesizer,
            sink,
            retriever: None,
            summarizer: None,
            report_sink: None,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report_sink = Some(sink);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Input from the audio side of the call
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    VoiceActivity(VadBoundary),
    Transcript(TranscriptResult),
    Hangup,
    TransportLost(String),
}

/// Input stamped with its arrival time
#[derive(Debug)]
pub(crate) struct TimedInput {
    pub input: SessionInput,
    pub at: Instant,
}

/// Response latency of one reply, measured when its audio starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnMetrics {
    pub generation: u64,
    /// Voice end to turn commit; zero when final text beat the voice end
    pub end_of_utterance_ms: u64,
    /// Commit to first reply text; zero when a speculative reply was ahead
    pub first_token_ms: Option<u64>,
    /// Commit to first audio frame
    pub first_audio_ms: u64,
    /// The reply was started speculatively before the commit
    pub speculative: bool,
}

/// Observable session progress
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started { session_id: String },
    /// Turn-taking signal
    Turn(TurnEvent),
    UserTurn { text: String, degraded: bool },
    /// Short acknowledgement recorded while the agent kept talking
    Backchannel { text: String },
    AgentTurn { text: String, interrupted: bool },
    StageEntered { stage: String, group: String },
    StageCompleted(StageResult),
    ContextCollapsed { summary: String },
    SpeculationConfirmed { generation: u64 },
    SpeculationDiscarded { generation: u64 },
    Interrupted { generation: u64, heard: String },
    Resumed { generation: u64 },
    TurnMetrics(TurnMetrics),
    GenerationFailed { generation: u64, error: String },
    Fallback { stage: String },
    Ended { reason: EndReason },
}

/// A configured session, not yet running
pub struct DialogueSession {
    id: String,
    caller: CallerInfo,
    flow: Arc<StageFlow>,
    settings: Settings,
    collaborators: Collaborators,
    events: broadcast::Sender<SessionEvent>,
}

impl DialogueSession {
    pub fn new(
        caller: CallerInfo,
        flow: Arc<StageFlow>,
        settings: Settings,
        collaborators: Collaborators,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.session.event_buffer);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            caller,
            flow,
            settings,
            collaborators,
            events,
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe before spawning to see the opening events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start the session loop
    pub fn spawn(self) -> SessionHandle {
        let (inputs, input_rx) = mpsc::channel(self.settings.session.input_buffer);
        let session_id = self.id.clone();
        let events = self.events.clone();
        let task = tokio::spawn(event_loop::run(self, input_rx));

        SessionHandle {
            session_id,
            inputs,
            events,
            task,
        }
    }
}

/// Handle to a running session
pub struct SessionHandle {
    session_id: String,
    inputs: mpsc::Sender<TimedInput>,
    events: broadcast::Sender<SessionEvent>,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(&self, input: SessionInput) -> Result<(), AgentError> {
        let input = TimedInput {
            input,
            at: Instant::now(),
        };
        self.inputs
            .send(input)
            .await
            .map_err(|_| AgentError::SessionClosed)
    }

    pub async fn voice(&self, boundary: VadBoundary) -> Result<(), AgentError> {
        self.send(SessionInput::VoiceActivity(boundary)).await
    }

    pub async fn transcript(&self, result: TranscriptResult) -> Result<(), AgentError> {
        self.send(SessionInput::Transcript(result)).await
    }

    pub async fn hangup(&self) -> Result<(), AgentError> {
        self.send(SessionInput::Hangup).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end on its own
    pub async fn join(self) -> Result<SessionReport, AgentError> {
        let SessionHandle { inputs, task, .. } = self;
        let report = task.await.map_err(|e| AgentError::Join(e.to_string()));
        drop(inputs);
        report
    }

    /// Drop the input side, as a lost transport would, and wait for the report
    pub async fn disconnect(self) -> Result<SessionReport, AgentError> {
        let SessionHandle { inputs, task, .. } = self;
        drop(inputs);
        task.await.map_err(|e| AgentError::Join(e.to_string()))
    }
}
