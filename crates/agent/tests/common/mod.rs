//! Shared fakes for session integration tests
//!
//! Audio is simulated at one frame per word, 100ms per frame, so a ten word
//! utterance takes a second of (paused) test time to play.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dialogue_agent::{Collaborators, DialogueSession, SessionEvent, SessionHandle, StageFlow};
use dialogue_config::{FlowDefinition, Settings};
use dialogue_core::{
    AudioSink, AudioStream, BackendError, CallerInfo, FieldValue, PlaybackFrame, ReplyBackend,
    ReplyChunk, ReplyRequest, ReplyStream, ReportSink, SessionReport, SpeechSynthesizer,
    SynthesizedAudio, TranscriptResult, TurnRole, VadBoundary,
};
use dialogue_llm::TranscriptSummarizer;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

/// One step of a streamed reply
#[derive(Debug, Clone)]
pub enum Step {
    Chunk(ReplyChunk),
    /// Backend goes quiet for a while
    Wait(Duration),
}

type Script = dyn Fn(&ReplyRequest) -> Result<Vec<Step>, BackendError> + Send + Sync;

/// Reply backend driven by a closure; remembers every request
pub struct ScriptedReply {
    script: Box<Script>,
    requests: Mutex<Vec<ReplyRequest>>,
}

impl ScriptedReply {
    pub fn new(
        script: impl Fn(&ReplyRequest) -> Result<Vec<ReplyChunk>, BackendError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::streaming(move |request| {
            Ok(script(request)?.into_iter().map(Step::Chunk).collect())
        })
    }

    /// Backend whose replies may pause between chunks
    pub fn streaming(
        script: impl Fn(&ReplyRequest) -> Result<Vec<Step>, BackendError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ReplyRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self, filter: impl Fn(&ReplyRequest) -> bool) -> usize {
        self.requests.lock().iter().filter(|r| filter(r)).count()
    }
}

#[async_trait]
impl ReplyBackend for ScriptedReply {
    async fn generate(&self, request: ReplyRequest) -> Result<ReplyStream, BackendError> {
        self.requests.lock().push(request.clone());
        let steps = (self.script)(&request)?;
        let chunks = stream::iter(steps).filter_map(|step| async move {
            match step {
                Step::Chunk(chunk) => Some(Ok(chunk)),
                Step::Wait(pause) => {
                    sleep(pause).await;
                    None
                }
            }
        });
        Ok(Box::pin(chunks))
    }
}

/// One audio block per word
pub struct WordSynth;

#[async_trait]
impl SpeechSynthesizer for WordSynth {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, BackendError> {
        let mut end = 0;
        let blocks: Vec<_> = text
            .split_inclusive(' ')
            .map(|word| {
                end += word.len();
                Ok(SynthesizedAudio {
                    samples: Arc::from(vec![0.0f32; 160]),
                    text_end: end,
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(blocks)))
    }
}

/// Plays each frame in real (paused) time and remembers its generation
#[derive(Default)]
pub struct PacedSink {
    frames: Mutex<Vec<u64>>,
}

impl PacedSink {
    pub fn frames_for(&self, generation: u64) -> usize {
        self.frames.lock().iter().filter(|g| **g == generation).count()
    }

    pub fn total(&self) -> usize {
        self.frames.lock().len()
    }
}

#[async_trait]
impl AudioSink for PacedSink {
    async fn play(&self, frame: PlaybackFrame) -> Result<(), BackendError> {
        sleep(Duration::from_millis(100)).await;
        self.frames.lock().push(frame.generation);
        Ok(())
    }

    fn clear(&self) {}
}

#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<SessionReport>>,
}

impl CollectingSink {
    pub fn reports(&self) -> Vec<SessionReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl ReportSink for CollectingSink {
    async fn deliver(&self, report: &SessionReport) -> Result<(), BackendError> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

pub const GREETING: &str =
    "Hello there, this is the care team calling about your recent visit. Is now a good time?";

const TEST_FLOW: &str = r#"
name: test_intake
preamble: Test preamble.
entry: start
terminal: closing
default_max_turns: 3
stages:
  - id: opening
    instructions: OPENING stage.
    fields:
      - name: proceed
        description: Whether the caller can talk now
    on_enter:
      type: say
      text: Hello there, this is the care team calling about your recent visit. Is now a good time?
  - id: details
    instructions: DETAILS stage.
    fields:
      - name: city
        description: Where the caller lives
        required: false
    on_enter:
      type: generate
      instruction: Ask where they live.
  - id: callback
    instructions: CALLBACK stage.
    fields:
      - name: callback_time
        description: When to call back
  - id: closing
    instructions: CLOSING stage.
    on_enter:
      type: generate
      instruction: Say goodbye.
groups:
  - id: start
    stages: [opening]
    summarize: true
    exit:
      type: branch
      stage: opening
      field: proceed
      equals: true
      then: main
      otherwise: later
  - id: main
    stages: [details, closing]
    exit:
      type: end
  - id: later
    stages: [callback, closing]
    exit:
      type: end
"#;

pub fn test_flow() -> Arc<StageFlow> {
    let definition = FlowDefinition::from_yaml_str(TEST_FLOW).unwrap();
    Arc::new(StageFlow::build(definition).unwrap())
}

pub fn default_flow() -> Arc<StageFlow> {
    Arc::new(StageFlow::build(FlowDefinition::default()).unwrap())
}

pub fn text(content: &str) -> ReplyChunk {
    ReplyChunk::Text(content.to_string())
}

pub fn record(field: &str, value: FieldValue) -> ReplyChunk {
    ReplyChunk::Record {
        field: field.to_string(),
        value,
    }
}

pub fn last_user(request: &ReplyRequest) -> String {
    request
        .history
        .iter()
        .rev()
        .find(|t| t.role == TurnRole::User)
        .map(|t| t.content.clone())
        .unwrap_or_default()
}

/// Replies for [`test_flow`]
pub fn test_script(request: &ReplyRequest) -> Result<Vec<ReplyChunk>, BackendError> {
    let user = last_user(request);
    let instructions = request.instructions.as_str();

    if instructions.contains("Say goodbye.") {
        return Ok(vec![text("Thanks for your time. Goodbye."), ReplyChunk::StageDone]);
    }
    if instructions.contains("Ask where they live.") {
        return Ok(vec![text("Where do you live?")]);
    }
    if instructions.contains("OPENING") {
        let yes = user.to_lowercase().starts_with("yes");
        let reply = if yes { "Great, let's begin." } else { "No problem." };
        return Ok(vec![record("proceed", FieldValue::Bool(yes)), text(reply)]);
    }
    if instructions.contains("DETAILS") {
        return Ok(vec![
            record("city", FieldValue::Text(user)),
            text("Thank you for sharing that."),
        ]);
    }
    if instructions.contains("CALLBACK") {
        return Ok(vec![
            record("callback_time", FieldValue::Text(user)),
            text("I'll call you then."),
        ]);
    }
    Ok(vec![text("Okay.")])
}

pub fn is_opening_reply(request: &ReplyRequest) -> bool {
    request.instructions.contains("OPENING")
}

pub struct Harness {
    pub handle: SessionHandle,
    pub events: broadcast::Receiver<SessionEvent>,
    pub reply: Arc<ScriptedReply>,
    pub sink: Arc<PacedSink>,
    pub reports: Arc<CollectingSink>,
}

pub fn start_session(flow: Arc<StageFlow>, reply: Arc<ScriptedReply>, caller: CallerInfo) -> Harness {
    start_session_with(flow, reply, caller, Settings::default())
}

pub fn start_session_with(
    flow: Arc<StageFlow>,
    reply: Arc<ScriptedReply>,
    caller: CallerInfo,
    settings: Settings,
) -> Harness {
    let sink = Arc::new(PacedSink::default());
    let reports = Arc::new(CollectingSink::default());
    let collaborators = Collaborators::new(reply.clone(), Arc::new(WordSynth), sink.clone())
        .with_summarizer(Arc::new(TranscriptSummarizer::default()))
        .with_report_sink(reports.clone());

    let session = DialogueSession::new(caller, flow, settings, collaborators)
        .with_session_id("test-session");
    let events = session.subscribe();
    let handle = session.spawn();

    Harness {
        handle,
        events,
        reply,
        sink,
        reports,
    }
}

impl Harness {
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            match timeout(Duration::from_secs(120), self.events.recv()).await {
                Ok(Ok(event)) => return event,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => panic!("session events closed"),
                Err(_) => panic!("timed out waiting for a session event"),
            }
        }
    }

    pub async fn wait_for(&mut self, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
        }
    }

    /// Collect events until one matches, inclusive
    pub async fn collect_until(&mut self, matches: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = matches(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Text of the next completed agent turn
    pub async fn agent_said(&mut self) -> String {
        match self
            .wait_for(|e| matches!(e, SessionEvent::AgentTurn { .. }))
            .await
        {
            SessionEvent::AgentTurn { text, .. } => text,
            _ => unreachable!(),
        }
    }

    pub async fn agent_starts_speaking(&mut self) -> u64 {
        match self
            .wait_for(|e| {
                matches!(
                    e,
                    SessionEvent::Turn(dialogue_core::TurnEvent::AgentSpeaking { .. })
                )
            })
            .await
        {
            SessionEvent::Turn(dialogue_core::TurnEvent::AgentSpeaking { generation }) => generation,
            _ => unreachable!(),
        }
    }

    /// A user turn whose final text arrives right after speech ends
    pub async fn say(&self, words: &str) {
        self.handle.voice(VadBoundary::SpeechStart).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        self.handle
            .transcript(TranscriptResult::partial_text(words))
            .await
            .unwrap();
        self.handle.voice(VadBoundary::SpeechEnd).await.unwrap();
        self.handle
            .transcript(TranscriptResult::final_text(words))
            .await
            .unwrap();
    }

    /// A user turn whose final text lags long enough for a tentative end
    pub async fn say_with_lag(&self, partial: &str, final_text: &str) {
        self.handle.voice(VadBoundary::SpeechStart).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        self.handle
            .transcript(TranscriptResult::partial_text(partial))
            .await
            .unwrap();
        self.handle.voice(VadBoundary::SpeechEnd).await.unwrap();
        sleep(Duration::from_millis(400)).await;
        self.handle
            .transcript(TranscriptResult::final_text(final_text))
            .await
            .unwrap();
    }
}

pub fn caller() -> CallerInfo {
    CallerInfo::new("+15550100")
}
