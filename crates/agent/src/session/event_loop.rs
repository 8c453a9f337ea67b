//! The session loop
//!
//! One task owns all conversational state. It selects over the input
//! channel, events from utterance tasks and the silence monitor, and a poll
//! tick that advances the turn-taking timers. Nothing else mutates the
//! context, the stage engine or the active utterance, so every transition
//! below runs to completion before the next message is looked at.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dialogue_config::{EntryAction, Settings};
use dialogue_core::{
    CallerInfo, Degradation, EndReason, ReplyRequest, SessionReport, Summarizer, TurnEvent,
    TurnRole, VadBoundary,
};
use dialogue_llm::{
    BackendSummarizer, GenerationEvent, GenerationHandle, GenerationOutput, LlmError,
    TranscriptSummarizer, UtteranceGenerator,
};
use dialogue_pipeline::{
    Activity, CommitAction, InterruptionController, InterruptionDecision, SilenceMonitor,
    TurnSignalAggregator,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

use super::{Collaborators, DialogueSession, SessionEvent, SessionInput, TimedInput, TurnMetrics};
use crate::context::ContextManager;
use crate::report::SessionReporter;
use crate::stage::{StageAdvance, StageCompletion, StageEntry, StageFlowEngine};

/// Messages produced by tasks the loop spawned
#[derive(Debug)]
pub(crate) enum LoopMessage {
    Generation(GenerationEvent),
    Turn(TurnEvent),
}

impl From<GenerationEvent> for LoopMessage {
    fn from(event: GenerationEvent) -> Self {
        LoopMessage::Generation(event)
    }
}

impl From<TurnEvent> for LoopMessage {
    fn from(event: TurnEvent) -> Self {
        LoopMessage::Turn(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UtteranceKind {
    /// Answer to a committed user turn
    Reply,
    /// Stage entry action
    Entry,
    /// Silence re-engagement
    Prompt,
    /// Apology after the backend gave up
    Fallback,
}

/// When the user turn a reply answers ended
#[derive(Debug, Clone, Copy)]
struct TurnTiming {
    speech_ended_at: Option<Instant>,
    committed_at: Instant,
}

impl TurnTiming {
    fn metrics(&self, handle: &GenerationHandle, now: Instant) -> TurnMetrics {
        let timing = handle.timing();
        let since_commit =
            |at: Instant| at.saturating_duration_since(self.committed_at).as_millis() as u64;
        TurnMetrics {
            generation: handle.generation(),
            end_of_utterance_ms: self.speech_ended_at.map_or(0, |ended| {
                self.committed_at.saturating_duration_since(ended).as_millis() as u64
            }),
            first_token_ms: timing.first_token_at.map(since_commit),
            first_audio_ms: since_commit(timing.first_audio_at.unwrap_or(now)),
            speculative: timing.launched_at < self.committed_at,
        }
    }
}

struct Utterance {
    handle: GenerationHandle,
    kind: UtteranceKind,
    /// Kept so a failed reply can be retried on the same context
    request: Option<ReplyRequest>,
    user_text: String,
    attempts: u32,
    /// Set for replies until their latency is reported
    turn: Option<TurnTiming>,
}

impl Utterance {
    fn scripted(handle: GenerationHandle, kind: UtteranceKind) -> Self {
        Self {
            handle,
            kind,
            request: None,
            user_text: String::new(),
            attempts: 1,
            turn: None,
        }
    }

    fn generated(
        handle: GenerationHandle,
        kind: UtteranceKind,
        request: ReplyRequest,
        user_text: &str,
    ) -> Self {
        Self {
            handle,
            kind,
            request: Some(request),
            user_text: user_text.to_string(),
            attempts: 1,
            turn: None,
        }
    }

    /// Prepared but still held back from playback
    fn is_speculative(&self) -> bool {
        !self.handle.is_released()
    }
}

/// Utterance paused by an interruption. Its task keeps generating until
/// the interruption is confirmed, so a resume can play the whole reply.
struct Halted {
    utterance: Utterance,
    played: usize,
    heard: String,
    /// The task ended while paused and cannot be resumed in place
    task_ended: bool,
}

enum Queued {
    Say { text: String, kind: UtteranceKind },
    Generate { instruction: String },
}

enum Lifecycle {
    Active,
    /// Flow finished; close once the last utterance has played
    Closing,
    Closed(EndReason),
}

pub(crate) async fn run(
    session: DialogueSession,
    mut inputs: mpsc::Receiver<TimedInput>,
) -> SessionReport {
    let (loop_tx, mut loop_rx) = mpsc::unbounded_channel::<LoopMessage>();
    let now = Instant::now();
    let (activity_tx, activity_rx) = watch::channel(Activity::new(now));
    let silence = SilenceMonitor::new(session.settings.silence.clone())
        .spawn(activity_rx, loop_tx.clone());

    let mut state = SessionLoop::new(session, loop_tx, activity_tx, now);
    state.start().await;
    state.sync_activity(Instant::now());

    let mut ticker = interval(state.settings.session.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while state.is_running() {
        tokio::select! {
            biased;
            input = inputs.recv() => match input {
                Some(TimedInput { input, at }) => state.handle_input(input, at).await,
                None => state.close(EndReason::TransportLost {
                    reason: "input channel closed".to_string(),
                }),
            },
            Some(message) = loop_rx.recv() => state.handle_message(message).await,
            _ = ticker.tick() => state.on_tick(Instant::now()).await,
        }
        state.sync_activity(Instant::now());
    }

    silence.abort();
    state.finish().await
}

struct SessionLoop {
    id: String,
    caller: CallerInfo,
    settings: Settings,
    started_at: DateTime<Utc>,
    engine: StageFlowEngine,
    context: ContextManager,
    aggregator: TurnSignalAggregator,
    interruption: InterruptionController,
    generator: UtteranceGenerator<LoopMessage>,
    summarizer: Arc<dyn Summarizer>,
    reporter: SessionReporter,
    events: broadcast::Sender<SessionEvent>,
    activity: watch::Sender<Activity>,
    last_user_speech: Instant,
    agent_was_busy: bool,
    active: Option<Utterance>,
    halted: Option<Halted>,
    queue: VecDeque<Queued>,
    degradations: Vec<Degradation>,
    lifecycle: Lifecycle,
}

impl SessionLoop {
    fn new(
        session: DialogueSession,
        loop_tx: mpsc::UnboundedSender<LoopMessage>,
        activity: watch::Sender<Activity>,
        now: Instant,
    ) -> Self {
        let DialogueSession {
            id,
            caller,
            flow,
            settings,
            collaborators,
            events,
        } = session;
        let Collaborators {
            reply,
            synthesizer,
            sink,
            retriever,
            summarizer,
            report_sink,
            hooks,
        } = collaborators;

        let summarizer = summarizer.unwrap_or_else(|| {
            Arc::new(BackendSummarizer::new(
                reply.clone(),
                settings.session.summary_timeout(),
            )) as Arc<dyn Summarizer>
        });
        let generator = UtteranceGenerator::new(
            reply,
            synthesizer,
            sink,
            settings.generation.clone(),
            loop_tx,
        )
        .with_retriever(retriever);

        Self {
            context: ContextManager::new(flow.definition().preamble.clone()),
            engine: StageFlowEngine::new(flow),
            aggregator: TurnSignalAggregator::new(settings.turn.clone()),
            interruption: InterruptionController::new(settings.interruption.clone()),
            reporter: SessionReporter::new(report_sink, hooks, settings.session.report_timeout()),
            id,
            caller,
            settings,
            started_at: Utc::now(),
            generator,
            summarizer,
            events,
            activity,
            last_user_speech: now,
            agent_was_busy: false,
            active: None,
            halted: None,
            queue: VecDeque::new(),
            degradations: Vec::new(),
            lifecycle: Lifecycle::Active,
        }
    }

    async fn start(&mut self) {
        tracing::info!(
            session_id = %self.id,
            caller = %self.caller.identifier,
            flow = %self.engine.flow().name(),
            "Session started"
        );
        self.reporter.hooks().on_start(&self.id, &self.caller).await;
        self.publish(SessionEvent::Started {
            session_id: self.id.clone(),
        });

        match self.engine.start() {
            Ok(entry) => self.enter_stage(entry).await,
            Err(e) => self.fail(e),
        }
        self.drain_queue();
    }

    fn is_running(&self) -> bool {
        !matches!(self.lifecycle, Lifecycle::Closed(_))
    }

    fn accepting_turns(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Active)
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn close(&mut self, reason: EndReason) {
        if !self.is_running() {
            return;
        }
        tracing::info!(session_id = %self.id, reason = ?reason, "Closing session");
        self.lifecycle = Lifecycle::Closed(reason);
    }

    fn fail(&mut self, error: impl Display) {
        tracing::error!(session_id = %self.id, error = %error, "Session failed");
        self.close(EndReason::Internal {
            reason: error.to_string(),
        });
    }

    async fn handle_input(&mut self, input: SessionInput, at: Instant) {
        match input {
            SessionInput::VoiceActivity(boundary) => {
                self.last_user_speech = at;
                let decision = match boundary {
                    VadBoundary::SpeechStart => {
                        self.interruption.user_voice_started(at);
                        None
                    }
                    VadBoundary::SpeechEnd => self.interruption.user_voice_ended(at),
                };
                if let Some(decision) = decision {
                    self.apply_decision(decision).await;
                }
                let events = self.aggregator.on_vad(boundary, at);
                self.handle_turn_events(events, at).await;
            }
            SessionInput::Transcript(result) => {
                if !result.is_empty() {
                    self.last_user_speech = at;
                }
                if !result.is_final {
                    if let Some(decision) = self.interruption.user_words(result.word_count(), at) {
                        self.apply_decision(decision).await;
                    }
                }
                let events = self.aggregator.on_transcript(&result, at);
                self.handle_turn_events(events, at).await;
            }
            SessionInput::Hangup => {
                tracing::info!(session_id = %self.id, "Caller hung up");
                self.close(EndReason::CallerHangup);
            }
            SessionInput::TransportLost(reason) => {
                tracing::warn!(session_id = %self.id, reason = %reason, "Transport lost");
                self.close(EndReason::TransportLost { reason });
            }
        }
    }

    async fn handle_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Turn(event) => self.on_turn_event(event, Instant::now()).await,
            LoopMessage::Generation(event) => self.on_generation_event(event).await,
        }
    }

    async fn on_tick(&mut self, now: Instant) {
        let events = self.aggregator.poll(now);
        self.handle_turn_events(events, now).await;
        if let Some(decision) = self.interruption.poll(now) {
            self.apply_decision(decision).await;
        }
        self.drain_queue();
    }

    /// Publish what the silence monitor needs to know
    fn sync_activity(&mut self, now: Instant) {
        let agent_busy = self.active.as_ref().map_or(false, |u| !u.is_speculative());
        let agent_done = self.agent_was_busy && !agent_busy;
        self.agent_was_busy = agent_busy;

        let user_active = self.aggregator.is_active();
        let last_user_speech = self.last_user_speech;
        self.activity.send_modify(|activity| {
            activity.last_user_speech = last_user_speech;
            activity.user_active = user_active;
            activity.agent_speaking = agent_busy;
            if agent_done {
                activity.agent_done_at = Some(now);
            }
        });
    }

    async fn handle_turn_events(&mut self, events: Vec<TurnEvent>, at: Instant) {
        for event in events {
            self.on_turn_event(event, at).await;
        }
    }

    async fn on_turn_event(&mut self, event: TurnEvent, at: Instant) {
        tracing::trace!(session_id = %self.id, event = event.name(), "Turn event");
        self.publish(SessionEvent::Turn(event.clone()));

        match event {
            TurnEvent::SpeechStarted { resumed: true } => {
                self.discard_speculation("user kept talking");
            }
            TurnEvent::SpeechEndedTentative { text } => self.speculate(&text),
            TurnEvent::SpeechEndedCommitted { text, degraded } => {
                self.on_committed(text, degraded, at).await;
            }
            TurnEvent::SpeechAbandoned => {
                self.discard_speculation("utterance abandoned");
                if let Some(decision) = self.interruption.abandoned() {
                    self.apply_decision(decision).await;
                }
            }
            TurnEvent::SilenceTimeout { consecutive } => self.on_silence(consecutive).await,
            TurnEvent::SpeechStarted { resumed: false }
            | TurnEvent::AgentSpeaking { .. }
            | TurnEvent::AgentSpeechDone { .. } => {}
        }
    }

    fn speculate(&mut self, text: &str) {
        if !self.settings.generation.speculative
            || !self.accepting_turns()
            || self.active.is_some()
            || self.halted.is_some()
            || text.trim().is_empty()
        {
            return;
        }

        let request = self
            .context
            .snapshot_with_user(text)
            .into_request(self.engine.outcome_fields());
        let handle = self.generator.reply(request.clone(), text, false);
        tracing::debug!(generation = handle.generation(), "Speculative reply started");
        self.active = Some(Utterance::generated(handle, UtteranceKind::Reply, request, text));
    }

    fn discard_speculation(&mut self, reason: &str) {
        if !self.active.as_ref().map_or(false, Utterance::is_speculative) {
            return;
        }
        if let Some(utterance) = self.active.take() {
            let generation = utterance.handle.generation();
            utterance.handle.cancel();
            tracing::debug!(generation, reason, "Discarded speculative reply");
            self.publish(SessionEvent::SpeculationDiscarded { generation });
        }
    }

    async fn on_committed(&mut self, text: String, degraded: bool, at: Instant) {
        if degraded {
            tracing::warn!(text = %text, "Recognizer never finalized, using partial text");
            self.degradations.push(Degradation::RecognizerForceCommit { text: text.clone() });
        }

        let words = text.split_whitespace().count();
        match self.interruption.committed(words, at) {
            CommitAction::Backchannel => {
                tracing::debug!(text = %text, "Backchannel during agent speech");
                self.context.append_turn(TurnRole::User, &text);
                self.publish(SessionEvent::Backchannel { text });
                return;
            }
            CommitAction::Interrupt => self.halt(),
            CommitAction::Reply => {}
        }

        if let Some(halted) = self.halted.take() {
            let output = halted.utterance.handle.output();
            halted.utterance.handle.cancel();
            self.apply_outcomes(&output);
            let heard = halted.heard.trim();
            if !heard.is_empty() {
                self.context.append_turn(TurnRole::Assistant, heard);
                self.publish(SessionEvent::AgentTurn {
                    text: heard.to_string(),
                    interrupted: true,
                });
            }
        }

        self.context.append_turn(TurnRole::User, &text);
        self.publish(SessionEvent::UserTurn {
            text: text.clone(),
            degraded,
        });
        if !self.accepting_turns() {
            return;
        }
        self.engine.record_turn();

        let turn = TurnTiming {
            speech_ended_at: self.aggregator.speech_ended_at(),
            committed_at: at,
        };
        if let Some(mut utterance) = self.active.take() {
            let generation = utterance.handle.generation();
            if utterance.is_speculative() && utterance.handle.matches(&text) {
                utterance.handle.release();
                tracing::info!(generation, "Speculative reply confirmed");
                self.publish(SessionEvent::SpeculationConfirmed { generation });
                self.interruption.reply_started();
                utterance.turn = Some(turn);
                self.active = Some(utterance);
                return;
            }

            utterance.handle.cancel();
            if utterance.is_speculative() {
                tracing::debug!(generation, "Committed text differs from speculation");
                self.publish(SessionEvent::SpeculationDiscarded { generation });
            } else {
                tracing::debug!(generation, "Superseding utterance that had not started");
            }
        }

        self.start_reply(&text, turn);
    }

    fn start_reply(&mut self, user_text: &str, turn: TurnTiming) {
        let request = self
            .context
            .snapshot()
            .into_request(self.engine.outcome_fields());
        let handle = self.generator.reply(request.clone(), user_text, true);
        self.interruption.reply_started();
        let mut utterance =
            Utterance::generated(handle, UtteranceKind::Reply, request, user_text);
        utterance.turn = Some(turn);
        self.active = Some(utterance);
    }

    /// Report how long the caller waited for the active reply
    fn report_latency(&mut self, now: Instant) {
        let Some(utterance) = self.active.as_mut() else {
            return;
        };
        let Some(turn) = utterance.turn.take() else {
            return;
        };
        let metrics = turn.metrics(&utterance.handle, now);
        tracing::info!(
            session_id = %self.id,
            generation = metrics.generation,
            end_of_utterance_ms = metrics.end_of_utterance_ms,
            first_token_ms = ?metrics.first_token_ms,
            first_audio_ms = metrics.first_audio_ms,
            speculative = metrics.speculative,
            "Turn latency"
        );
        self.publish(SessionEvent::TurnMetrics(metrics));
    }

    async fn apply_decision(&mut self, decision: InterruptionDecision) {
        match decision {
            InterruptionDecision::Interrupt => self.halt(),
            InterruptionDecision::Resume => self.resume_halted().await,
        }
    }

    /// Pause the active utterance and remember where it was cut off
    fn halt(&mut self) {
        let Some(utterance) = self.active.take() else {
            return;
        };
        let played = utterance.handle.pause();
        self.generator.clear_playback();

        let generation = utterance.handle.generation();
        let text = utterance.handle.text();
        let heard = text.get(..played).unwrap_or_default().to_string();
        tracing::info!(generation, played, "Agent speech interrupted");

        self.publish(SessionEvent::Interrupted {
            generation,
            heard: heard.clone(),
        });
        self.publish(SessionEvent::Turn(TurnEvent::AgentSpeechDone {
            generation,
            interrupted: true,
        }));
        self.halted = Some(Halted {
            utterance,
            played,
            heard,
            task_ended: false,
        });
    }

    /// The interruption was noise: play what the caller did not hear
    async fn resume_halted(&mut self) {
        self.aggregator.reset();
        self.discard_speculation("resuming halted speech");

        let Some(halted) = self.halted.take() else {
            self.interruption.reset();
            return;
        };
        let Halted {
            utterance,
            played,
            task_ended,
            ..
        } = halted;

        if !task_ended {
            let generation = utterance.handle.generation();
            let from = utterance.handle.resume_from(played);
            tracing::info!(generation, offset = played, from, "Resuming halted speech");
            self.publish(SessionEvent::Resumed { generation });
            self.active = Some(utterance);
            return;
        }

        let output = utterance.handle.output();
        self.apply_outcomes(&output);
        let rest = output.text.get(played..).unwrap_or_default();
        if rest.trim().is_empty() {
            self.interruption.reset();
            self.utterance_finished(utterance.kind, &output.text).await;
            return;
        }

        let generation = self.context.next_generation();
        let handle = self.generator.resume(generation, &output.text, played);
        tracing::info!(generation, offset = played, "Replaying halted speech");
        self.publish(SessionEvent::Resumed { generation });
        self.active = Some(Utterance::scripted(handle, utterance.kind));
    }

    async fn on_generation_event(&mut self, event: GenerationEvent) {
        if let Some(halted) = self
            .halted
            .as_mut()
            .filter(|h| h.utterance.handle.generation() == event.generation())
        {
            if !matches!(event, GenerationEvent::PlaybackStarted { .. }) {
                tracing::debug!(generation = event.generation(), "Paused utterance task ended");
                halted.task_ended = true;
            }
            return;
        }

        let current = self.active.as_ref().map(|u| u.handle.generation());
        if current != Some(event.generation()) {
            tracing::trace!(
                generation = event.generation(),
                "Ignoring event from superseded generation"
            );
            return;
        }

        match event {
            GenerationEvent::PlaybackStarted { generation } => {
                let now = Instant::now();
                self.interruption.agent_started(now);
                self.publish(SessionEvent::Turn(TurnEvent::AgentSpeaking { generation }));
                self.report_latency(now);
            }
            GenerationEvent::Completed(output) => {
                let Some(utterance) = self.active.take() else {
                    return;
                };
                self.interruption.agent_finished();
                self.publish(SessionEvent::Turn(TurnEvent::AgentSpeechDone {
                    generation: output.generation,
                    interrupted: false,
                }));
                self.apply_outcomes(&output);
                self.utterance_finished(utterance.kind, &output.text).await;
            }
            GenerationEvent::Failed {
                generation,
                error,
                played,
            } => {
                let Some(utterance) = self.active.take() else {
                    return;
                };
                self.on_generation_failed(utterance, generation, error, played)
                    .await;
            }
        }
    }

    fn apply_outcomes(&mut self, output: &GenerationOutput) {
        for (field, value) in &output.outcomes {
            if let Err(e) = self.engine.record(field, value.clone()) {
                tracing::warn!(error = %e, "Ignoring outcome");
            }
        }
        if output.stage_done {
            self.engine.signal_done();
        }
    }

    async fn utterance_finished(&mut self, kind: UtteranceKind, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.context.append_turn(TurnRole::Assistant, text);
            self.publish(SessionEvent::AgentTurn {
                text: text.to_string(),
                interrupted: false,
            });
        }
        if kind == UtteranceKind::Reply {
            self.engine.reply_completed();
        }
        self.evaluate_stage().await;
        self.drain_queue();
    }

    async fn on_generation_failed(
        &mut self,
        utterance: Utterance,
        generation: u64,
        error: LlmError,
        played: String,
    ) {
        if utterance.handle.playback_started() {
            self.interruption.agent_finished();
            self.publish(SessionEvent::Turn(TurnEvent::AgentSpeechDone {
                generation,
                interrupted: false,
            }));
        }
        self.publish(SessionEvent::GenerationFailed {
            generation,
            error: error.to_string(),
        });

        if utterance.is_speculative() {
            self.publish(SessionEvent::SpeculationDiscarded { generation });
            return;
        }

        let stage = self.engine.current_stage_id().unwrap_or_default().to_string();
        let heard = played.trim();
        if !heard.is_empty() {
            tracing::warn!(generation, error = %error, "Reply failed mid-playback, keeping what was said");
            self.degradations.push(Degradation::PartialReply {
                stage,
                error: error.to_string(),
            });
            self.utterance_finished(utterance.kind, heard).await;
            return;
        }

        let max_retries = self.settings.generation.max_retries;
        match (utterance.kind, utterance.request) {
            (kind @ (UtteranceKind::Reply | UtteranceKind::Entry), Some(mut request))
                if utterance.attempts <= max_retries =>
            {
                request.generation = self.context.next_generation();
                tracing::info!(
                    generation = request.generation,
                    attempt = utterance.attempts + 1,
                    error = %error,
                    "Retrying reply with the same context"
                );
                let handle = self.generator.reply(request.clone(), &utterance.user_text, true);
                self.active = Some(Utterance {
                    handle,
                    kind,
                    request: Some(request),
                    user_text: utterance.user_text,
                    attempts: utterance.attempts + 1,
                    turn: utterance.turn,
                });
            }
            (UtteranceKind::Reply | UtteranceKind::Entry, _) => {
                self.play_fallback(stage, error).await;
            }
            (kind, _) => {
                tracing::warn!(generation, error = %error, "Scripted speech failed");
                self.utterance_finished(kind, "").await;
            }
        }
    }

    async fn play_fallback(&mut self, stage: String, error: LlmError) {
        tracing::warn!(stage = %stage, error = %error, "Reply backend gave up, playing fallback");
        self.degradations.push(Degradation::BackendFallback {
            stage: stage.clone(),
            error: error.to_string(),
        });
        self.publish(SessionEvent::Fallback { stage });

        let generation = self.context.next_generation();
        let text = self.settings.generation.fallback_utterance.clone();
        let handle = self.generator.say(generation, &text);
        self.active = Some(Utterance::scripted(handle, UtteranceKind::Fallback));

        if self.settings.generation.skip_stage_on_fallback {
            match self.engine.skip_current() {
                Ok(completion) => self.on_stage_completed(completion).await,
                Err(e) => tracing::warn!(error = %e, "Could not skip stage"),
            }
        }
    }

    async fn evaluate_stage(&mut self) {
        match self.engine.evaluate() {
            Ok(Some(completion)) => self.on_stage_completed(completion).await,
            Ok(None) => {}
            Err(e) => self.fail(e),
        }
    }

    async fn on_stage_completed(&mut self, completion: StageCompletion) {
        let StageCompletion { result, next } = completion;
        if result.degraded {
            self.degradations.push(Degradation::StageForceCompleted {
                stage: result.stage.clone(),
                reason: result.reason.as_str().to_string(),
            });
        }
        self.publish(SessionEvent::StageCompleted(result));

        match next {
            StageAdvance::Entered(entry) => self.enter_stage(entry).await,
            StageAdvance::Finished => {
                if self.settings.session.end_on_flow_complete {
                    tracing::info!(session_id = %self.id, "Flow complete, closing after final speech");
                    self.lifecycle = Lifecycle::Closing;
                }
            }
        }
    }

    async fn enter_stage(&mut self, entry: StageEntry) {
        if entry.summarize_previous {
            self.collapse_context().await;
        }
        self.context.set_instructions(&entry.instructions);
        self.publish(SessionEvent::StageEntered {
            stage: entry.stage.clone(),
            group: entry.group.clone(),
        });

        if let Some(action) = entry.on_enter {
            let queued = match action.personalize(self.caller.display_name.as_deref()) {
                EntryAction::Say { text } | EntryAction::Greet { default: text, .. } => {
                    Queued::Say {
                        text,
                        kind: UtteranceKind::Entry,
                    }
                }
                EntryAction::Generate { instruction } => Queued::Generate { instruction },
            };
            self.queue.push_back(queued);
        }
    }

    async fn collapse_context(&mut self) {
        let limit = self.settings.session.summary_timeout();
        let summarizer = self.summarizer.clone();

        let collapsed = timeout(limit, self.context.summarize_and_collapse(summarizer.as_ref())).await;
        let summary = match collapsed {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Summarizer failed, using transcript summary");
                self.collapse_with_transcript().await
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = limit.as_millis() as u64,
                    "Summarizer timed out, using transcript summary"
                );
                self.collapse_with_transcript().await
            }
        };

        if let Some(summary) = summary {
            tracing::info!(session_id = %self.id, "Conversation history collapsed");
            self.publish(SessionEvent::ContextCollapsed { summary });
        }
    }

    async fn collapse_with_transcript(&mut self) -> Option<String> {
        self.context
            .summarize_and_collapse(&TranscriptSummarizer::default())
            .await
            .ok()
            .flatten()
    }

    /// Start the next queued utterance if nobody is talking
    fn drain_queue(&mut self) {
        if !self.is_running()
            || self.active.is_some()
            || self.halted.is_some()
            || self.aggregator.is_active()
        {
            return;
        }

        match self.queue.pop_front() {
            Some(Queued::Say { text, kind }) => {
                let generation = self.context.next_generation();
                let handle = self.generator.say(generation, &text);
                tracing::debug!(generation, kind = ?kind, "Speaking scripted text");
                self.active = Some(Utterance::scripted(handle, kind));
            }
            Some(Queued::Generate { instruction }) => {
                let request = self
                    .context
                    .ephemeral_instructions(&instruction)
                    .into_request(self.engine.outcome_fields());
                let handle = self.generator.reply(request.clone(), "", true);
                tracing::debug!(generation = handle.generation(), "Generating entry utterance");
                self.active = Some(Utterance::generated(
                    handle,
                    UtteranceKind::Entry,
                    request,
                    "",
                ));
            }
            None => {
                if matches!(self.lifecycle, Lifecycle::Closing) {
                    self.close(EndReason::FlowCompleted);
                }
            }
        }
    }

    async fn on_silence(&mut self, consecutive: u32) {
        if !self.accepting_turns() {
            return;
        }
        if self.active.is_some() || self.halted.is_some() || self.aggregator.is_active() {
            tracing::debug!(consecutive, "Silence timeout while conversation is busy");
            return;
        }

        if consecutive <= self.settings.silence.max_reengagements {
            tracing::info!(consecutive, "Re-engaging silent caller");
            self.queue.push_front(Queued::Say {
                text: self.settings.silence.prompt.clone(),
                kind: UtteranceKind::Prompt,
            });
            self.drain_queue();
            return;
        }

        if self.engine.in_terminal() || self.engine.is_finished() {
            tracing::info!(consecutive, "Caller stayed silent through the close");
            self.close(EndReason::SilenceTimeout);
            return;
        }

        tracing::warn!(consecutive, "Caller silent, moving to the closing stage");
        match self.engine.force_close() {
            Ok(completion) => self.on_stage_completed(completion).await,
            Err(e) => self.fail(e),
        }
        self.drain_queue();
    }

    async fn finish(mut self) -> SessionReport {
        if let Some(utterance) = self.active.take() {
            utterance.handle.cancel();
            if utterance.handle.playback_started() {
                self.generator.clear_playback();
                let heard = utterance.handle.played_text();
                if !heard.trim().is_empty() {
                    self.context.append_turn(TurnRole::Assistant, heard.trim());
                }
            }
        }
        if let Some(halted) = self.halted.take() {
            halted.utterance.handle.cancel();
            let heard = halted.heard.trim();
            if !heard.is_empty() {
                self.context.append_turn(TurnRole::Assistant, heard);
            }
        }

        let reason = match std::mem::replace(&mut self.lifecycle, Lifecycle::Active) {
            Lifecycle::Closed(reason) => reason,
            _ => EndReason::Internal {
                reason: "session loop stopped".to_string(),
            },
        };

        let report = self.reporter.build(
            &self.id,
            &self.caller,
            self.started_at,
            reason.clone(),
            std::mem::take(&mut self.degradations),
            self.context.transcript(),
            self.engine.results(),
        );
        self.publish(SessionEvent::Ended { reason });

        if let Err(e) = self.reporter.emit(&report).await {
            tracing::error!(session_id = %self.id, error = %e, "Failed to deliver session report");
        }
        tracing::info!(
            session_id = %self.id,
            end_reason = ?report.end_reason,
            degraded = report.degraded,
            turns = report.transcript.len(),
            "Session ended"
        );
        report
    }
}
