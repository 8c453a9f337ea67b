//! Utterance generation
//!
//! Each utterance runs on its own task: a producer streams reply text from
//! the backend and cuts it into speakable chunks, a speaker synthesizes each
//! chunk and hands audio to the sink. The speaker waits on a gate, so a
//! speculative reply can be fully prepared before the user's turn is final
//! and released (or cancelled) once it is.
//!
//! The same gate pauses an interrupted utterance. Only the speaker stops;
//! the producer keeps streaming text and outcomes, and a resumed speaker
//! picks up again from the word that was cut off.
//!
//! The task reports back through the session's event channel. A cancelled
//! task reports nothing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dialogue_config::GenerationConfig;
use dialogue_core::{
    AudioSink, FieldValue, KnowledgeRetriever, PlaybackFrame, ReplyBackend, ReplyChunk,
    ReplyRequest, SpeechSynthesizer,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::streaming::{SpeechChunk, SpeechChunker};
use crate::LlmError;

/// Result of a finished utterance
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub generation: u64,
    /// Full utterance text
    pub text: String,
    /// Outcome fields recorded by the backend, in order
    pub outcomes: Vec<(String, FieldValue)>,
    /// Backend signalled that the current stage is finished
    pub stage_done: bool,
}

/// Progress reported back to the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// First audio frame is about to play
    PlaybackStarted { generation: u64 },
    /// All text generated and all audio played
    Completed(GenerationOutput),
    /// Generation or playback failed; `played` is the text already heard
    Failed {
        generation: u64,
        error: LlmError,
        played: String,
    },
}

impl GenerationEvent {
    pub fn generation(&self) -> u64 {
        match self {
            GenerationEvent::PlaybackStarted { generation } => *generation,
            GenerationEvent::Completed(output) => output.generation,
            GenerationEvent::Failed { generation, .. } => *generation,
        }
    }
}

/// Lowercase, strip punctuation and collapse whitespace
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// When an utterance reached each milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationTiming {
    pub launched_at: Instant,
    /// First reply text from the backend; scripted speech has none
    pub first_token_at: Option<Instant>,
    /// First audio frame handed to the sink
    pub first_audio_at: Option<Instant>,
}

/// Playback gate between a handle and its speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Speculative; nothing may play yet
    Held,
    Open,
    /// Interrupted; playback waits while generation continues
    Paused,
    /// Play again from this byte offset
    Resumed { from: usize },
}

impl Gate {
    fn is_open(&self) -> bool {
        matches!(self, Gate::Open | Gate::Resumed { .. })
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    text: String,
    outcomes: Vec<(String, FieldValue)>,
    stage_done: bool,
    first_token_at: Option<Instant>,
    first_audio_at: Option<Instant>,
}

/// Shared between a handle and its task
#[derive(Debug, Default)]
struct Progress {
    state: Mutex<ProgressState>,
    /// Bytes of `text` whose audio has been handed to the sink
    played: AtomicUsize,
    started: AtomicBool,
}

impl Progress {
    fn with_text(text: &str, played: usize) -> Self {
        let progress = Self::default();
        progress.state.lock().text = text.to_string();
        progress.played.store(played, Ordering::SeqCst);
        progress
    }

    fn append(&self, text: &str) {
        let mut state = self.state.lock();
        state.first_token_at.get_or_insert_with(Instant::now);
        state.text.push_str(text);
    }

    /// Returns true the first time audio starts after launch or a resume
    fn audio_started(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.lock().first_audio_at.get_or_insert_with(Instant::now);
        true
    }

    fn record(&self, field: String, value: FieldValue) {
        self.state.lock().outcomes.push((field, value));
    }

    fn mark_stage_done(&self) {
        self.state.lock().stage_done = true;
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.text.trim().is_empty() && state.outcomes.is_empty() && !state.stage_done
    }

    fn advance_played(&self, to: usize) {
        self.played.fetch_max(to, Ordering::SeqCst);
    }

    fn played_bytes(&self) -> usize {
        let state = self.state.lock();
        floor_char_boundary(&state.text, self.played.load(Ordering::SeqCst))
    }

    fn played_text(&self) -> String {
        let state = self.state.lock();
        let end = floor_char_boundary(&state.text, self.played.load(Ordering::SeqCst));
        state.text[..end].to_string()
    }

    fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    fn output(&self, generation: u64) -> GenerationOutput {
        let state = self.state.lock();
        GenerationOutput {
            generation,
            text: state.text.clone(),
            outcomes: state.outcomes.clone(),
            stage_done: state.stage_done,
        }
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut end = index.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Start of the word containing `offset`
fn word_start(text: &str, offset: usize) -> usize {
    let end = floor_char_boundary(text, offset);
    if text[end..].starts_with(char::is_whitespace) {
        return end;
    }
    text[..end]
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0)
}

/// One in-flight utterance
///
/// Dropping the handle cancels the utterance.
#[derive(Debug)]
pub struct GenerationHandle {
    generation: u64,
    /// Normalized user text this reply was generated for
    basis: String,
    launched_at: Instant,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    gate: watch::Sender<Gate>,
}

impl GenerationHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `text` is the same user turn this reply was started for
    pub fn matches(&self, text: &str) -> bool {
        let candidate = normalize(text);
        !candidate.is_empty() && candidate == self.basis
    }

    /// Open the playback gate
    pub fn release(&self) {
        self.gate.send_if_modified(|gate| {
            if *gate == Gate::Held {
                *gate = Gate::Open;
                return true;
            }
            false
        });
    }

    pub fn is_released(&self) -> bool {
        *self.gate.borrow() != Gate::Held
    }

    /// Stop playback at the current frame and keep generating.
    ///
    /// Returns the byte offset of the text heard so far.
    pub fn pause(&self) -> usize {
        self.gate.send_replace(Gate::Paused);
        let played = self.progress.played_bytes();
        tracing::debug!(generation = self.generation, played, "Pausing playback");
        played
    }

    /// Continue a paused utterance from the start of the word containing
    /// `offset`. Returns the offset playback restarts at.
    pub fn resume_from(&self, offset: usize) -> usize {
        let from = word_start(&self.progress.text(), offset);
        self.progress.started.store(false, Ordering::SeqCst);
        self.gate.send_replace(Gate::Resumed { from });
        tracing::debug!(generation = self.generation, offset, from, "Resuming playback");
        from
    }

    /// Stop generation, synthesis and playback. Safe to call repeatedly.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(generation = self.generation, "Cancelling generation");
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn playback_started(&self) -> bool {
        self.progress.started.load(Ordering::SeqCst)
    }

    /// Byte offset of the text already heard
    pub fn played_bytes(&self) -> usize {
        self.progress.played_bytes()
    }

    pub fn played_text(&self) -> String {
        self.progress.played_text()
    }

    /// Text generated so far
    pub fn text(&self) -> String {
        self.progress.text()
    }

    /// Everything produced so far, including recorded outcomes
    pub fn output(&self) -> GenerationOutput {
        self.progress.output(self.generation)
    }

    pub fn timing(&self) -> GenerationTiming {
        let state = self.progress.state.lock();
        GenerationTiming {
            launched_at: self.launched_at,
            first_token_at: state.first_token_at,
            first_audio_at: state.first_audio_at,
        }
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Source {
    Reply { request: ReplyRequest, query: String },
    Script { text: String, offset: usize },
}

/// Starts utterance tasks
pub struct UtteranceGenerator<M> {
    reply: Arc<dyn ReplyBackend>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    config: GenerationConfig,
    events: mpsc::UnboundedSender<M>,
}

impl<M> UtteranceGenerator<M>
where
    M: From<GenerationEvent> + Send + 'static,
{
    pub fn new(
        reply: Arc<dyn ReplyBackend>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
        config: GenerationConfig,
        events: mpsc::UnboundedSender<M>,
    ) -> Self {
        Self {
            reply,
            synthesizer,
            sink,
            retriever: None,
            config,
            events,
        }
    }

    pub fn with_retriever(mut self, retriever: Option<Arc<dyn KnowledgeRetriever>>) -> Self {
        self.retriever = retriever;
        self
    }

    /// Generate a reply to `user_text`.
    ///
    /// With `released == false` the reply is produced but held back from
    /// playback until [`GenerationHandle::release`].
    pub fn reply(&self, request: ReplyRequest, user_text: &str, released: bool) -> GenerationHandle {
        tracing::debug!(
            generation = request.generation,
            speculative = !released,
            "Starting reply generation"
        );
        let generation = request.generation;
        let source = Source::Reply {
            request,
            query: user_text.trim().to_string(),
        };
        self.launch(generation, user_text, Progress::default(), released, source)
    }

    /// Speak fixed text without the reply backend
    pub fn say(&self, generation: u64, text: &str) -> GenerationHandle {
        let source = Source::Script {
            text: text.to_string(),
            offset: 0,
        };
        self.launch(generation, "", Progress::with_text(text, 0), true, source)
    }

    /// Speak the remainder of a halted utterance, starting from the word
    /// that was cut off
    pub fn resume(&self, generation: u64, text: &str, offset: usize) -> GenerationHandle {
        let start = word_start(text, offset);
        tracing::debug!(generation, offset, start, "Resuming halted utterance");
        let source = Source::Script {
            text: text.to_string(),
            offset: start,
        };
        self.launch(generation, "", Progress::with_text(text, start), true, source)
    }

    /// Drop audio queued in the sink
    pub fn clear_playback(&self) {
        self.sink.clear();
    }

    fn launch(
        &self,
        generation: u64,
        basis: &str,
        progress: Progress,
        released: bool,
        source: Source,
    ) -> GenerationHandle {
        let progress = Arc::new(progress);
        let cancel = CancellationToken::new();
        let (gate, gate_rx) = watch::channel(if released { Gate::Open } else { Gate::Held });

        let worker = Worker {
            generation,
            reply: self.reply.clone(),
            synthesizer: self.synthesizer.clone(),
            sink: self.sink.clone(),
            retriever: self.retriever.clone(),
            config: self.config.clone(),
            progress: progress.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(worker.run(source, gate_rx, cancel.clone()));

        GenerationHandle {
            generation,
            basis: normalize(basis),
            launched_at: Instant::now(),
            progress,
            cancel,
            gate,
        }
    }
}

struct Worker<M> {
    generation: u64,
    reply: Arc<dyn ReplyBackend>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    config: GenerationConfig,
    progress: Arc<Progress>,
    events: mpsc::UnboundedSender<M>,
}

impl<M> Worker<M>
where
    M: From<GenerationEvent> + Send + 'static,
{
    async fn run(self, source: Source, gate: watch::Receiver<Gate>, cancel: CancellationToken) {
        // Unbounded so a paused speaker never stalls the producer
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = futures::future::try_join(
                self.produce(source, chunk_tx),
                self.speak(gate, chunk_rx),
            ) => Some(result),
        };

        let Some(result) = result else {
            tracing::trace!(generation = self.generation, "Generation task stopped by cancellation");
            return;
        };
        if cancel.is_cancelled() {
            return;
        }

        let event = match result {
            Ok(_) => GenerationEvent::Completed(self.progress.output(self.generation)),
            Err(error) => {
                tracing::warn!(generation = self.generation, error = %error, "Generation failed");
                GenerationEvent::Failed {
                    generation: self.generation,
                    error,
                    played: self.progress.played_text(),
                }
            }
        };
        let _ = self.events.send(M::from(event));
    }

    async fn produce(
        &self,
        source: Source,
        chunks: mpsc::UnboundedSender<SpeechChunk>,
    ) -> Result<(), LlmError> {
        match source {
            Source::Script { text, offset } => {
                let mut chunker = SpeechChunker::new().starting_at(offset);
                let mut pending = chunker.push(&text[floor_char_boundary(&text, offset)..]);
                pending.extend(chunker.flush());
                for chunk in pending {
                    chunks.send(chunk).map_err(|_| LlmError::Cancelled)?;
                }
                Ok(())
            }
            Source::Reply { request, query } => self.stream_reply(request, query, chunks).await,
        }
    }

    async fn stream_reply(
        &self,
        mut request: ReplyRequest,
        query: String,
        chunks: mpsc::UnboundedSender<SpeechChunk>,
    ) -> Result<(), LlmError> {
        if let Some(retriever) = self.retriever.as_ref().filter(|_| !query.is_empty()) {
            match timeout(self.config.retrieval_timeout(), retriever.search(&query)).await {
                Ok(Some(info)) => {
                    tracing::debug!(generation = self.generation, "Adding retrieved information");
                    request.instructions =
                        format!("{}\n\nRelevant information:\n{}", request.instructions, info);
                }
                Ok(None) => {}
                Err(_) => {
                    tracing::debug!(generation = self.generation, "Knowledge retrieval timed out");
                }
            }
        }

        let first_token = self.config.first_token_timeout();
        let idle = self.config.stream_idle_timeout();

        let mut stream = timeout(first_token, self.reply.generate(request))
            .await
            .map_err(|_| LlmError::timeout("reply stream", first_token))??;

        let mut chunker = SpeechChunker::new();
        let mut wait = first_token;
        loop {
            let next = timeout(wait, stream.next())
                .await
                .map_err(|_| LlmError::timeout("reply chunk", wait))?;
            let Some(item) = next else { break };
            wait = idle;

            match item? {
                ReplyChunk::Text(text) => {
                    self.progress.append(&text);
                    for chunk in chunker.push(&text) {
                        chunks.send(chunk).map_err(|_| LlmError::Cancelled)?;
                    }
                }
                ReplyChunk::Record { field, value } => {
                    tracing::debug!(generation = self.generation, field = %field, value = %value, "Outcome recorded");
                    self.progress.record(field, value);
                }
                ReplyChunk::StageDone => self.progress.mark_stage_done(),
            }
        }

        if let Some(chunk) = chunker.flush() {
            chunks.send(chunk).map_err(|_| LlmError::Cancelled)?;
        }

        if self.progress.is_empty() {
            return Err(LlmError::EmptyReply);
        }
        Ok(())
    }

    async fn speak(
        &self,
        mut gate: watch::Receiver<Gate>,
        mut chunks: mpsc::UnboundedReceiver<SpeechChunk>,
    ) -> Result<(), LlmError> {
        gate.wait_for(Gate::is_open)
            .await
            .map_err(|_| LlmError::Cancelled)?;

        while let Some(chunk) = chunks.recv().await {
            let mut from = chunk.offset;
            loop {
                if *gate.borrow() == Gate::Paused {
                    from = wait_resumed(&mut gate).await?.clamp(chunk.offset, chunk.end());
                }
                match self.speak_chunk(&chunk, from, &mut gate).await? {
                    Spoken::Done => break,
                    Spoken::Paused => continue,
                }
            }
        }

        Ok(())
    }

    /// Play `chunk` from byte offset `from` until it ends or the gate pauses
    async fn speak_chunk(
        &self,
        chunk: &SpeechChunk,
        from: usize,
        gate: &mut watch::Receiver<Gate>,
    ) -> Result<Spoken, LlmError> {
        let skip = floor_char_boundary(&chunk.text, from - chunk.offset);
        let text = &chunk.text[skip..];
        let base = chunk.offset + skip;
        if text.trim().is_empty() {
            self.progress.advance_played(chunk.end());
            return Ok(Spoken::Done);
        }

        let idle = self.config.stream_idle_timeout();
        let mut audio = timeout(idle, self.synthesizer.synthesize(text))
            .await
            .map_err(|_| LlmError::timeout("synthesis", idle))??;

        while let Some(block) = timeout(idle, audio.next())
            .await
            .map_err(|_| LlmError::timeout("synthesized audio", idle))?
        {
            let block = block?;
            if *gate.borrow() == Gate::Paused {
                return Ok(Spoken::Paused);
            }
            if self.progress.audio_started() {
                let _ = self.events.send(M::from(GenerationEvent::PlaybackStarted {
                    generation: self.generation,
                }));
            }

            let frame = PlaybackFrame {
                generation: self.generation,
                samples: block.samples,
            };
            tokio::select! {
                biased;
                paused = gate.wait_for(|g| *g == Gate::Paused) => {
                    paused.map_err(|_| LlmError::Cancelled)?;
                    return Ok(Spoken::Paused);
                }
                played = self.sink.play(frame) => played?,
            }
            self.progress
                .advance_played(base + block.text_end.min(text.len()));
        }
        self.progress.advance_played(chunk.end());
        Ok(Spoken::Done)
    }
}

enum Spoken {
    Done,
    Paused,
}

async fn wait_resumed(gate: &mut watch::Receiver<Gate>) -> Result<usize, LlmError> {
    let resumed = gate
        .wait_for(|g| matches!(g, Gate::Resumed { .. }))
        .await
        .map_err(|_| LlmError::Cancelled)?;
    match *resumed {
        Gate::Resumed { from } => Ok(from),
        _ => Err(LlmError::Cancelled),
    }
}
