//! Turn signal aggregator

use dialogue_config::TurnConfig;
use dialogue_core::{TranscriptResult, TurnEvent, VadBoundary};
use tokio::time::Instant;

/// Where the current user utterance stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// No utterance in progress
    Idle,
    /// Voice detected but shorter than the minimum speech duration so far
    Pending { since: Instant },
    /// Confirmed user speech
    Speaking,
    /// Voice stopped, waiting to call a tentative end
    TrailingSilence { since: Instant },
    /// Tentative end emitted, waiting for final text
    Tentative { since: Instant },
    /// Voice came back after trailing silence but is not yet confirmed.
    /// A burst that stays too short restores the held phase.
    Resuming {
        since: Instant,
        held_since: Instant,
        tentative: bool,
    },
    /// Final text already committed while voice is still active. The rest
    /// of the burst belongs to the committed utterance.
    Committed,
}

/// Fuses VAD boundaries and recognizer output into turn events
#[derive(Debug)]
pub struct TurnSignalAggregator {
    config: TurnConfig,
    phase: TurnPhase,
    vad_active: bool,
    /// Best partial text for the in-progress utterance
    partial: String,
    /// Recognizer output for a discarded burst is ignored
    drop_late_text: bool,
    speech_ended_at: Option<Instant>,
}

impl TurnSignalAggregator {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            phase: TurnPhase::Idle,
            vad_active: false,
            partial: String::new(),
            drop_late_text: false,
            speech_ended_at: None,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// User is mid-utterance
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, TurnPhase::Idle | TurnPhase::Committed)
    }

    pub fn partial_text(&self) -> &str {
        &self.partial
    }

    /// When voice last stopped, if it is not active now
    pub fn speech_ended_at(&self) -> Option<Instant> {
        self.speech_ended_at
    }

    /// Feed a voice activity boundary
    pub fn on_vad(&mut self, boundary: VadBoundary, at: Instant) -> Vec<TurnEvent> {
        let mut events = Vec::new();

        match boundary {
            VadBoundary::SpeechStart => {
                self.vad_active = true;
                self.speech_ended_at = None;
                self.drop_late_text = false;
                self.phase = match self.phase {
                    TurnPhase::Idle => TurnPhase::Pending { since: at },
                    TurnPhase::TrailingSilence { since } => TurnPhase::Resuming {
                        since: at,
                        held_since: since,
                        tentative: false,
                    },
                    TurnPhase::Tentative { since } => TurnPhase::Resuming {
                        since: at,
                        held_since: since,
                        tentative: true,
                    },
                    other => other,
                };
            }
            VadBoundary::SpeechEnd => {
                self.vad_active = false;
                self.speech_ended_at = Some(at);
                match self.phase {
                    TurnPhase::Pending { since } => {
                        if at.duration_since(since) >= self.config.min_speech() {
                            events.push(TurnEvent::SpeechStarted { resumed: false });
                            self.phase = TurnPhase::TrailingSilence { since: at };
                        } else {
                            tracing::trace!(
                                duration_ms = at.duration_since(since).as_millis() as u64,
                                "Discarding short voice burst"
                            );
                            self.phase = TurnPhase::Idle;
                            self.partial.clear();
                            self.drop_late_text = true;
                        }
                    }
                    TurnPhase::Resuming {
                        since,
                        held_since,
                        tentative,
                    } => {
                        if at.duration_since(since) >= self.config.min_speech() {
                            events.push(TurnEvent::SpeechStarted { resumed: true });
                            self.phase = TurnPhase::TrailingSilence { since: at };
                        } else if tentative {
                            self.phase = TurnPhase::Tentative { since: held_since };
                        } else {
                            self.phase = TurnPhase::TrailingSilence { since: held_since };
                        }
                    }
                    TurnPhase::Speaking => {
                        self.phase = TurnPhase::TrailingSilence { since: at };
                    }
                    TurnPhase::Committed => {
                        self.phase = TurnPhase::Idle;
                    }
                    _ => {}
                }
            }
        }

        events
    }

    /// Feed recognizer output
    pub fn on_transcript(&mut self, result: &TranscriptResult, at: Instant) -> Vec<TurnEvent> {
        if self.drop_late_text && self.phase == TurnPhase::Idle {
            if result.is_final {
                self.drop_late_text = false;
            }
            return Vec::new();
        }

        if !result.is_final {
            if !result.is_empty() {
                self.partial = result.text.trim().to_string();
                if self.phase == TurnPhase::Committed {
                    // New words after the commit start a fresh utterance
                    self.phase = TurnPhase::Pending { since: at };
                }
            }
            return Vec::new();
        }

        self.partial.clear();

        if result.is_empty() {
            if self.phase == TurnPhase::Committed {
                return Vec::new();
            }
            if !self.vad_active && self.is_active() {
                self.phase = TurnPhase::Idle;
                return vec![TurnEvent::SpeechAbandoned];
            }
            return Vec::new();
        }

        self.phase = if self.vad_active {
            TurnPhase::Committed
        } else {
            TurnPhase::Idle
        };

        vec![TurnEvent::SpeechEndedCommitted {
            text: result.text.trim().to_string(),
            degraded: false,
        }]
    }

    /// Advance timers
    pub fn poll(&mut self, now: Instant) -> Vec<TurnEvent> {
        let mut events = Vec::new();

        match self.phase {
            TurnPhase::Pending { since }
                if self.vad_active && now.duration_since(since) >= self.config.min_speech() =>
            {
                self.phase = TurnPhase::Speaking;
                events.push(TurnEvent::SpeechStarted { resumed: false });
            }
            TurnPhase::Resuming { since, .. }
                if self.vad_active && now.duration_since(since) >= self.config.min_speech() =>
            {
                self.phase = TurnPhase::Speaking;
                events.push(TurnEvent::SpeechStarted { resumed: true });
            }
            TurnPhase::TrailingSilence { since }
                if now.duration_since(since) >= self.config.tentative_silence() =>
            {
                self.phase = TurnPhase::Tentative { since: now };
                events.push(TurnEvent::SpeechEndedTentative {
                    text: self.partial.clone(),
                });
            }
            TurnPhase::Tentative { since }
                if now.duration_since(since) >= self.config.force_commit() =>
            {
                self.phase = TurnPhase::Idle;
                let text = std::mem::take(&mut self.partial);
                if text.is_empty() {
                    tracing::debug!("No text recognized before force-commit deadline");
                    events.push(TurnEvent::SpeechAbandoned);
                } else {
                    tracing::warn!(text = %text, "Recognizer did not finalize, force-committing partial");
                    events.push(TurnEvent::SpeechEndedCommitted {
                        text,
                        degraded: true,
                    });
                }
            }
            _ => {}
        }

        events
    }

    /// Discard the in-progress utterance
    pub fn reset(&mut self) {
        self.phase = TurnPhase::Idle;
        self.partial.clear();
        self.drop_late_text = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    fn aggregator() -> TurnSignalAggregator {
        TurnSignalAggregator::new(TurnConfig::default())
    }

    #[test]
    fn test_short_burst_is_ignored() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        assert!(agg.on_vad(VadBoundary::SpeechStart, t0).is_empty());
        assert!(agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 30)).is_empty());
        assert!(agg.poll(ms(t0, 5000)).is_empty());
        assert!(agg
            .on_transcript(&TranscriptResult::final_text("uh"), ms(t0, 5100))
            .is_empty());
        assert!(!agg.is_active());
    }

    #[test]
    fn test_final_text_commits_before_silence() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        assert_eq!(
            agg.poll(ms(t0, 100)),
            vec![TurnEvent::SpeechStarted { resumed: false }]
        );

        let events = agg.on_transcript(&TranscriptResult::final_text("yes please"), ms(t0, 400));
        assert_eq!(
            events,
            vec![TurnEvent::SpeechEndedCommitted {
                text: "yes please".into(),
                degraded: false
            }]
        );
        assert_eq!(agg.phase(), TurnPhase::Committed);
        assert!(!agg.is_active());
        assert!(agg.speech_ended_at().is_none());
    }

    #[test]
    fn test_voice_end_after_commit_is_silent() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        agg.on_transcript(&TranscriptResult::final_text("yes please"), ms(t0, 400));
        assert!(agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 500)).is_empty());

        assert_eq!(agg.phase(), TurnPhase::Idle);
        assert!(agg.poll(ms(t0, 1000)).is_empty());
        assert!(agg.poll(ms(t0, 5000)).is_empty());
        assert!(!agg.is_active());
        assert_eq!(agg.speech_ended_at(), Some(ms(t0, 500)));
    }

    #[test]
    fn test_new_words_after_commit_start_next_utterance() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        agg.on_transcript(&TranscriptResult::final_text("yes"), ms(t0, 300));
        agg.on_transcript(&TranscriptResult::partial_text("and also"), ms(t0, 600));
        assert!(matches!(agg.phase(), TurnPhase::Pending { .. }));

        assert_eq!(
            agg.poll(ms(t0, 700)),
            vec![TurnEvent::SpeechStarted { resumed: false }]
        );
        agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 900));
        assert_eq!(
            agg.poll(ms(t0, 1200)),
            vec![TurnEvent::SpeechEndedTentative {
                text: "and also".into()
            }]
        );
    }

    #[test]
    fn test_tentative_then_committed() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        agg.poll(ms(t0, 100));
        agg.on_transcript(&TranscriptResult::partial_text("I think so"), ms(t0, 300));
        agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 400));

        assert!(agg.poll(ms(t0, 600)).is_empty());
        assert_eq!(
            agg.poll(ms(t0, 660)),
            vec![TurnEvent::SpeechEndedTentative {
                text: "I think so".into()
            }]
        );

        let events = agg.on_transcript(&TranscriptResult::final_text("I think so"), ms(t0, 800));
        assert_eq!(
            events,
            vec![TurnEvent::SpeechEndedCommitted {
                text: "I think so".into(),
                degraded: false
            }]
        );
        assert_eq!(agg.phase(), TurnPhase::Idle);
    }

    #[test]
    fn test_speech_resuming_after_tentative() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        agg.on_transcript(&TranscriptResult::partial_text("my city is"), ms(t0, 200));
        agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 300));
        agg.poll(ms(t0, 600));
        assert!(matches!(agg.phase(), TurnPhase::Tentative { .. }));

        agg.on_vad(VadBoundary::SpeechStart, ms(t0, 700));
        assert_eq!(
            agg.poll(ms(t0, 800)),
            vec![TurnEvent::SpeechStarted { resumed: true }]
        );
        assert_eq!(agg.phase(), TurnPhase::Speaking);
    }

    #[test]
    fn test_short_burst_keeps_tentative_deadline() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        agg.on_transcript(&TranscriptResult::partial_text("okay"), ms(t0, 100));
        agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 200));
        agg.poll(ms(t0, 500));

        agg.on_vad(VadBoundary::SpeechStart, ms(t0, 1000));
        assert!(agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 1020)).is_empty());
        assert_eq!(agg.phase(), TurnPhase::Tentative { since: ms(t0, 500) });

        let events = agg.poll(ms(t0, 3500));
        assert_eq!(
            events,
            vec![TurnEvent::SpeechEndedCommitted {
                text: "okay".into(),
                degraded: true
            }]
        );
    }

    #[test]
    fn test_force_commit_without_text_abandons() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        assert_eq!(
            agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 300)),
            vec![TurnEvent::SpeechStarted { resumed: false }]
        );
        assert_eq!(
            agg.poll(ms(t0, 600)),
            vec![TurnEvent::SpeechEndedTentative {
                text: String::new()
            }]
        );
        assert_eq!(agg.poll(ms(t0, 3600)), vec![TurnEvent::SpeechAbandoned]);
        assert!(!agg.is_active());
    }

    #[test]
    fn test_empty_final_abandons_utterance() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        agg.on_vad(VadBoundary::SpeechEnd, ms(t0, 200));
        let events = agg.on_transcript(&TranscriptResult::final_text("  "), ms(t0, 300));
        assert_eq!(events, vec![TurnEvent::SpeechAbandoned]);
    }

    #[test]
    fn test_reset_drops_late_text() {
        let t0 = Instant::now();
        let mut agg = aggregator();

        agg.on_vad(VadBoundary::SpeechStart, t0);
        agg.poll(ms(t0, 100));
        agg.on_transcript(&TranscriptResult::partial_text("hmm"), ms(t0, 150));
        agg.reset();

        assert!(!agg.is_active());
        assert!(agg.partial_text().is_empty());
        assert!(agg
            .on_transcript(&TranscriptResult::final_text("hmm"), ms(t0, 400))
            .is_empty());
    }
}
