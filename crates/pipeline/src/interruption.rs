//! Interruption handling
//!
//! Classifies user speech that overlaps agent playback. A burst only counts
//! as an interruption once it is both long enough and contains enough
//! recognized words. After an interruption the controller waits for the
//! user's turn to commit; if nothing real arrives it asks for the halted
//! utterance to resume.

use dialogue_config::InterruptionConfig;
use tokio::time::Instant;

/// Agent-side speaking state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionState {
    AgentIdle,
    AgentSpeaking,
    /// Playback halted by the user, waiting for their turn
    Interrupted,
    /// Halted utterance is about to be replayed
    Resuming,
}

/// Action the session must take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionDecision {
    /// Halt playback until the user's turn commits or turns out to be noise
    Interrupt,
    /// Replay the halted utterance from where it stopped
    Resume,
}

/// How to treat a committed user turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// Normal turn, generate a reply
    Reply,
    /// Turn arrived during agent speech and is substantial: halt, then reply
    Interrupt,
    /// Short acknowledgement during agent speech: record it, keep talking
    Backchannel,
}

#[derive(Debug)]
pub struct InterruptionController {
    config: InterruptionConfig,
    state: InterruptionState,
    /// Start of the overlapping burst being evaluated
    candidate_since: Option<Instant>,
    candidate_words: usize,
    user_speaking: bool,
    /// False-interruption clock starts here
    quiet_since: Option<Instant>,
}

impl InterruptionController {
    pub fn new(config: InterruptionConfig) -> Self {
        Self {
            config,
            state: InterruptionState::AgentIdle,
            candidate_since: None,
            candidate_words: 0,
            user_speaking: false,
            quiet_since: None,
        }
    }

    pub fn state(&self) -> InterruptionState {
        self.state
    }

    /// Agent playback started (fresh or resumed)
    pub fn agent_started(&mut self, at: Instant) {
        self.state = InterruptionState::AgentSpeaking;
        self.candidate_words = 0;
        self.candidate_since = if self.user_speaking && self.config.enabled {
            Some(at)
        } else {
            None
        };
    }

    /// Agent playback ran to completion
    pub fn agent_finished(&mut self) {
        if self.state == InterruptionState::AgentSpeaking {
            self.state = InterruptionState::AgentIdle;
        }
        self.candidate_since = None;
        self.candidate_words = 0;
    }

    pub fn user_voice_started(&mut self, at: Instant) {
        self.user_speaking = true;
        if self.state == InterruptionState::AgentSpeaking && self.config.enabled {
            self.candidate_since = Some(at);
            self.candidate_words = 0;
        }
    }

    pub fn user_voice_ended(&mut self, at: Instant) -> Option<InterruptionDecision> {
        self.user_speaking = false;
        match self.state {
            InterruptionState::AgentSpeaking => {
                let decision = self.check_candidate(at);
                if decision.is_none() && self.candidate_since.take().is_some() {
                    tracing::debug!(
                        words = self.candidate_words,
                        "Overlapping speech below interruption thresholds"
                    );
                    self.candidate_words = 0;
                }
                decision
            }
            InterruptionState::Interrupted => {
                self.quiet_since = Some(at);
                None
            }
            _ => None,
        }
    }

    /// Word count of the user's in-progress text
    pub fn user_words(&mut self, words: usize, at: Instant) -> Option<InterruptionDecision> {
        if self.state != InterruptionState::AgentSpeaking || self.candidate_since.is_none() {
            return None;
        }
        self.candidate_words = self.candidate_words.max(words);
        if self.user_speaking {
            self.check_candidate(at)
        } else {
            None
        }
    }

    /// Advance timers
    pub fn poll(&mut self, now: Instant) -> Option<InterruptionDecision> {
        match self.state {
            InterruptionState::AgentSpeaking if self.user_speaking => self.check_candidate(now),
            InterruptionState::Interrupted if !self.user_speaking => {
                let quiet_since = self.quiet_since?;
                if now.duration_since(quiet_since) >= self.config.false_interruption_timeout() {
                    tracing::info!("No user turn after interruption, resuming agent speech");
                    self.state = InterruptionState::Resuming;
                    self.quiet_since = None;
                    Some(InterruptionDecision::Resume)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Classify a committed user turn
    pub fn committed(&mut self, words: usize, at: Instant) -> CommitAction {
        match self.state {
            InterruptionState::AgentSpeaking => {
                if self.config.enabled && words >= self.config.min_words {
                    self.interrupt(at);
                    CommitAction::Interrupt
                } else {
                    self.candidate_since = None;
                    self.candidate_words = 0;
                    CommitAction::Backchannel
                }
            }
            InterruptionState::Resuming => {
                self.interrupt(at);
                CommitAction::Interrupt
            }
            InterruptionState::Interrupted | InterruptionState::AgentIdle => CommitAction::Reply,
        }
    }

    /// The interrupting utterance turned out to be noise
    pub fn abandoned(&mut self) -> Option<InterruptionDecision> {
        if self.state == InterruptionState::Interrupted {
            self.state = InterruptionState::Resuming;
            self.quiet_since = None;
            Some(InterruptionDecision::Resume)
        } else {
            None
        }
    }

    /// Reply generation for the interrupting turn started
    pub fn reply_started(&mut self) {
        if self.state == InterruptionState::Interrupted {
            self.state = InterruptionState::AgentIdle;
            self.quiet_since = None;
        }
    }

    /// Forget any halted utterance
    pub fn reset(&mut self) {
        self.state = InterruptionState::AgentIdle;
        self.candidate_since = None;
        self.candidate_words = 0;
        self.quiet_since = None;
    }

    fn check_candidate(&mut self, at: Instant) -> Option<InterruptionDecision> {
        let since = self.candidate_since?;
        let long_enough = at.duration_since(since) >= self.config.min_duration();
        let enough_words = self.candidate_words >= self.config.min_words;
        if long_enough && enough_words {
            self.interrupt(at);
            Some(InterruptionDecision::Interrupt)
        } else {
            None
        }
    }

    fn interrupt(&mut self, at: Instant) {
        tracing::info!(words = self.candidate_words, "User interrupted agent speech");
        self.state = InterruptionState::Interrupted;
        self.candidate_since = None;
        self.candidate_words = 0;
        self.quiet_since = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    fn speaking(t0: Instant) -> InterruptionController {
        let mut controller = InterruptionController::new(InterruptionConfig::default());
        controller.agent_started(t0);
        controller
    }

    #[test]
    fn test_short_burst_never_interrupts() {
        let t0 = Instant::now();
        let mut controller = speaking(t0);

        controller.user_voice_started(ms(t0, 100));
        assert_eq!(controller.user_words(3, ms(t0, 300)), None);
        assert_eq!(controller.user_voice_ended(ms(t0, 400)), None);
        assert_eq!(controller.poll(ms(t0, 2000)), None);
        assert_eq!(controller.state(), InterruptionState::AgentSpeaking);
    }

    #[test]
    fn test_long_burst_needs_words() {
        let t0 = Instant::now();
        let mut controller = speaking(t0);

        controller.user_voice_started(ms(t0, 100));
        controller.user_words(1, ms(t0, 500));
        assert_eq!(controller.poll(ms(t0, 900)), None);

        controller.user_words(2, ms(t0, 950));
        assert_eq!(controller.state(), InterruptionState::Interrupted);
    }

    #[test]
    fn test_poll_interrupts_once_thresholds_pass() {
        let t0 = Instant::now();
        let mut controller = speaking(t0);

        controller.user_voice_started(ms(t0, 100));
        assert_eq!(controller.user_words(4, ms(t0, 200)), None);
        assert_eq!(
            controller.poll(ms(t0, 600)),
            Some(InterruptionDecision::Interrupt)
        );
        assert_eq!(controller.poll(ms(t0, 620)), None);
    }

    #[test]
    fn test_false_interruption_resumes_after_quiet_period() {
        let t0 = Instant::now();
        let mut controller = speaking(t0);

        controller.user_voice_started(ms(t0, 0));
        controller.user_words(2, ms(t0, 100));
        controller.poll(ms(t0, 500));
        assert_eq!(controller.state(), InterruptionState::Interrupted);

        assert_eq!(controller.poll(ms(t0, 3000)), None, "user still speaking");
        controller.user_voice_ended(ms(t0, 3000));
        assert_eq!(controller.poll(ms(t0, 4900)), None);
        assert_eq!(
            controller.poll(ms(t0, 5000)),
            Some(InterruptionDecision::Resume)
        );
        assert_eq!(controller.state(), InterruptionState::Resuming);

        controller.agent_started(ms(t0, 5100));
        assert_eq!(controller.state(), InterruptionState::AgentSpeaking);
    }

    #[test]
    fn test_commit_during_speech() {
        let t0 = Instant::now();
        let mut controller = speaking(t0);
        assert_eq!(controller.committed(1, ms(t0, 100)), CommitAction::Backchannel);
        assert_eq!(controller.state(), InterruptionState::AgentSpeaking);

        assert_eq!(controller.committed(3, ms(t0, 200)), CommitAction::Interrupt);
        assert_eq!(controller.state(), InterruptionState::Interrupted);
    }

    #[test]
    fn test_real_turn_after_interruption() {
        let t0 = Instant::now();
        let mut controller = speaking(t0);
        controller.user_voice_started(t0);
        controller.user_words(2, ms(t0, 600));

        assert_eq!(controller.committed(2, ms(t0, 900)), CommitAction::Reply);
        controller.reply_started();
        assert_eq!(controller.state(), InterruptionState::AgentIdle);
        assert_eq!(controller.poll(ms(t0, 9000)), None);
    }

    #[test]
    fn test_abandoned_utterance_resumes_immediately() {
        let t0 = Instant::now();
        let mut controller = speaking(t0);
        controller.committed(5, t0);

        assert_eq!(controller.abandoned(), Some(InterruptionDecision::Resume));
        assert_eq!(controller.abandoned(), None);
    }

    #[test]
    fn test_disabled_never_interrupts() {
        let t0 = Instant::now();
        let config = InterruptionConfig {
            enabled: false,
            ..Default::default()
        };
        let mut controller = InterruptionController::new(config);
        controller.agent_started(t0);
        controller.user_voice_started(t0);
        controller.user_words(10, ms(t0, 2000));

        assert_eq!(controller.poll(ms(t0, 3000)), None);
        assert_eq!(controller.committed(10, ms(t0, 3000)), CommitAction::Backchannel);
    }
}
