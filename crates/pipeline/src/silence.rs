//! Silence monitor
//!
//! Runs beside the session loop and watches an activity snapshot the loop
//! publishes. Prolonged user silence while the agent is quiet produces a
//! `SilenceTimeout` event; the count of consecutive timeouts resets as soon
//! as the user speaks again.

use dialogue_config::SilenceConfig;
use dialogue_core::TurnEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Conversation activity published by the session loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activity {
    /// Most recent user voice activity (or session start)
    pub last_user_speech: Instant,
    pub user_active: bool,
    pub agent_speaking: bool,
    /// When the agent last stopped speaking
    pub agent_done_at: Option<Instant>,
}

impl Activity {
    pub fn new(now: Instant) -> Self {
        Self {
            last_user_speech: now,
            user_active: false,
            agent_speaking: false,
            agent_done_at: None,
        }
    }
}

#[derive(Debug)]
pub struct SilenceMonitor {
    config: SilenceConfig,
    consecutive: u32,
    last_fired: Option<Instant>,
    seen_user_speech: Option<Instant>,
}

impl SilenceMonitor {
    pub fn new(config: SilenceConfig) -> Self {
        Self {
            config,
            consecutive: 0,
            last_fired: None,
            seen_user_speech: None,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Evaluate one tick. Returns the consecutive timeout count when firing.
    pub fn check(&mut self, activity: &Activity, now: Instant) -> Option<u32> {
        if !self.config.enabled {
            return None;
        }

        if self
            .seen_user_speech
            .map_or(true, |seen| activity.last_user_speech > seen)
        {
            if self.seen_user_speech.is_some() && self.consecutive > 0 {
                tracing::debug!(previous = self.consecutive, "User spoke, silence count reset");
            }
            self.seen_user_speech = Some(activity.last_user_speech);
            self.consecutive = 0;
            self.last_fired = None;
        }

        if activity.agent_speaking || activity.user_active {
            return None;
        }

        if let Some(done) = activity.agent_done_at {
            if now.duration_since(done) < self.config.cooldown() {
                return None;
            }
        }

        let silent_since = [
            Some(activity.last_user_speech),
            activity.agent_done_at,
            self.last_fired,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(activity.last_user_speech);

        if now.duration_since(silent_since) >= self.config.threshold() {
            self.consecutive += 1;
            self.last_fired = Some(now);
            tracing::info!(consecutive = self.consecutive, "User silence threshold reached");
            Some(self.consecutive)
        } else {
            None
        }
    }

    /// Run on its own task until the session drops either channel
    pub fn spawn<M>(
        mut self,
        activity: watch::Receiver<Activity>,
        events: mpsc::UnboundedSender<M>,
    ) -> JoinHandle<()>
    where
        M: From<TurnEvent> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if activity.has_changed().is_err() || events.is_closed() {
                    break;
                }

                let snapshot = *activity.borrow();
                if let Some(consecutive) = self.check(&snapshot, Instant::now()) {
                    if events
                        .send(M::from(TurnEvent::SilenceTimeout { consecutive }))
                        .is_err()
                    {
                        break;
                    }
                }
            }

            tracing::debug!("Silence monitor stopped");
        })
    }
}
