//! Event scheduling
//!
//! Timers are spawned tasks that sleep and then post a [`TimerEvent`] back
//! to the controller's loop. Each arming carries a generation number; a
//! fired event is only accepted if it matches the slot's current arming, so
//! an event that was already in the channel when its timer got replaced is
//! ignored.

use custodian_api::ActionKind;
use custodian_config::TimingConfig;
use custodian_util::{format_seconds, ActionThrottle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Source label for evaluations rescheduled by the action gap
pub const ACTION_GAP_SOURCE: &str = "action-gap";

/// Timer expiries delivered to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Debounced evaluation is due
    Evaluate { generation: u64, source: String },

    /// Graceful quit timed out
    ForceKillDeadline { generation: u64 },

    /// Re-check the outcome of an action
    VerifyAction { generation: u64, kind: ActionKind },
}

pub type TimerSender = mpsc::UnboundedSender<TimerEvent>;
pub type TimerReceiver = mpsc::UnboundedReceiver<TimerEvent>;

/// An optional cancellable timer. Arming always cancels the previous one.
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot; `make` builds the event from the new generation.
    pub fn arm(
        &mut self,
        delay: Duration,
        timers: &TimerSender,
        make: impl FnOnce(u64) -> TimerEvent,
    ) -> u64 {
        self.cancel();
        self.generation += 1;

        let event = make(self.generation);
        let timers = timers.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(event);
        }));

        self.generation
    }

    /// Cancel the armed timer. Safe to call when nothing is armed.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Accept a fired event and disarm, if it belongs to the current arming
    pub fn accept(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Debounced evaluation scheduling and action-gap throttling
#[derive(Debug)]
pub struct EventScheduler {
    timers: TimerSender,
    pending: TimerSlot,
    pending_source: Option<String>,
    debounce: Duration,
    throttle: ActionThrottle,
}

impl EventScheduler {
    pub fn new(timing: &TimingConfig, timers: TimerSender) -> Self {
        Self {
            timers,
            pending: TimerSlot::new(),
            pending_source: None,
            debounce: timing.debounce,
            throttle: ActionThrottle::new(timing.min_action_gap),
        }
    }

    pub fn set_timing(&mut self, timing: &TimingConfig) {
        self.debounce = timing.debounce;
        self.throttle.set_min_gap(timing.min_action_gap);
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Schedule an evaluation, replacing any pending one.
    ///
    /// Returns the delay actually used.
    pub fn trigger(&mut self, source: &str, delay_override: Option<Duration>) -> Duration {
        let delay = delay_override.unwrap_or(self.debounce);
        let replaced = self.pending_source.take();

        let owned = source.to_string();
        self.pending
            .arm(delay, &self.timers, |generation| TimerEvent::Evaluate {
                generation,
                source: owned,
            });
        self.pending_source = Some(source.to_string());

        debug!(
            source,
            delay = %format_seconds(delay),
            replaced = replaced.as_deref().unwrap_or("-"),
            "Evaluation scheduled"
        );
        delay
    }

    /// Cancel the pending evaluation, if any
    pub fn cancel_pending(&mut self) -> bool {
        self.pending_source = None;
        self.pending.cancel()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_armed()
    }

    /// Accept a fired evaluation event
    pub fn accept(&mut self, generation: u64) -> bool {
        let accepted = self.pending.accept(generation);
        if accepted {
            self.pending_source = None;
        }
        accepted
    }

    /// Time until another physical action is allowed
    pub fn action_gap_remaining(&self) -> Option<Duration> {
        self.throttle.remaining(monotonic_now())
    }

    pub fn record_action(&mut self) {
        self.throttle.record(monotonic_now());
    }

    /// Re-evaluate once the action gap has passed
    pub fn defer(&mut self, remaining: Duration) {
        self.trigger(ACTION_GAP_SOURCE, Some(remaining));
    }
}

/// Monotonic now that follows tokio's clock, so paused-time tests apply
fn monotonic_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn scheduler() -> (EventScheduler, TimerReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventScheduler::new(&TimingConfig::default(), tx), rx)
    }

    async fn no_more_events(rx: &mut TimerReceiver) -> bool {
        tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .is_err()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_triggers_yields_one_evaluation() {
        let (mut scheduler, mut rx) = scheduler();
        let start = Instant::now();

        for i in 0..5 {
            scheduler.trigger(&format!("event-{}", i), None);
            tokio::time::advance(Duration::from_millis(500)).await;
        }

        let event = rx.recv().await.unwrap();
        // Last trigger at 2s plus the 2s debounce
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        match event {
            TimerEvent::Evaluate { generation, source } => {
                assert_eq!(source, "event-4");
                assert!(scheduler.accept(generation));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(no_more_events(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn last_delay_override_wins() {
        let (mut scheduler, mut rx) = scheduler();
        let start = Instant::now();

        scheduler.trigger("manual", Some(Duration::ZERO));
        scheduler.trigger("system-woke", Some(Duration::from_secs(8)));

        let event = rx.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(8));
        assert!(matches!(event, TimerEvent::Evaluate { ref source, .. } if source == "system-woke"));
        assert!(no_more_events(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_rejected() {
        let (mut scheduler, mut rx) = scheduler();

        scheduler.trigger("first", Some(Duration::ZERO));
        let first = rx.recv().await.unwrap();
        scheduler.trigger("second", Some(Duration::from_secs(1)));

        let TimerEvent::Evaluate { generation, .. } = first else {
            panic!("expected evaluation");
        };
        assert!(!scheduler.accept(generation));
        assert!(scheduler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (mut scheduler, mut rx) = scheduler();

        assert!(!scheduler.cancel_pending());
        scheduler.trigger("power-changed", None);
        assert!(scheduler.cancel_pending());
        assert!(!scheduler.cancel_pending());
        assert!(no_more_events(&mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn action_gap_tracks_tokio_time() {
        let (mut scheduler, _rx) = scheduler();
        assert_eq!(scheduler.action_gap_remaining(), None);

        scheduler.record_action();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(scheduler.action_gap_remaining(), Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(scheduler.action_gap_remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn deferral_schedules_after_remaining_gap() {
        let (mut scheduler, mut rx) = scheduler();
        let start = Instant::now();

        scheduler.defer(Duration::from_secs(7));
        let event = rx.recv().await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert!(matches!(event, TimerEvent::Evaluate { ref source, .. } if source == ACTION_GAP_SOURCE));
    }
}
