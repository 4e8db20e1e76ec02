//! Minimum-gap action throttling

use std::time::{Duration, Instant};

/// Enforces a minimum gap between consecutive physical actions.
///
/// Unlike a token bucket there is no burst allowance: once an action has
/// been recorded, the next one is refused until `min_gap` has elapsed.
#[derive(Debug, Clone)]
pub struct ActionThrottle {
    min_gap: Duration,
    last_action: Option<Instant>,
}

impl ActionThrottle {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_action: None,
        }
    }

    pub fn set_min_gap(&mut self, min_gap: Duration) {
        self.min_gap = min_gap;
    }

    /// Time that still has to pass before an action is allowed.
    ///
    /// Returns `None` if an action may run at `now`.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_action?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.min_gap {
            None
        } else {
            Some(self.min_gap - elapsed)
        }
    }

    /// Record that an action ran at `now`.
    pub fn record(&mut self, now: Instant) {
        self.last_action = Some(now);
    }
}
