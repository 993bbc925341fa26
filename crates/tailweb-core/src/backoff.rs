//! Capped exponential backoff for fault retries.
//!
//! The watcher uses this while a file is missing or unreadable. No jitter:
//! each file has its own schedule and there is no thundering herd to break up.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Compute `min(max, base * 2^attempt)`.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(31);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

// ─────────────────────────────────────────────────────────────────────────────
// Stateful schedule
// ─────────────────────────────────────────────────────────────────────────────

/// Retry schedule: 1s, 2s, 4s, ... capped at 30s by default.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Schedule starting at `base` and capped at `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next retry. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = calculate_backoff_delay(self.attempt, self.base, self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the first delay, after a successful recovery.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
