use std::time::Duration;
use tokio::time::Instant;

use crate::constants::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS};

/// Exponential backoff with widening jitter.
///
/// The un-jittered delay is `base * 2^(attempt - 1)` capped at `max`. Jitter is then
/// drawn uniformly from `[delay, 2 * delay)`, so a jittered delay is never shorter than
/// the capped delay and never reaches twice the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn from_millis(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(base_delay_ms),
            Duration::from_millis(max_delay_ms),
        )
    }

    /// Deterministic part of the delay, before jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(capped_delay_ms(
            attempt,
            millis(self.base_delay),
            millis(self.max_delay),
        ))
    }

    pub fn compute_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_delay(
            attempt,
            millis(self.base_delay),
            millis(self.max_delay),
        ))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_millis(DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn capped_delay_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponent = attempt.max(1) - 1;
    let multiplier = 2u64.saturating_pow(exponent);
    base_delay_ms.saturating_mul(multiplier).min(max_delay_ms)
}

/// Retry delay in milliseconds for a 1-based `attempt`. Attempt 0 is treated as 1.
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let delay = capped_delay_ms(attempt, base_delay_ms, max_delay_ms);
    if delay == 0 {
        return 0;
    }
    fastrand::u64(delay..delay.saturating_mul(2))
}

/// Coalesces bursts of calls into one invocation after `wait` of quiet, but never lets a
/// burst run longer than `max_wait` before forcing an invocation on the next tick.
#[derive(Debug, Clone)]
pub struct Debouncer {
    wait: Duration,
    max_wait: Option<Duration>,
    burst_started: Option<Instant>,
}

impl Debouncer {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            max_wait: None,
            burst_started: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Registers a call at `now` and returns how long to wait before invoking.
    pub fn call(&mut self, now: Instant) -> Duration {
        let started = *self.burst_started.get_or_insert(now);
        match self.max_wait {
            Some(max_wait) => {
                let remaining = max_wait.saturating_sub(now.saturating_duration_since(started));
                self.wait.min(remaining)
            }
            None => self.wait,
        }
    }

    /// Marks the pending invocation as done; the next call opens a new burst.
    pub fn fire(&mut self) {
        self.burst_started = None;
    }

    pub fn is_pending(&self) -> bool {
        self.burst_started.is_some()
    }
}
