//! Retry policies for failed jobs.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relative spread applied to retry delays when jitter is enabled (±20%).
pub const JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff policy for a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed before a job is dead-lettered.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Delay cap.
    pub max_delay: Duration,

    /// Spread delays by ±[`JITTER_FACTOR`].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5)
    }
}

impl RetryPolicy {
    /// Creates an exponential backoff policy: 1s base, doubling, capped at one hour.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            jitter: true,
        }
    }

    /// Creates a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// `min(base * multiplier^attempt, max)`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        // `as` saturates and maps NaN to zero
        Duration::from_millis(capped as u64)
    }

    /// Delay before the retry that follows a failure at `attempt`.
    ///
    /// With jitter enabled the result is spread by ±20% and never exceeds
    /// `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let factor = rand::rng().random_range((1.0 - JITTER_FACTOR)..=(1.0 + JITTER_FACTOR));
        let jittered = Duration::from_millis((delay.as_millis() as f64 * factor) as u64);
        jittered.min(self.max_delay)
    }

    /// Returns true once `attempt` executions have used up the budget.
    pub fn is_terminal(&self, attempt: u32) -> bool {
        is_terminal(attempt, self.max_attempts)
    }
}

/// `attempt >= max_attempts`.
pub fn is_terminal(attempt: u32, max_attempts: u32) -> bool {
    attempt >= max_attempts
}
