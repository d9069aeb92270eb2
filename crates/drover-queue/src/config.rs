//! Per-queue runtime configuration.

use crate::error::{QueueError, QueueResult};
use crate::retry::RetryPolicy;
use drover_config::QueueSettings;
use std::time::Duration;

const MIN_RECLAIM_INTERVAL: Duration = Duration::from_millis(50);
const MAX_RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration of one named queue.
///
/// Fixed once the queue is registered, except `concurrency`, which
/// [`QueueManager::adjust_concurrency`](crate::QueueManager::adjust_concurrency)
/// changes at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Worker slots.
    pub concurrency: usize,

    /// Number of priority tiers; valid priorities are `0..priority_levels`.
    pub priority_levels: u8,

    /// How long a claim is honored before reclaim.
    pub lock_ttl: Duration,

    /// Handler deadline.
    pub job_timeout: Duration,

    /// Retry policy.
    pub retry: RetryPolicy,

    /// Idle poll interval after the first empty claim.
    pub poll_interval_min: Duration,

    /// Idle poll interval ceiling.
    pub poll_interval_max: Duration,

    /// Promoter backoff ceiling.
    pub promoter_max_interval: Duration,

    /// Jobs moved per promoter round trip.
    pub promote_batch: usize,

    /// Lock reclaim period; derived from `lock_ttl` when `None`.
    pub reclaim_interval: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            concurrency: settings.concurrency,
            priority_levels: settings.priority_levels,
            lock_ttl: Duration::from_millis(settings.lock_ttl_ms),
            job_timeout: Duration::from_millis(settings.job_timeout_ms),
            retry: RetryPolicy {
                max_attempts: settings.max_attempts,
                base_delay: Duration::from_millis(settings.base_delay_ms),
                multiplier: settings.multiplier,
                max_delay: Duration::from_millis(settings.max_delay_ms),
                jitter: settings.jitter,
            },
            poll_interval_min: Duration::from_millis(settings.poll_interval_min_ms),
            poll_interval_max: Duration::from_millis(settings.poll_interval_max_ms),
            promoter_max_interval: Duration::from_millis(settings.promoter_max_interval_ms),
            promote_batch: 500,
            reclaim_interval: settings.reclaim_interval_ms.map(Duration::from_millis),
        }
    }
}

impl QueueConfig {
    /// Sets the worker slot count.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the number of priority tiers.
    pub fn with_priority_levels(mut self, levels: u8) -> Self {
        self.priority_levels = levels;
        self
    }

    /// Sets the lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Sets the handler deadline.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the idle poll bounds.
    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.poll_interval_min = min;
        self.poll_interval_max = max;
        self
    }

    /// Sets the promoter backoff ceiling.
    pub fn with_promoter_max_interval(mut self, interval: Duration) -> Self {
        self.promoter_max_interval = interval;
        self
    }

    /// Sets an explicit lock reclaim period.
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = Some(interval);
        self
    }

    /// Priority used when a producer does not pick one: the middle tier.
    pub fn default_priority(&self) -> u8 {
        self.priority_levels.saturating_sub(1) / 2
    }

    /// Effective lock reclaim period.
    ///
    /// Defaults to half the lock TTL, clamped to 50ms..=30s.
    pub fn reclaim_interval(&self) -> Duration {
        self.reclaim_interval
            .unwrap_or_else(|| (self.lock_ttl / 2).clamp(MIN_RECLAIM_INTERVAL, MAX_RECLAIM_INTERVAL))
    }

    /// Checks the configuration is usable.
    pub fn validate(&self) -> QueueResult<()> {
        let problem = if self.concurrency == 0 {
            Some("concurrency must be at least 1".to_string())
        } else if self.priority_levels == 0 {
            Some("priority_levels must be at least 1".to_string())
        } else if self.retry.max_attempts == 0 {
            Some("max_attempts must be at least 1".to_string())
        } else if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            Some(format!("multiplier {} must be >= 1.0", self.retry.multiplier))
        } else if self.retry.base_delay > self.retry.max_delay {
            Some("base delay cannot exceed max delay".to_string())
        } else if self.job_timeout.is_zero() || self.lock_ttl.is_zero() {
            Some("lock_ttl and job_timeout must be positive".to_string())
        } else if self.lock_ttl <= self.job_timeout {
            Some(format!(
                "lock_ttl {:?} must be greater than job_timeout {:?}",
                self.lock_ttl, self.job_timeout
            ))
        } else if self.poll_interval_min > self.poll_interval_max {
            Some("poll_interval_min cannot exceed poll_interval_max".to_string())
        } else if self.promoter_max_interval.is_zero() || self.promote_batch == 0 {
            Some("promoter interval and batch must be positive".to_string())
        } else if self.reclaim_interval.is_some_and(|interval| interval.is_zero()) {
            Some("reclaim_interval must be positive".to_string())
        } else {
            None
        };

        match problem {
            Some(msg) => Err(QueueError::InvalidConfig(msg)),
            None => Ok(()),
        }
    }
}

/// Checks a queue name can be used in store keys.
pub fn validate_queue_name(name: &str) -> QueueResult<()> {
    if name.is_empty() {
        return Err(QueueError::InvalidConfig("queue name cannot be empty".to_string()));
    }
    if name.contains([':', '{', '}']) {
        return Err(QueueError::InvalidConfig(format!(
            "queue name '{}' must not contain ':', '{{' or '}}'",
            name
        )));
    }
    Ok(())
}
