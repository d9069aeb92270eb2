//! Delayed-job promotion loop.

use crate::stats::QueueCounters;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error};

/// Interval right after jobs were moved or a wake-up arrived.
const MIN_PROMOTE_INTERVAL: Duration = Duration::from_millis(10);

/// Wake-up hint for a queue's promoter.
///
/// Producers and worker slots in this process report when a delayed job
/// they wrote becomes due, so the promoter does not have to wait out its
/// idle backoff. Only the earliest pending due time is kept; jobs written by
/// other processes are found by the regular backoff polling.
#[derive(Debug, Default)]
pub(crate) struct PromoteSignal {
    next_due: Mutex<Option<DateTime<Utc>>>,
    notify: Notify,
}

impl PromoteSignal {
    /// Creates a signal with no pending hint.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records that a delayed job becomes due at `at`.
    pub(crate) fn wake_at(&self, at: DateTime<Utc>) {
        {
            let mut next_due = self.next_due.lock();
            if next_due.is_some_and(|current| current <= at) {
                return;
            }
            *next_due = Some(at);
        }
        self.notify.notify_one();
    }

    /// How long to sleep after a promotion pass at `now`, given the idle
    /// backoff `interval`. Hints that are already due are consumed.
    fn sleep_for(&self, now: DateTime<Utc>, interval: Duration) -> Duration {
        let mut next_due = self.next_due.lock();
        match *next_due {
            Some(due) if due <= now => {
                *next_due = None;
                interval
            }
            Some(due) => (due - now)
                .to_std()
                .map_or(interval, |until| until.min(interval)),
            None => interval,
        }
    }
}

/// Moves due delayed jobs of one queue into the ready set until shutdown.
pub(crate) struct Promoter {
    pub(crate) queue: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) counters: Arc<QueueCounters>,
    pub(crate) signal: Arc<PromoteSignal>,
    pub(crate) max_interval: Duration,
    pub(crate) batch: usize,
}

impl Promoter {
    /// Runs the loop. Polls again immediately after moving jobs, otherwise
    /// doubles the sleep up to `max_interval`.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let floor = MIN_PROMOTE_INTERVAL.min(self.max_interval);
        let mut interval = floor;

        debug!(queue = %self.queue, "Promoter started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            match self.store.promote_due(&self.queue, now, self.batch).await {
                Ok(0) => {
                    interval = interval.saturating_mul(2).min(self.max_interval);
                }
                Ok(moved) => {
                    self.counters.record_promoted(moved);
                    interval = floor;
                    continue;
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Failed to promote delayed jobs");
                    self.counters.record_store_error("promote_due");
                    interval = self.max_interval;
                }
            }

            let sleep = self.signal.sleep_for(now, interval);
            let stop = tokio::select! {
                _ = tokio::time::sleep(sleep) => false,
                _ = self.signal.notify.notified() => {
                    interval = floor;
                    false
                }
                changed = shutdown.changed() => changed.is_err(),
            };
            if stop {
                break;
            }
        }

        debug!(queue = %self.queue, "Promoter stopped");
    }
}
