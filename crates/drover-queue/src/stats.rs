//! Per-queue counters and point-in-time snapshots.

use crate::metrics::{JobMetrics, QueueMetrics};
use crate::store::QueueDepths;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Monotonic transition counters of one queue in this process.
///
/// Every `record_*` call also forwards to the `metrics` facade.
#[derive(Debug)]
pub struct QueueCounters {
    queue: String,
    enqueued: AtomicU64,
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    timed_out: AtomicU64,
    reclaimed: AtomicU64,
    promoted: AtomicU64,
    stale_locks: AtomicU64,
}

impl QueueCounters {
    fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            enqueued: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            promoted: AtomicU64::new(0),
            stale_locks: AtomicU64::new(0),
        }
    }

    /// Queue these counters belong to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn record_enqueued(&self, priority: u8) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_enqueued(&self.queue, priority);
    }

    pub fn record_claimed(&self, wait_time: Duration) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_claimed(&self.queue, wait_time);
    }

    pub fn record_completed(&self, duration: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_completed(&self.queue, duration);
    }

    pub fn record_retried(&self, attempt: u32, duration: Duration) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_retried(&self.queue, attempt, duration);
    }

    pub fn record_dead_lettered(&self, duration: Duration) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_dead_lettered(&self.queue, duration);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_timed_out(&self.queue);
    }

    pub fn record_panicked(&self) {
        JobMetrics::job_panicked(&self.queue);
    }

    pub fn record_reclaimed(&self, count: u64) {
        self.reclaimed.fetch_add(count, Ordering::Relaxed);
        JobMetrics::jobs_reclaimed(&self.queue, count);
    }

    pub fn record_promoted(&self, count: u64) {
        self.promoted.fetch_add(count, Ordering::Relaxed);
        JobMetrics::jobs_promoted(&self.queue, count);
    }

    pub fn record_stale_lock(&self, operation: &'static str) {
        self.stale_locks.fetch_add(1, Ordering::Relaxed);
        JobMetrics::stale_lock(&self.queue, operation);
    }

    pub fn record_store_error(&self, operation: &'static str) {
        JobMetrics::store_error(&self.queue, operation);
    }

    /// Combines the counters with a depth reading from the store.
    pub fn snapshot(&self, depths: QueueDepths, concurrency: usize) -> QueueStats {
        QueueMetrics::update_depths(&self.queue, &depths);

        let dead_lettered_total = self.dead_lettered.load(Ordering::Relaxed);
        QueueStats {
            queue: self.queue.clone(),
            ready: depths.ready,
            delayed: depths.delayed,
            in_flight: depths.in_flight,
            dead_lettered: depths.dead_lettered,
            concurrency,
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            claimed_total: self.claimed.load(Ordering::Relaxed),
            completed_total: self.completed.load(Ordering::Relaxed),
            failed_total: dead_lettered_total,
            retried_total: self.retried.load(Ordering::Relaxed),
            dead_lettered_total,
            timed_out_total: self.timed_out.load(Ordering::Relaxed),
            reclaimed_total: self.reclaimed.load(Ordering::Relaxed),
            promoted_total: self.promoted.load(Ordering::Relaxed),
            stale_locks_total: self.stale_locks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a queue.
///
/// Gauges (`ready`, `delayed`, `in_flight`, `dead_lettered`) are read from
/// the store and are shared by every process. `*_total` counters cover
/// transitions observed by this process since it started. Fields are read
/// independently; no snapshot isolation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Queue name.
    pub queue: String,
    /// Jobs waiting in the ready set.
    pub ready: u64,
    /// Jobs waiting for their due time.
    pub delayed: u64,
    /// Claimed jobs.
    pub in_flight: u64,
    /// Jobs currently in the dead-letter list.
    pub dead_lettered: u64,
    /// Current worker slots.
    pub concurrency: usize,
    /// Jobs enqueued.
    pub enqueued_total: u64,
    /// Claims handed to worker slots.
    pub claimed_total: u64,
    /// Jobs completed successfully.
    pub completed_total: u64,
    /// Jobs that failed terminally.
    ///
    /// A terminal failure always dead-letters the job, so this equals
    /// `dead_lettered_total`. Failures that were retried are counted in
    /// `retried_total` instead.
    pub failed_total: u64,
    /// Failed executions that were rescheduled.
    pub retried_total: u64,
    /// Jobs moved to the dead-letter list.
    pub dead_lettered_total: u64,
    /// Executions that hit the handler deadline.
    pub timed_out_total: u64,
    /// Expired claims returned to ready.
    pub reclaimed_total: u64,
    /// Delayed jobs moved to ready.
    pub promoted_total: u64,
    /// Transitions refused for a stale lock token.
    pub stale_locks_total: u64,
}

/// Registry of per-queue counters.
#[derive(Debug, Default)]
pub struct StatsCollector {
    queues: RwLock<HashMap<String, Arc<QueueCounters>>>,
}

impl StatsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters of `queue`, creating them on first use.
    pub fn for_queue(&self, queue: &str) -> Arc<QueueCounters> {
        if let Some(counters) = self.queues.read().get(queue) {
            return Arc::clone(counters);
        }
        Arc::clone(
            self.queues
                .write()
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(QueueCounters::new(queue))),
        )
    }

    /// Names of queues with counters.
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }
}
