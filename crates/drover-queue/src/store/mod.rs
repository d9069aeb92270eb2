//! Job store abstraction.
//!
//! A [`JobStore`] keeps four structures per named queue and moves jobs
//! between them atomically:
//!
//! ```text
//!   push ──► ready ◄──── promote_due ──── delayed ◄─┐
//!   (or      │  ▲                                    │
//!   delayed) │  └── reclaim_expired_locks ──┐        │ fail_and_reschedule
//!            ▼ claim_next                   │        │
//!         in-flight ────────────────────────┴────────┤
//!            │ complete (removed)                    │ dead_letter
//!            ▼                                       ▼
//!                                               dead letters
//! ```
//!
//! A job is in exactly one structure at a time. Transitions out of
//! in-flight require the lock token handed out by `claim_next`; a stale
//! token yields [`Transition::StaleLock`] and changes nothing.

mod memory;
mod redis;
mod retrying;

pub use self::redis::{create_pool, RedisJobStore, RedisKeys};
pub use memory::MemoryJobStore;
pub use retrying::RetryingStore;

use crate::error::StoreResult;
use crate::job::{JobId, JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Outcome of a token-guarded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The token matched and the job moved.
    Applied,
    /// The claim was reclaimed or already finished; nothing changed.
    StaleLock,
}

impl Transition {
    /// Returns true if the transition was applied.
    pub fn is_applied(self) -> bool {
        self == Transition::Applied
    }
}

/// Current sizes of a queue's structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    /// Jobs waiting in the ready set.
    pub ready: u64,
    /// Jobs waiting for their due time.
    pub delayed: u64,
    /// Claimed jobs.
    pub in_flight: u64,
    /// Jobs in the dead-letter list.
    pub dead_lettered: u64,
}

/// Durable, atomic storage of job state transitions.
///
/// Every method takes `now` explicitly so callers (and tests) control the
/// clock.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a job, into the ready set when `scheduled_at <= now` and into
    /// the delayed set otherwise. Assigns the push sequence number. Pushing
    /// an ID the store already holds returns its status and changes nothing.
    async fn push(&self, job: JobRecord, now: DateTime<Utc>) -> StoreResult<JobStatus>;

    /// Pops the highest-priority, earliest-scheduled ready job and locks it
    /// for `lock_ttl` under a fresh token.
    async fn claim_next(
        &self,
        queue: &str,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JobRecord>>;

    /// Removes a claimed job permanently.
    async fn complete(&self, queue: &str, id: &JobId, token: &str) -> StoreResult<Transition>;

    /// Increments `attempt` and moves a claimed job to the delayed set at
    /// `now + delay`.
    async fn fail_and_reschedule(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        delay: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition>;

    /// Increments `attempt` and moves a claimed job to the dead-letter list.
    async fn dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition>;

    /// Moves up to `limit` delayed jobs due at `now` into the ready set.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>, limit: usize) -> StoreResult<u64>;

    /// Returns in-flight jobs whose lock expired to the ready set with
    /// `attempt` unchanged.
    async fn reclaim_expired_locks(&self, queue: &str, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Current structure sizes.
    async fn depths(&self, queue: &str) -> StoreResult<QueueDepths>;

    /// Looks up a job that has not completed.
    async fn get_job(&self, queue: &str, id: &JobId) -> StoreResult<Option<JobRecord>>;

    /// Dead-lettered jobs, oldest first.
    async fn list_dead_letters(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>>;

    /// Moves a dead-lettered job back to the ready set with a fresh attempt
    /// budget. Returns false if the job is not in the dead-letter list.
    async fn requeue_dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Deletes every dead-lettered job of a queue.
    async fn purge_dead_letters(&self, queue: &str) -> StoreResult<u64>;

    /// Checks the backend is reachable.
    async fn health_check(&self) -> StoreResult<()>;
}
