//! Transient-error retry around any store.

use super::{JobStore, QueueDepths, Transition};
use crate::error::{StoreError, StoreResult};
use crate::job::{JobId, JobRecord, JobStatus};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps a [`JobStore`] and retries operations that fail with a transient
/// error, with exponential backoff bounded by a total elapsed time.
///
/// Permanent errors and the final transient error are returned unchanged.
///
/// A retried `complete` may find its own earlier call already applied with
/// only the reply lost. When the retry reports [`Transition::StaleLock`] and
/// the job is gone from the store, the completion is reported as applied.
pub struct RetryingStore<S> {
    inner: S,
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed: Duration,
}

impl<S: JobStore> RetryingStore<S> {
    /// Wraps `inner`, giving up after `max_elapsed`.
    pub fn new(inner: S, max_elapsed: Duration) -> Self {
        Self {
            inner,
            initial_interval: Duration::from_millis(25),
            max_interval: Duration::from_secs(1),
            max_elapsed,
        }
    }

    /// Overrides the backoff interval bounds.
    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn policy(&self) -> ExponentialBackoff {
        let mut policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();
        policy.reset();
        policy
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        backoff::future::retry_notify(
            self.policy(),
            || {
                let fut = op();
                async move {
                    fut.await.map_err(|e| {
                        if e.is_transient() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |err: StoreError, wait: Duration| {
                warn!(operation, error = %err, retry_in = ?wait, "Transient store error, retrying");
            },
        )
        .await
    }
}

#[async_trait]
impl<S: JobStore> JobStore for RetryingStore<S> {
    async fn push(&self, job: JobRecord, now: DateTime<Utc>) -> StoreResult<JobStatus> {
        self.retry("push", || self.inner.push(job.clone(), now)).await
    }

    async fn claim_next(
        &self,
        queue: &str,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JobRecord>> {
        self.retry("claim_next", || self.inner.claim_next(queue, lock_ttl, now))
            .await
    }

    async fn complete(&self, queue: &str, id: &JobId, token: &str) -> StoreResult<Transition> {
        let calls = AtomicU32::new(0);
        let outcome = self
            .retry("complete", || {
                calls.fetch_add(1, Ordering::Relaxed);
                self.inner.complete(queue, id, token)
            })
            .await?;

        if outcome == Transition::StaleLock
            && calls.load(Ordering::Relaxed) > 1
            && matches!(self.inner.get_job(queue, id).await, Ok(None))
        {
            debug!(queue, job_id = %id, "Completion landed before a lost reply");
            return Ok(Transition::Applied);
        }
        Ok(outcome)
    }

    async fn fail_and_reschedule(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        delay: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        self.retry("fail_and_reschedule", || {
            self.inner
                .fail_and_reschedule(queue, id, token, delay, error, now)
        })
        .await
    }

    async fn dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        self.retry("dead_letter", || self.inner.dead_letter(queue, id, token, error, now))
            .await
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>, limit: usize) -> StoreResult<u64> {
        self.retry("promote_due", || self.inner.promote_due(queue, now, limit))
            .await
    }

    async fn reclaim_expired_locks(&self, queue: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        self.retry("reclaim_expired_locks", || {
            self.inner.reclaim_expired_locks(queue, now)
        })
        .await
    }

    async fn depths(&self, queue: &str) -> StoreResult<QueueDepths> {
        self.retry("depths", || self.inner.depths(queue)).await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> StoreResult<Option<JobRecord>> {
        self.retry("get_job", || self.inner.get_job(queue, id)).await
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        self.retry("list_dead_letters", || {
            self.inner.list_dead_letters(queue, offset, limit)
        })
        .await
    }

    async fn requeue_dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.retry("requeue_dead_letter", || {
            self.inner.requeue_dead_letter(queue, id, max_attempts, now)
        })
        .await
    }

    async fn purge_dead_letters(&self, queue: &str) -> StoreResult<u64> {
        self.retry("purge_dead_letters", || self.inner.purge_dead_letters(queue))
            .await
    }

    async fn health_check(&self) -> StoreResult<()> {
        // A failed ping is reported as-is.
        self.inner.health_check().await
    }
}
