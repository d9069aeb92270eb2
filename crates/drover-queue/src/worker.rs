//! Worker pool for processing jobs.
//!
//! Each pool owns a set of slot tasks for one queue. A slot loops
//! `claim → execute → route outcome` and sleeps with a capped exponential
//! backoff while the ready set is empty.

use crate::config::QueueConfig;
use crate::error::JobError;
use crate::job::{after, JobContext, JobRecord};
use crate::metrics::QueueMetrics;
use crate::promoter::PromoteSignal;
use crate::stats::QueueCounters;
use crate::store::{JobStore, Transition};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

/// Floor for the idle poll sleep so an empty queue never spins.
const MIN_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Application code run for every job of a queue.
///
/// Implemented for any `Fn(JobContext) -> impl Future<Output = Result<(), JobError>>`,
/// so plain async functions work directly:
///
/// ```rust,ignore
/// async fn send_email(ctx: JobContext) -> Result<(), JobError> {
///     let email: Email = ctx.json()?;
///     mailer.send(email).await?;
///     Ok(())
/// }
///
/// manager.register_queue("emails", QueueConfig::default(), send_email)?;
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Process one job. Any error (or a panic) counts as a failed attempt.
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        (self)(ctx).await
    }
}

/// State shared by every slot of a pool.
pub(crate) struct PoolShared {
    pub(crate) queue: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) config: QueueConfig,
    pub(crate) handler: Arc<dyn JobHandler>,
    pub(crate) counters: Arc<QueueCounters>,
    pub(crate) promote_signal: Arc<PromoteSignal>,
    pub(crate) shutdown: watch::Receiver<bool>,
    active: AtomicU64,
    concurrency: AtomicUsize,
}

impl PoolShared {
    pub(crate) fn new(
        queue: String,
        store: Arc<dyn JobStore>,
        config: QueueConfig,
        handler: Arc<dyn JobHandler>,
        counters: Arc<QueueCounters>,
        promote_signal: Arc<PromoteSignal>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            config,
            handler,
            counters,
            promote_signal,
            shutdown,
            active: AtomicU64::new(0),
            concurrency: AtomicUsize::new(0),
        }
    }

    fn publish_workers(&self) {
        QueueMetrics::update_workers(
            &self.queue,
            self.active.load(Ordering::Relaxed),
            self.concurrency.load(Ordering::Relaxed),
        );
    }
}

struct Slot {
    id: usize,
    retire: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Bounded set of concurrent slots serving one queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    slots: Mutex<Vec<Slot>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_slot: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `concurrency` slots on the current runtime.
    pub(crate) fn spawn(shared: Arc<PoolShared>, concurrency: usize) -> Self {
        let pool = Self {
            shared,
            slots: Mutex::new(Vec::with_capacity(concurrency)),
            retired: Mutex::new(Vec::new()),
            next_slot: AtomicUsize::new(0),
        };
        pool.resize(concurrency);

        info!(
            queue = %pool.shared.queue,
            concurrency,
            "Started worker pool"
        );
        pool
    }

    /// Current number of slots.
    pub fn concurrency(&self) -> usize {
        self.slots.lock().len()
    }

    /// Slots currently executing a handler.
    pub fn active(&self) -> u64 {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Grows or shrinks the pool to `target` slots.
    ///
    /// Retired slots finish the job they hold before exiting.
    pub(crate) fn resize(&self, target: usize) {
        let mut slots = self.slots.lock();
        let mut retired = self.retired.lock();
        retired.retain(|task| !task.is_finished());

        while slots.len() < target {
            let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
            let (retire, retire_rx) = watch::channel(false);
            let shared = Arc::clone(&self.shared);
            let span = tracing::info_span!("worker_slot", queue = %shared.queue, slot = id);
            let task = tokio::spawn(run_slot(shared, id, retire_rx).instrument(span));
            slots.push(Slot { id, retire, task });
        }

        while slots.len() > target {
            if let Some(slot) = slots.pop() {
                debug!(queue = %self.shared.queue, slot = slot.id, "Retiring worker slot");
                let _ = slot.retire.send(true);
                retired.push(slot.task);
            }
        }

        self.shared.concurrency.store(slots.len(), Ordering::Relaxed);
        self.shared.publish_workers();
    }

    /// Waits for every slot (including retired ones) to exit.
    ///
    /// The caller must have signalled shutdown. Slots still running at
    /// `deadline` are aborted and their jobs stay in flight until the lock
    /// expires. Returns how many slots were abandoned.
    pub(crate) async fn drain(&self, deadline: tokio::time::Instant) -> usize {
        let mut tasks: Vec<JoinHandle<()>> = self
            .slots
            .lock()
            .drain(..)
            .map(|slot| slot.task)
            .collect();
        tasks.append(&mut self.retired.lock());

        let drained = tokio::time::timeout_at(deadline, join_all(tasks.iter_mut()))
            .await
            .is_ok();

        self.shared.concurrency.store(0, Ordering::Relaxed);
        self.shared.publish_workers();

        if drained {
            return 0;
        }

        let abandoned = tasks.iter().filter(|task| !task.is_finished()).count();
        for task in &tasks {
            task.abort();
        }
        abandoned
    }
}

/// Next idle sleep: `min` after the first empty poll, doubling up to `max`.
fn next_idle_sleep(previous: Duration, min: Duration, max: Duration) -> Duration {
    let floor = min.max(MIN_IDLE_SLEEP);
    previous.saturating_mul(2).max(floor).min(max.max(floor))
}

async fn run_slot(shared: Arc<PoolShared>, slot: usize, mut retire: watch::Receiver<bool>) {
    let mut shutdown = shared.shutdown.clone();
    let mut idle = Duration::ZERO;

    debug!("Worker slot started");

    loop {
        if *shutdown.borrow() || *retire.borrow() {
            break;
        }

        let claimed = shared
            .store
            .claim_next(&shared.queue, shared.config.lock_ttl, Utc::now())
            .await;

        match claimed {
            Ok(Some(job)) => {
                idle = Duration::ZERO;
                execute(&shared, job, slot).await;
                continue;
            }
            Ok(None) => {
                idle = next_idle_sleep(
                    idle,
                    shared.config.poll_interval_min,
                    shared.config.poll_interval_max,
                );
            }
            Err(e) => {
                error!(error = %e, "Failed to claim job");
                shared.counters.record_store_error("claim_next");
                idle = shared.config.poll_interval_max.max(MIN_IDLE_SLEEP);
            }
        }

        let stop = tokio::select! {
            _ = tokio::time::sleep(idle) => false,
            changed = shutdown.changed() => changed.is_err(),
            changed = retire.changed() => changed.is_err(),
        };
        if stop {
            break;
        }
    }

    debug!("Worker slot stopped");
}

async fn execute(shared: &PoolShared, job: JobRecord, slot: usize) {
    let claimed_at = Utc::now();
    let wait_time = (claimed_at - job.scheduled_at).to_std().unwrap_or_default();
    shared.counters.record_claimed(wait_time);

    let Some(token) = job.lock_token.clone() else {
        error!(job_id = %job.id, "Claimed job has no lock token");
        return;
    };

    debug!(
        job_id = %job.id,
        priority = job.priority,
        attempt = job.attempt,
        "Executing job"
    );

    shared.active.fetch_add(1, Ordering::Relaxed);
    shared.publish_workers();

    let started = Instant::now();
    let outcome = run_handler(shared, job.to_context(slot)).await;
    let elapsed = started.elapsed();

    shared.active.fetch_sub(1, Ordering::Relaxed);
    shared.publish_workers();

    match outcome {
        Ok(()) => complete(shared, &job, &token, elapsed).await,
        Err(err) => fail(shared, &job, &token, &err, elapsed).await,
    }
}

/// Runs the handler on its own task under the job timeout.
///
/// On timeout the handler task is detached and left to finish on its own.
async fn run_handler(shared: &PoolShared, ctx: JobContext) -> Result<(), JobError> {
    let handler = Arc::clone(&shared.handler);
    let task = tokio::spawn(async move { handler.handle(ctx).await });

    match tokio::time::timeout(shared.config.job_timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            shared.counters.record_panicked();
            Err(join_error(join_err))
        }
        Err(_) => {
            shared.counters.record_timed_out();
            Err(JobError::Timeout(shared.config.job_timeout))
        }
    }
}

fn join_error(err: JoinError) -> JobError {
    if err.is_panic() {
        JobError::Panicked(panic_message(err.into_panic()))
    } else {
        JobError::ExecutionFailed("handler task was cancelled".to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn complete(shared: &PoolShared, job: &JobRecord, token: &str, elapsed: Duration) {
    match shared.store.complete(&shared.queue, &job.id, token).await {
        Ok(Transition::Applied) => {
            debug!(job_id = %job.id, duration_ms = elapsed.as_millis() as u64, "Job completed");
            shared.counters.record_completed(elapsed);
        }
        Ok(Transition::StaleLock) => {
            warn!(job_id = %job.id, "Lock token is stale, completion ignored");
            shared.counters.record_stale_lock("complete");
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to mark job as complete");
            shared.counters.record_store_error("complete");
        }
    }
}

async fn fail(shared: &PoolShared, job: &JobRecord, token: &str, err: &JobError, elapsed: Duration) {
    let message = err.to_string();
    let now = Utc::now();

    if job.is_final_attempt() {
        let result = shared
            .store
            .dead_letter(&shared.queue, &job.id, token, &message, now)
            .await;

        match result {
            Ok(Transition::Applied) => {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempt + 1,
                    error = %message,
                    "Job exhausted its attempts, moved to dead letters"
                );
                shared.counters.record_dead_lettered(elapsed);
            }
            Ok(Transition::StaleLock) => {
                warn!(job_id = %job.id, "Lock token is stale, dead-letter ignored");
                shared.counters.record_stale_lock("dead_letter");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
                shared.counters.record_store_error("dead_letter");
            }
        }
        return;
    }

    let delay = shared.config.retry.next_delay(job.attempt);
    let result = shared
        .store
        .fail_and_reschedule(&shared.queue, &job.id, token, delay, &message, now)
        .await;

    match result {
        Ok(Transition::Applied) => {
            debug!(
                job_id = %job.id,
                attempt = job.attempt + 1,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "Job failed, rescheduled"
            );
            shared.counters.record_retried(job.attempt + 1, elapsed);
            shared.promote_signal.wake_at(after(now, delay));
        }
        Ok(Transition::StaleLock) => {
            warn!(job_id = %job.id, "Lock token is stale, reschedule ignored");
            shared.counters.record_stale_lock("fail_and_reschedule");
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to reschedule job");
            shared.counters.record_store_error("fail_and_reschedule");
        }
    }
}
