//! Queue manager: registry of named queues and the public API.

use crate::config::{validate_queue_name, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::job::{after, JobId, JobRecord, JobStatus};
use crate::promoter::{PromoteSignal, Promoter};
use crate::reclaimer::Reclaimer;
use crate::stats::{QueueCounters, QueueStats, StatsCollector};
use crate::store::JobStore;
use crate::worker::{JobHandler, PoolShared, WorkerPool};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Upper bound on worker slots per queue.
pub const MAX_CONCURRENCY: usize = 1024;

/// Options for [`QueueManager::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Priority tier; the queue's middle tier when `None`.
    pub priority: Option<u8>,
    /// Run no earlier than this long from now.
    pub delay: Option<Duration>,
    /// Run no earlier than this instant. Takes precedence over `delay`.
    pub at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    /// Options for an immediate job at the default priority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority tier.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Delays the job.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Schedules the job at a point in time.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    fn scheduled_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.at, self.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => after(now, delay),
            (None, None) => now,
        }
    }
}

/// Outcome of [`QueueManager::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every slot exited before the drain timeout.
    pub drained: bool,
    /// Slots still executing a handler when the timeout elapsed.
    pub abandoned_slots: usize,
    /// Time spent stopping.
    pub elapsed: Duration,
}

struct QueueRuntime {
    pool: WorkerPool,
    background: Vec<JoinHandle<()>>,
}

struct QueueState {
    concurrency: usize,
    runtime: Option<QueueRuntime>,
}

struct QueueEntry {
    name: String,
    config: QueueConfig,
    handler: Arc<dyn JobHandler>,
    counters: Arc<QueueCounters>,
    promote_signal: Arc<PromoteSignal>,
    state: Mutex<QueueState>,
}

impl QueueEntry {
    fn start(&self, store: &Arc<dyn JobStore>, shutdown: &watch::Receiver<bool>) {
        let mut state = self.state.lock();
        if state.runtime.is_some() {
            return;
        }

        let shared = Arc::new(PoolShared::new(
            self.name.clone(),
            Arc::clone(store),
            self.config.clone(),
            Arc::clone(&self.handler),
            Arc::clone(&self.counters),
            Arc::clone(&self.promote_signal),
            shutdown.clone(),
        ));
        let pool = WorkerPool::spawn(shared, state.concurrency);

        let promoter = Promoter {
            queue: self.name.clone(),
            store: Arc::clone(store),
            counters: Arc::clone(&self.counters),
            signal: Arc::clone(&self.promote_signal),
            max_interval: self.config.promoter_max_interval,
            batch: self.config.promote_batch,
        };
        let reclaimer = Reclaimer {
            queue: self.name.clone(),
            store: Arc::clone(store),
            counters: Arc::clone(&self.counters),
            period: self.config.reclaim_interval(),
        };

        let background = vec![
            tokio::spawn(
                promoter
                    .run(shutdown.clone())
                    .instrument(tracing::info_span!("promoter", queue = %self.name)),
            ),
            tokio::spawn(
                reclaimer
                    .run(shutdown.clone())
                    .instrument(tracing::info_span!("reclaimer", queue = %self.name)),
            ),
        ];

        state.runtime = Some(QueueRuntime { pool, background });
    }
}

/// Owns every registered queue and its worker pool, promoter and reclaimer.
///
/// Constructed explicitly by the composition root and shared by `Arc`.
///
/// ```rust,ignore
/// let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
/// let manager = QueueManager::new(store);
///
/// manager.register_queue("emails", QueueConfig::default(), send_email)?;
/// manager.start().await?;
///
/// let id = manager
///     .enqueue("emails", payload, EnqueueOptions::new().priority(0))
///     .await?;
///
/// let report = manager.stop(Duration::from_secs(30)).await;
/// ```
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    stats: StatsCollector,
    queues: RwLock<HashMap<String, Arc<QueueEntry>>>,
    /// Shutdown sender while running. Lock before `queues`.
    lifecycle: Mutex<Option<watch::Sender<bool>>>,
}

impl QueueManager {
    /// Creates a manager over `store` with no queues.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            stats: StatsCollector::new(),
            queues: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(None),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Registers a queue and its handler.
    ///
    /// Registering the same name again with an equal configuration is a
    /// no-op (the first handler stays); a different configuration fails with
    /// [`QueueError::QueueAlreadyRegistered`]. A queue registered while the
    /// manager runs starts immediately.
    pub fn register_queue(
        &self,
        name: impl Into<String>,
        config: QueueConfig,
        handler: impl JobHandler,
    ) -> QueueResult<()> {
        let name = name.into();
        validate_queue_name(&name)?;
        config.validate()?;

        let lifecycle = self.lifecycle.lock();
        let mut queues = self.queues.write();

        if let Some(existing) = queues.get(&name) {
            if existing.config == config {
                debug!(queue = %name, "Queue already registered with the same configuration");
                return Ok(());
            }
            return Err(QueueError::QueueAlreadyRegistered(name));
        }

        let entry = Arc::new(QueueEntry {
            name: name.clone(),
            counters: self.stats.for_queue(&name),
            promote_signal: Arc::new(PromoteSignal::new()),
            handler: Arc::new(handler),
            state: Mutex::new(QueueState {
                concurrency: config.concurrency,
                runtime: None,
            }),
            config,
        });

        if let Some(shutdown) = lifecycle.as_ref() {
            entry.start(&self.store, &shutdown.subscribe());
        }

        info!(
            queue = %name,
            concurrency = entry.config.concurrency,
            priority_levels = entry.config.priority_levels,
            max_attempts = entry.config.retry.max_attempts,
            "Registered queue"
        );
        queues.insert(name, entry);
        Ok(())
    }

    /// Names of registered queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().is_some()
    }

    fn entry(&self, queue: &str) -> QueueResult<Arc<QueueEntry>> {
        self.queues
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    /// Adds a job to a queue and returns its ID.
    ///
    /// Fails with [`QueueError::UnknownQueue`] or
    /// [`QueueError::InvalidPriority`] without touching the store.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: impl Into<Vec<u8>>,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let entry = self.entry(queue)?;
        let levels = entry.config.priority_levels;
        let priority = options
            .priority
            .unwrap_or_else(|| entry.config.default_priority());
        if priority >= levels {
            return Err(QueueError::InvalidPriority {
                queue: queue.to_string(),
                priority,
                levels,
            });
        }

        let now = Utc::now();
        let scheduled_at = options.scheduled_at(now);
        let job = JobRecord::new(
            queue,
            payload.into(),
            priority,
            entry.config.retry.max_attempts,
            scheduled_at,
            now,
        );
        let id = job.id.clone();

        let status = self.store.push(job, now).await?;
        entry.counters.record_enqueued(priority);
        if status == JobStatus::Delayed {
            entry.promote_signal.wake_at(scheduled_at);
        }

        debug!(queue, job_id = %id, priority, status = %status, "Enqueued job");
        Ok(id)
    }

    /// Serializes `payload` as JSON and enqueues it.
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let bytes = serde_json::to_vec(payload)?;
        self.enqueue(queue, bytes, options).await
    }

    /// Starts the worker pool, promoter and reclaimer of every queue.
    ///
    /// Checks the store is reachable first.
    pub async fn start(&self) -> QueueResult<()> {
        if self.is_running() {
            return Err(QueueError::AlreadyRunning);
        }
        self.store.health_check().await?;

        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let queues = self.queues.read();
        for entry in queues.values() {
            entry.start(&self.store, &shutdown_rx);
        }
        *lifecycle = Some(shutdown);

        info!(queues = queues.len(), "Queue manager started");
        Ok(())
    }

    /// Signals every slot and loop to stop, then waits up to `drain_timeout`
    /// for running handlers to finish.
    ///
    /// Slots still busy when the timeout elapses are abandoned; their jobs
    /// stay in flight and are reclaimed once the lock expires. That case is
    /// logged as a warning and reported, not returned as an error.
    pub async fn stop(&self, drain_timeout: Duration) -> ShutdownReport {
        let started = Instant::now();

        let Some(shutdown) = self.lifecycle.lock().take() else {
            return ShutdownReport {
                drained: true,
                abandoned_slots: 0,
                elapsed: started.elapsed(),
            };
        };

        info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "Stopping queue manager");
        let _ = shutdown.send(true);

        let runtimes: Vec<(String, QueueRuntime)> = self
            .queues
            .read()
            .values()
            .filter_map(|entry| {
                entry
                    .state
                    .lock()
                    .runtime
                    .take()
                    .map(|runtime| (entry.name.clone(), runtime))
            })
            .collect();

        let deadline = tokio::time::Instant::now() + drain_timeout;
        let mut abandoned_slots = 0;

        for (queue, runtime) in runtimes {
            let abandoned = runtime.pool.drain(deadline).await;
            if abandoned > 0 {
                warn!(queue = %queue, abandoned, "Worker slots still busy at drain timeout");
            }
            abandoned_slots += abandoned;

            for mut task in runtime.background {
                if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }

        let report = ShutdownReport {
            drained: abandoned_slots == 0,
            abandoned_slots,
            elapsed: started.elapsed(),
        };

        if report.drained {
            info!(elapsed_ms = report.elapsed.as_millis() as u64, "Queue manager stopped");
        } else {
            warn!(
                abandoned_slots,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Drain timeout exceeded; in-flight jobs will be reclaimed after their lock expires"
            );
        }
        report
    }

    /// Point-in-time statistics of one queue.
    pub async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let entry = self.entry(queue)?;
        let depths = self.store.depths(queue).await?;
        let concurrency = entry.state.lock().concurrency;
        Ok(entry.counters.snapshot(depths, concurrency))
    }

    /// Statistics of every registered queue, sorted by name.
    pub async fn all_stats(&self) -> QueueResult<Vec<QueueStats>> {
        let mut all = Vec::new();
        for name in self.queue_names() {
            all.push(self.stats(&name).await?);
        }
        Ok(all)
    }

    /// Changes a queue's worker slot count by `delta` and returns the new
    /// count, clamped to `1..=MAX_CONCURRENCY`.
    ///
    /// Removed slots finish their current job first.
    pub fn adjust_concurrency(&self, queue: &str, delta: i64) -> QueueResult<usize> {
        let entry = self.entry(queue)?;
        let mut state = entry.state.lock();

        let previous = state.concurrency;
        let target = apply_delta(previous, delta);
        state.concurrency = target;
        if let Some(runtime) = state.runtime.as_ref() {
            runtime.pool.resize(target);
        }

        if target != previous {
            info!(queue, previous, concurrency = target, "Adjusted concurrency");
        }
        Ok(target)
    }

    /// Looks up a job that has not completed.
    pub async fn job(&self, queue: &str, id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.entry(queue)?;
        Ok(self.store.get_job(queue, id).await?)
    }

    /// Dead-lettered jobs of a queue, oldest first.
    pub async fn dead_letters(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        self.entry(queue)?;
        Ok(self.store.list_dead_letters(queue, offset, limit).await?)
    }

    /// Moves a dead-lettered job back to ready with a fresh attempt budget
    /// from the queue's current retry policy. Returns false if the job is
    /// not dead-lettered.
    pub async fn requeue_dead_letter(&self, queue: &str, id: &JobId) -> QueueResult<bool> {
        let entry = self.entry(queue)?;
        let requeued = self
            .store
            .requeue_dead_letter(queue, id, entry.config.retry.max_attempts, Utc::now())
            .await?;

        if requeued {
            info!(queue, job_id = %id, "Requeued dead-lettered job");
        }
        Ok(requeued)
    }

    /// Deletes every dead-lettered job of a queue.
    pub async fn purge_dead_letters(&self, queue: &str) -> QueueResult<u64> {
        self.entry(queue)?;
        let purged = self.store.purge_dead_letters(queue).await?;
        info!(queue, purged, "Purged dead letters");
        Ok(purged)
    }

    /// Checks the store is reachable.
    pub async fn health_check(&self) -> QueueResult<()> {
        Ok(self.store.health_check().await?)
    }
}

fn apply_delta(current: usize, delta: i64) -> usize {
    let magnitude = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
    let target = if delta < 0 {
        current.saturating_sub(magnitude)
    } else {
        current.saturating_add(magnitude)
    };
    target.clamp(1, MAX_CONCURRENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::job::JobContext;
    use crate::store::MemoryJobStore;
    use tokio_test::{assert_err, assert_ok};

    async fn noop(_ctx: JobContext) -> Result<(), JobError> {
        Ok(())
    }

    fn manager() -> QueueManager {
        QueueManager::new(Arc::new(MemoryJobStore::new()))
    }

    #[test]
    fn test_apply_delta_clamps() {
        assert_eq!(apply_delta(4, 2), 6);
        assert_eq!(apply_delta(4, -2), 2);
        assert_eq!(apply_delta(4, -10), 1);
        assert_eq!(apply_delta(4, i64::MAX), MAX_CONCURRENCY);
        assert_eq!(apply_delta(4, i64::MIN), 1);
    }

    #[test]
    fn test_scheduled_at_prefers_explicit_time() {
        let now = Utc::now();
        let at = after(now, Duration::from_secs(60));

        assert_eq!(EnqueueOptions::new().scheduled_at(now), now);
        assert_eq!(
            EnqueueOptions::new()
                .delay(Duration::from_secs(5))
                .scheduled_at(now),
            after(now, Duration::from_secs(5))
        );
        assert_eq!(
            EnqueueOptions::new()
                .delay(Duration::from_secs(5))
                .at(at)
                .scheduled_at(now),
            at
        );
    }

    #[test]
    fn test_register_is_idempotent_for_same_config() {
        let manager = manager();
        manager
            .register_queue("emails", QueueConfig::default(), noop)
            .unwrap();
        manager
            .register_queue("emails", QueueConfig::default(), noop)
            .unwrap();

        let err = manager
            .register_queue("emails", QueueConfig::default().with_concurrency(9), noop)
            .unwrap_err();
        assert!(matches!(err, QueueError::QueueAlreadyRegistered(ref q) if q == "emails"));
        assert_eq!(manager.queue_names(), vec!["emails".to_string()]);
    }

    #[test]
    fn test_register_rejects_invalid_config() {
        let manager = manager();
        let err = manager
            .register_queue("emails", QueueConfig::default().with_concurrency(0), noop)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));

        let err = manager
            .register_queue("a:b", QueueConfig::default(), noop)
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));

        let short_lock = QueueConfig::default()
            .with_lock_ttl(Duration::from_millis(60))
            .with_job_timeout(Duration::from_secs(2));
        let err = manager.register_queue("emails", short_lock, noop).unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));
        assert!(manager.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_errors() {
        let manager = manager();
        manager
            .register_queue("emails", QueueConfig::default().with_priority_levels(3), noop)
            .unwrap();

        let err = manager
            .enqueue("reports", b"{}".to_vec(), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(ref q) if q == "reports"));

        let err = manager
            .enqueue("emails", b"{}".to_vec(), EnqueueOptions::new().priority(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidPriority { priority: 3, levels: 3, .. }
        ));
        assert_eq!(manager.stats("emails").await.unwrap().enqueued_total, 0);
    }

    #[tokio::test]
    async fn test_enqueue_uses_default_priority() {
        let manager = manager();
        manager
            .register_queue("emails", QueueConfig::default().with_priority_levels(5), noop)
            .unwrap();

        let id = manager
            .enqueue("emails", b"{}".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
        let job = manager.job("emails", &id).await.unwrap().unwrap();
        assert_eq!(job.priority, 2);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_delayed_enqueue_lands_in_delayed_set() {
        let manager = manager();
        manager
            .register_queue("emails", QueueConfig::default(), noop)
            .unwrap();

        manager
            .enqueue_json(
                "emails",
                &serde_json::json!({"to": "a@b.c"}),
                EnqueueOptions::new().delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let stats = manager.stats("emails").await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.enqueued_total, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let manager = manager();
        assert_ok!(manager.start().await);
        assert!(manager.is_running());
        let err = assert_err!(manager.start().await);
        assert!(matches!(err, QueueError::AlreadyRunning));

        let report = manager.stop(Duration::from_secs(1)).await;
        assert!(report.drained);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_adjust_concurrency_before_and_after_start() {
        let manager = manager();
        manager
            .register_queue("emails", QueueConfig::default().with_concurrency(2), noop)
            .unwrap();

        assert_eq!(manager.adjust_concurrency("emails", 3).unwrap(), 5);
        manager.start().await.unwrap();
        assert_eq!(manager.adjust_concurrency("emails", -4).unwrap(), 1);
        assert_eq!(manager.stats("emails").await.unwrap().concurrency, 1);
        assert!(matches!(
            manager.adjust_concurrency("reports", 1),
            Err(QueueError::UnknownQueue(_))
        ));

        manager.stop(Duration::from_secs(1)).await;
    }
}
