//! End-to-end tests of the queue manager over the in-memory store.

mod common;

use async_trait::async_trait;
use common::wait_for_stats;
use drover_queue::{
    EnqueueOptions, JobContext, JobError, JobHandler, JobStatus, MemoryJobStore, QueueConfig,
    QueueManager, RetryPolicy,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn manager() -> QueueManager {
    QueueManager::new(Arc::new(MemoryJobStore::new()))
}

fn fast_config(max_attempts: u32) -> QueueConfig {
    QueueConfig::default()
        .with_concurrency(1)
        .with_priority_levels(3)
        .with_poll_interval(Duration::from_millis(1), Duration::from_millis(10))
        .with_promoter_max_interval(Duration::from_millis(50))
        .with_retry(
            RetryPolicy::exponential(max_attempts)
                .with_base_delay(Duration::from_millis(10))
                .without_jitter(),
        )
}

/// Records every execution; fails `fail_label` on its first attempt.
#[derive(Clone, Default)]
struct Recorder {
    runs: Arc<Mutex<Vec<(String, u32, Instant)>>>,
    fail_label: Option<&'static str>,
}

#[async_trait]
impl JobHandler for Recorder {
    async fn handle(&self, ctx: JobContext) -> Result<(), JobError> {
        let label = ctx.text().unwrap_or_default().to_string();
        self.runs.lock().push((label.clone(), ctx.attempt, Instant::now()));

        if Some(label.as_str()) == self.fail_label && ctx.attempt == 0 {
            return Err(JobError::failed("transient failure"));
        }
        Ok(())
    }
}

struct AlwaysFail {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for AlwaysFail {
    async fn handle(&self, _ctx: JobContext) -> Result<(), JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(JobError::failed("always fails"))
    }
}

struct Sleepy {
    duration: Duration,
    started: Arc<AtomicBool>,
}

#[async_trait]
impl JobHandler for Sleepy {
    async fn handle(&self, _ctx: JobContext) -> Result<(), JobError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_email_scenario() {
    let manager = manager();
    let recorder = Recorder {
        fail_label: Some("p0"),
        ..Default::default()
    };
    let config = fast_config(2).with_retry(
        RetryPolicy::exponential(2)
            .with_base_delay(Duration::from_millis(100))
            .without_jitter(),
    );
    manager
        .register_queue("emails", config, recorder.clone())
        .unwrap();

    for (label, priority) in [("p1", 1), ("p0", 0), ("p2", 2)] {
        manager
            .enqueue("emails", label, EnqueueOptions::new().priority(priority))
            .await
            .unwrap();
    }
    manager.start().await.unwrap();

    let stats = wait_for_stats(&manager, "emails", WAIT, |s| s.completed_total == 3).await;
    assert_eq!(stats.completed_total, 3);
    assert_eq!(stats.failed_total, 0);
    assert_eq!(stats.dead_lettered_total, 0);
    assert_eq!(stats.retried_total, 1);
    assert_eq!(stats.dead_lettered, 0);

    let runs = recorder.runs.lock().clone();
    let labels: Vec<&str> = runs.iter().map(|(label, _, _)| label.as_str()).collect();
    assert_eq!(labels, vec!["p0", "p1", "p2", "p0"]);
    assert_eq!(runs[3].1, 1);

    let retry_gap = runs[3].2 - runs[0].2;
    assert!(retry_gap >= Duration::from_millis(95), "retried too early: {retry_gap:?}");
    assert!(retry_gap < Duration::from_millis(400), "retried too late: {retry_gap:?}");

    assert!(manager.stop(WAIT).await.drained);
}

#[tokio::test]
async fn test_always_failing_job_runs_max_attempts_then_dead_letters() {
    let manager = manager();
    let calls = Arc::new(AtomicU32::new(0));
    manager
        .register_queue(
            "reports",
            fast_config(3),
            AlwaysFail {
                calls: Arc::clone(&calls),
            },
        )
        .unwrap();
    manager.start().await.unwrap();

    let id = manager
        .enqueue("reports", b"{}".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let stats = wait_for_stats(&manager, "reports", WAIT, |s| s.dead_lettered == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(stats.failed_total, 1);
    assert_eq!(stats.retried_total, 2);

    let job = manager.job("reports", &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempt, 3);
    assert!(job.last_error.unwrap().contains("always fails"));

    manager.stop(WAIT).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delayed_job_runs_after_its_delay() {
    let manager = manager();
    let recorder = Recorder::default();
    manager
        .register_queue(
            "emails",
            fast_config(1).with_promoter_max_interval(Duration::from_secs(1)),
            recorder.clone(),
        )
        .unwrap();
    manager.start().await.unwrap();

    let enqueued = Instant::now();
    manager
        .enqueue(
            "emails",
            "later",
            EnqueueOptions::new().delay(Duration::from_millis(500)),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(recorder.runs.lock().is_empty());

    wait_for_stats(&manager, "emails", WAIT, |s| s.completed_total == 1).await;
    let ran_at = recorder.runs.lock()[0].2;
    let waited = ran_at - enqueued;
    assert!(waited >= Duration::from_millis(495), "ran too early: {waited:?}");
    assert!(waited < Duration::from_millis(1_600), "ran too late: {waited:?}");

    manager.stop(WAIT).await;
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_the_pool() {
    async fn picky(ctx: JobContext) -> Result<(), JobError> {
        if ctx.text() == Some("bad") {
            panic!("cannot handle this payload");
        }
        Ok(())
    }

    let manager = manager();
    manager
        .register_queue("jobs", fast_config(1), picky)
        .unwrap();
    manager.start().await.unwrap();

    for payload in ["good", "bad", "good"] {
        manager
            .enqueue("jobs", payload, EnqueueOptions::new())
            .await
            .unwrap();
    }

    let stats = wait_for_stats(&manager, "jobs", WAIT, |s| {
        s.completed_total == 2 && s.dead_lettered == 1
    })
    .await;
    assert_eq!(stats.completed_total, 2);
    assert_eq!(stats.failed_total, 1);

    let dead = manager.dead_letters("jobs", 0, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("panicked"));

    manager.stop(WAIT).await;
}

#[tokio::test]
async fn test_handler_timeout_is_retried() {
    let manager = manager();
    let started = Arc::new(AtomicBool::new(false));
    manager
        .register_queue(
            "slow",
            fast_config(2)
                .with_job_timeout(Duration::from_millis(50))
                .with_lock_ttl(Duration::from_secs(5)),
            Sleepy {
                duration: Duration::from_secs(10),
                started: Arc::clone(&started),
            },
        )
        .unwrap();
    manager.start().await.unwrap();

    manager
        .enqueue("slow", b"{}".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let stats = wait_for_stats(&manager, "slow", WAIT, |s| s.dead_lettered == 1).await;
    assert_eq!(stats.timed_out_total, 2);
    assert_eq!(stats.retried_total, 1);
    assert_eq!(stats.failed_total, 1);

    manager.stop(WAIT).await;
}

#[tokio::test]
async fn test_stop_waits_for_running_handler() {
    let manager = manager();
    let started = Arc::new(AtomicBool::new(false));
    manager
        .register_queue(
            "jobs",
            fast_config(1),
            Sleepy {
                duration: Duration::from_millis(100),
                started: Arc::clone(&started),
            },
        )
        .unwrap();
    manager.start().await.unwrap();
    manager
        .enqueue("jobs", b"{}".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = manager.stop(WAIT).await;
    assert!(report.drained);
    assert_eq!(report.abandoned_slots, 0);
    assert_eq!(manager.stats("jobs").await.unwrap().completed_total, 1);
}

#[tokio::test]
async fn test_drain_timeout_leaves_job_in_flight() {
    let manager = manager();
    let started = Arc::new(AtomicBool::new(false));
    manager
        .register_queue(
            "jobs",
            fast_config(1)
                .with_job_timeout(Duration::from_secs(30))
                .with_lock_ttl(Duration::from_secs(60)),
            Sleepy {
                duration: Duration::from_secs(10),
                started: Arc::clone(&started),
            },
        )
        .unwrap();
    manager.start().await.unwrap();
    manager
        .enqueue("jobs", b"{}".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let report = manager.stop(Duration::from_millis(100)).await;
    assert!(!report.drained);
    assert_eq!(report.abandoned_slots, 1);
    assert!(report.elapsed >= Duration::from_millis(100));

    let stats = manager.stats("jobs").await.unwrap();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.completed_total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_is_bounded_and_adjustable() {
    struct Tracking {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for Tracking {
        async fn handle(&self, _ctx: JobContext) -> Result<(), JobError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let manager = manager();
    manager
        .register_queue(
            "batch",
            fast_config(1).with_concurrency(4),
            Tracking {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            },
        )
        .unwrap();
    manager.start().await.unwrap();

    for _ in 0..20 {
        manager
            .enqueue("batch", b"{}".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
    }
    let stats = wait_for_stats(&manager, "batch", WAIT, |s| s.completed_total == 20).await;
    assert_eq!(stats.completed_total, 20);
    assert!(peak.load(Ordering::SeqCst) <= 4);

    assert_eq!(manager.adjust_concurrency("batch", -3).unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    peak.store(0, Ordering::SeqCst);

    for _ in 0..5 {
        manager
            .enqueue("batch", b"{}".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
    }
    let stats = wait_for_stats(&manager, "batch", WAIT, |s| s.completed_total == 25).await;
    assert_eq!(stats.completed_total, 25);
    assert_eq!(stats.concurrency, 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    manager.stop(WAIT).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shrinking_lets_running_handlers_finish() {
    struct Gated {
        running: Arc<AtomicUsize>,
        release: Arc<AtomicBool>,
    }

    #[async_trait]
    impl JobHandler for Gated {
        async fn handle(&self, _ctx: JobContext) -> Result<(), JobError> {
            self.running.fetch_add(1, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let running = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));
    let manager = manager();
    manager
        .register_queue(
            "batch",
            fast_config(1).with_concurrency(4),
            Gated {
                running: Arc::clone(&running),
                release: Arc::clone(&release),
            },
        )
        .unwrap();
    manager.start().await.unwrap();

    for _ in 0..4 {
        manager
            .enqueue("batch", b"{}".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
    }

    let deadline = Instant::now() + WAIT;
    while running.load(Ordering::SeqCst) < 4 {
        assert!(Instant::now() < deadline, "handlers did not start");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(manager.adjust_concurrency("batch", -3).unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(running.load(Ordering::SeqCst), 4);
    assert_eq!(manager.stats("batch").await.unwrap().in_flight, 4);

    release.store(true, Ordering::SeqCst);
    let stats = wait_for_stats(&manager, "batch", WAIT, |s| s.completed_total == 4).await;
    assert_eq!(stats.completed_total, 4);
    assert_eq!(stats.retried_total, 0);
    assert_eq!(stats.reclaimed_total, 0);
    assert_eq!(stats.stale_locks_total, 0);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.concurrency, 1);

    assert!(manager.stop(WAIT).await.drained);
}

#[tokio::test]
async fn test_requeue_and_purge_dead_letters() {
    struct FailWhileBroken {
        broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl JobHandler for FailWhileBroken {
        async fn handle(&self, _ctx: JobContext) -> Result<(), JobError> {
            if self.broken.load(Ordering::SeqCst) {
                Err(JobError::failed("downstream unavailable"))
            } else {
                Ok(())
            }
        }
    }

    let broken = Arc::new(AtomicBool::new(true));
    let manager = manager();
    manager
        .register_queue(
            "webhooks",
            fast_config(1),
            FailWhileBroken {
                broken: Arc::clone(&broken),
            },
        )
        .unwrap();
    manager.start().await.unwrap();

    let first = manager
        .enqueue("webhooks", b"1".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    manager
        .enqueue("webhooks", b"2".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    wait_for_stats(&manager, "webhooks", WAIT, |s| s.dead_lettered == 2).await;

    let dead = manager.dead_letters("webhooks", 0, 10).await.unwrap();
    assert_eq!(dead.len(), 2);
    assert_eq!(dead[0].id, first);
    assert_eq!(manager.dead_letters("webhooks", 1, 10).await.unwrap().len(), 1);

    broken.store(false, Ordering::SeqCst);
    assert!(manager.requeue_dead_letter("webhooks", &first).await.unwrap());
    assert!(!manager.requeue_dead_letter("webhooks", &first).await.unwrap());

    let stats = wait_for_stats(&manager, "webhooks", WAIT, |s| s.completed_total == 1).await;
    assert_eq!(stats.completed_total, 1);
    assert_eq!(stats.dead_lettered, 1);

    assert_eq!(manager.purge_dead_letters("webhooks").await.unwrap(), 1);
    assert_eq!(manager.stats("webhooks").await.unwrap().dead_lettered, 0);

    manager.stop(WAIT).await;
}

#[tokio::test]
async fn test_queue_registered_while_running_starts_immediately() {
    let manager = manager();
    manager.start().await.unwrap();

    let recorder = Recorder::default();
    manager
        .register_queue("late", fast_config(1), recorder.clone())
        .unwrap();
    manager
        .enqueue_json("late", &"hello", EnqueueOptions::new())
        .await
        .unwrap();

    let stats = wait_for_stats(&manager, "late", WAIT, |s| s.completed_total == 1).await;
    assert_eq!(stats.completed_total, 1);
    assert_eq!(recorder.runs.lock()[0].0, "\"hello\"");

    let all = manager.all_stats().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].queue, "late");
    assert!(manager.health_check().await.is_ok());

    manager.stop(WAIT).await;
}
