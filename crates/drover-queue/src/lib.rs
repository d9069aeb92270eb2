//! Drover Queue - Priority Job Queue and Worker Scheduling
//!
//! Named queues with:
//! - Strict priority ordering (priority, then scheduled time, then push order)
//! - Bounded worker pools per queue, resizable at runtime
//! - Retry with exponential backoff and optional jitter
//! - Dead-letter list for jobs that exhaust their attempts
//! - Delayed and scheduled jobs promoted by a background loop
//! - Lock-based reclaim of claims abandoned by crashed workers
//! - Per-queue statistics and Prometheus metrics
//!
//! # Architecture
//!
//! ```text
//!  Producer ── enqueue ──► QueueManager
//!                              │
//!                              ▼
//!  ┌──────────────────── JobStore (Redis / memory) ───────────────────┐
//!  │   delayed ── promoter ──► ready ── claim ──► in-flight           │
//!  │      ▲                     ▲                    │                 │
//!  │      │                     └──── reclaimer ─────┤                 │
//!  │      └────────── retry ─────────────────────────┤                 │
//!  │                                 dead letters ◄──┘                 │
//!  └───────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!              WorkerPool: slot 0 │ slot 1 │ … │ slot N
//!                              │
//!                              ▼
//!                        JobHandler (application)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use drover_queue::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn send_email(ctx: JobContext) -> Result<(), JobError> {
//!     let email: Email = ctx.json()?;
//!     mailer.send(&email).await?;
//!     Ok(())
//! }
//!
//! let manager = QueueManager::new(Arc::new(MemoryJobStore::new()));
//! manager.register_queue(
//!     "emails",
//!     QueueConfig::default().with_retry(RetryPolicy::exponential(3)),
//!     send_email,
//! )?;
//! manager.start().await?;
//!
//! manager
//!     .enqueue_json("emails", &email, EnqueueOptions::new().priority(0))
//!     .await?;
//!
//! let report = manager.stop(Duration::from_secs(30)).await;
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod metrics;
mod promoter;
mod reclaimer;
pub mod retry;
pub mod stats;
pub mod store;
pub mod worker;

pub use config::QueueConfig;
pub use error::{JobError, QueueError, QueueResult, StoreError, StoreResult};
pub use job::{JobContext, JobId, JobRecord, JobStatus};
pub use manager::{EnqueueOptions, QueueManager, ShutdownReport, MAX_CONCURRENCY};
pub use metrics::{register_metrics, JobMetrics, QueueMetrics};
pub use retry::RetryPolicy;
pub use stats::{QueueCounters, QueueStats, StatsCollector};
pub use store::{
    create_pool, JobStore, MemoryJobStore, QueueDepths, RedisJobStore, RedisKeys, RetryingStore,
    Transition,
};
pub use worker::{JobHandler, WorkerPool};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::QueueConfig;
    pub use crate::job::{JobContext, JobId, JobStatus};
    pub use crate::manager::{EnqueueOptions, QueueManager};
    pub use crate::retry::RetryPolicy;
    pub use crate::store::{JobStore, MemoryJobStore};
    pub use crate::worker::JobHandler;
    pub use crate::{JobError, QueueError, QueueResult};
}
