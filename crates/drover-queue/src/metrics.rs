//! Prometheus metrics for job queue monitoring.
//!
//! Recorded through the `metrics` facade; the binary decides which exporter
//! (if any) is installed.

use crate::store::QueueDepths;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job queue system.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "drover_jobs_enqueued_total";
    /// Total jobs claimed by a worker slot.
    pub const JOBS_CLAIMED_TOTAL: &str = "drover_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "drover_jobs_completed_total";
    /// Total jobs rescheduled after a failed execution.
    pub const JOBS_RETRIED_TOTAL: &str = "drover_jobs_retried_total";
    /// Total jobs sent to the dead-letter list.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "drover_jobs_dead_lettered_total";
    /// Total handler executions that hit the deadline.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "drover_jobs_timed_out_total";
    /// Total handler executions that panicked.
    pub const JOBS_PANICKED_TOTAL: &str = "drover_jobs_panicked_total";
    /// Total expired claims returned to ready.
    pub const JOBS_RECLAIMED_TOTAL: &str = "drover_jobs_reclaimed_total";
    /// Total delayed jobs moved to ready.
    pub const JOBS_PROMOTED_TOTAL: &str = "drover_jobs_promoted_total";
    /// Total transitions refused because the lock token was stale.
    pub const STALE_LOCKS_TOTAL: &str = "drover_stale_locks_total";
    /// Total store operations that failed after retries.
    pub const STORE_ERRORS_TOTAL: &str = "drover_store_errors_total";

    /// Current ready jobs.
    pub const JOBS_READY: &str = "drover_jobs_ready";
    /// Current delayed jobs.
    pub const JOBS_DELAYED: &str = "drover_jobs_delayed";
    /// Current in-flight jobs.
    pub const JOBS_IN_FLIGHT: &str = "drover_jobs_in_flight";
    /// Current dead-letter list size.
    pub const JOBS_DEAD_LETTER: &str = "drover_jobs_dead_letter";

    /// Handler execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "drover_job_duration_seconds";
    /// Time from due to claim in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "drover_job_wait_time_seconds";

    /// Slots currently executing a handler.
    pub const WORKERS_ACTIVE: &str = "drover_workers_active";
    /// Configured slot count.
    pub const WORKERS_CONCURRENCY: &str = "drover_workers_concurrency";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Job counters
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_CLAIMED_TOTAL,
        "Total number of jobs claimed by worker slots"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of jobs rescheduled after a failure"
    );
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs sent to the dead-letter list"
    );
    describe_counter!(
        names::JOBS_TIMED_OUT_TOTAL,
        "Total number of handler executions that timed out"
    );
    describe_counter!(
        names::JOBS_PANICKED_TOTAL,
        "Total number of handler executions that panicked"
    );
    describe_counter!(
        names::JOBS_RECLAIMED_TOTAL,
        "Total number of expired claims returned to ready"
    );
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total number of delayed jobs promoted to ready"
    );
    describe_counter!(
        names::STALE_LOCKS_TOTAL,
        "Total number of transitions refused for a stale lock token"
    );
    describe_counter!(
        names::STORE_ERRORS_TOTAL,
        "Total number of store operations that failed"
    );

    // Depth gauges
    describe_gauge!(names::JOBS_READY, "Current number of ready jobs");
    describe_gauge!(names::JOBS_DELAYED, "Current number of delayed jobs");
    describe_gauge!(names::JOBS_IN_FLIGHT, "Current number of claimed jobs");
    describe_gauge!(names::JOBS_DEAD_LETTER, "Current size of the dead-letter list");

    // Duration histograms
    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Handler execution duration in seconds"
    );
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Time between a job becoming due and being claimed, in seconds"
    );

    // Worker metrics
    describe_gauge!(names::WORKERS_ACTIVE, "Number of slots executing a handler");
    describe_gauge!(names::WORKERS_CONCURRENCY, "Configured worker slots");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, priority: u8) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    /// Record a job claimed and how long it waited after becoming due.
    pub fn job_claimed(queue: &str, wait_time: Duration) {
        counter!(names::JOBS_CLAIMED_TOTAL, "queue" => queue.to_string()).increment(1);
        histogram!(names::JOB_WAIT_TIME_SECONDS, "queue" => queue.to_string())
            .record(wait_time.as_secs_f64());
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed execution that will be retried.
    pub fn job_retried(queue: &str, attempt: u32, duration: Duration) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job sent to the dead-letter list.
    pub fn job_dead_lettered(queue: &str, duration: Duration) {
        counter!(names::JOBS_DEAD_LETTERED_TOTAL, "queue" => queue.to_string()).increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "dead_lettered"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a handler timeout.
    pub fn job_timed_out(queue: &str) {
        counter!(names::JOBS_TIMED_OUT_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a handler panic.
    pub fn job_panicked(queue: &str) {
        counter!(names::JOBS_PANICKED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record expired claims returned to ready.
    pub fn jobs_reclaimed(queue: &str, count: u64) {
        counter!(names::JOBS_RECLAIMED_TOTAL, "queue" => queue.to_string()).increment(count);
    }

    /// Record delayed jobs promoted to ready.
    pub fn jobs_promoted(queue: &str, count: u64) {
        counter!(names::JOBS_PROMOTED_TOTAL, "queue" => queue.to_string()).increment(count);
    }

    /// Record a transition refused for a stale token.
    pub fn stale_lock(queue: &str, operation: &'static str) {
        counter!(
            names::STALE_LOCKS_TOTAL,
            "queue" => queue.to_string(),
            "operation" => operation
        )
        .increment(1);
    }

    /// Record a failed store operation.
    pub fn store_error(queue: &str, operation: &'static str) {
        counter!(
            names::STORE_ERRORS_TOTAL,
            "queue" => queue.to_string(),
            "operation" => operation
        )
        .increment(1);
    }
}

/// Queue gauge recorder.
#[derive(Clone)]
pub struct QueueMetrics;

impl QueueMetrics {
    /// Update depth gauges from a store reading.
    pub fn update_depths(queue: &str, depths: &QueueDepths) {
        gauge!(names::JOBS_READY, "queue" => queue.to_string()).set(depths.ready as f64);
        gauge!(names::JOBS_DELAYED, "queue" => queue.to_string()).set(depths.delayed as f64);
        gauge!(names::JOBS_IN_FLIGHT, "queue" => queue.to_string()).set(depths.in_flight as f64);
        gauge!(names::JOBS_DEAD_LETTER, "queue" => queue.to_string())
            .set(depths.dead_lettered as f64);
    }

    /// Update worker gauges.
    pub fn update_workers(queue: &str, active: u64, concurrency: usize) {
        gauge!(names::WORKERS_ACTIVE, "queue" => queue.to_string()).set(active as f64);
        gauge!(names::WORKERS_CONCURRENCY, "queue" => queue.to_string()).set(concurrency as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // No recorder installed; calls must be no-ops
        register_metrics();
    }

    #[test]
    fn test_job_metrics() {
        JobMetrics::job_enqueued("emails", 1);
        JobMetrics::job_claimed("emails", Duration::from_millis(3));
        JobMetrics::job_completed("emails", Duration::from_secs(1));
        JobMetrics::job_retried("emails", 1, Duration::from_millis(20));
        JobMetrics::stale_lock("emails", "complete");
        QueueMetrics::update_depths("emails", &QueueDepths::default());
        QueueMetrics::update_workers("emails", 0, 4);
    }
}
