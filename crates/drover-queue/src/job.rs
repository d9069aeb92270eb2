//! Job record and handler-facing context.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a job currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// In the ready set, waiting for a worker.
    #[default]
    Pending,
    /// In the delayed set until `scheduled_at`.
    Delayed,
    /// Claimed by a worker and locked.
    InFlight,
    /// Finished successfully. Completed jobs are removed from the store.
    Completed,
    /// An execution failed and another attempt will follow.
    FailedRetryable,
    /// Retry budget exhausted; kept until an operator purges it.
    DeadLettered,
}

impl JobStatus {
    /// Wire name used by the store backends.
    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Delayed => "delayed",
            JobStatus::InFlight => "in_flight",
            JobStatus::Completed => "completed",
            JobStatus::FailedRetryable => "failed_retryable",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "delayed" => Ok(JobStatus::Delayed),
            "in_flight" => Ok(JobStatus::InFlight),
            "completed" => Ok(JobStatus::Completed),
            "failed_retryable" => Ok(JobStatus::FailedRetryable),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A unit of work as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job ID, assigned at enqueue time.
    pub id: JobId,

    /// Owning queue.
    pub queue: String,

    /// Opaque payload handed to the handler.
    pub payload: Vec<u8>,

    /// Priority tier; 0 is the highest.
    pub priority: u8,

    /// Failed executions so far.
    pub attempt: u32,

    /// Executions allowed, copied from the queue's retry policy at enqueue.
    pub max_attempts: u32,

    /// Current status.
    pub status: JobStatus,

    /// When the job becomes (or became) ready.
    pub scheduled_at: DateTime<Utc>,

    /// Push order within the queue; breaks ties between equal priority and time.
    pub seq: u64,

    /// Token of the current claim.
    pub lock_token: Option<String>,

    /// When the current claim may be reclaimed.
    pub lock_expires_at: Option<DateTime<Utc>>,

    /// Error from the last failed execution.
    pub last_error: Option<String>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a new record. The store assigns `seq` and `status` on push.
    pub fn new(
        queue: impl Into<String>,
        payload: Vec<u8>,
        priority: u8,
        max_attempts: u32,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            priority,
            attempt: 0,
            max_attempts,
            status: JobStatus::Pending,
            scheduled_at,
            seq: 0,
            lock_token: None,
            lock_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if a failure of the current execution ends the job.
    pub fn is_final_attempt(&self) -> bool {
        crate::retry::is_terminal(self.attempt.saturating_add(1), self.max_attempts)
    }

    /// Create handler context for execution.
    pub fn to_context(&self, slot: usize) -> JobContext {
        JobContext {
            job_id: self.id.clone(),
            queue: self.queue.clone(),
            payload: Arc::from(self.payload.as_slice()),
            priority: self.priority,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            scheduled_at: self.scheduled_at,
            started_at: Utc::now(),
            slot,
        }
    }
}

/// Execution context passed to a job handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Queue name.
    pub queue: String,

    /// Raw payload.
    pub payload: Arc<[u8]>,

    /// Priority tier.
    pub priority: u8,

    /// Failed executions before this one (0 on the first run).
    pub attempt: u32,

    /// Executions allowed in total.
    pub max_attempts: u32,

    /// Job was scheduled at this time.
    pub scheduled_at: DateTime<Utc>,

    /// Job started executing at this time.
    pub started_at: DateTime<Utc>,

    /// Worker slot running the job.
    pub slot: usize,
}

impl JobContext {
    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        crate::retry::is_terminal(self.attempt.saturating_add(1), self.max_attempts)
    }

    /// Returns remaining attempts after this one.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt.saturating_add(1))
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Adds a std duration to a timestamp, saturating at the maximum date.
pub(crate) fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds since the epoch, clamped at zero.
pub(crate) fn millis(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_status_round_trips_through_wire_name() {
        for status in [
            JobStatus::Pending,
            JobStatus::Delayed,
            JobStatus::InFlight,
            JobStatus::Completed,
            JobStatus::FailedRetryable,
            JobStatus::DeadLettered,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_final_attempt() {
        let now = Utc::now();
        let mut job = JobRecord::new("emails", b"{}".to_vec(), 1, 3, now, now);
        assert!(!job.is_final_attempt());
        job.attempt = 2;
        assert!(job.is_final_attempt());
    }

    #[test]
    fn test_job_context() {
        let now = Utc::now();
        let job = JobRecord::new("emails", br#"{"to":"a@b.c"}"#.to_vec(), 0, 2, now, now);
        let ctx = job.to_context(3);

        assert_eq!(ctx.attempt, 0);
        assert_eq!(ctx.remaining_attempts(), 1);
        assert_eq!(ctx.slot, 3);
        assert!(!ctx.is_last_attempt());

        #[derive(Deserialize)]
        struct Email {
            to: String,
        }
        let email: Email = ctx.json().unwrap();
        assert_eq!(email.to, "a@b.c");
    }

    #[test]
    fn test_bad_payload_is_payload_error() {
        let now = Utc::now();
        let job = JobRecord::new("emails", b"not json".to_vec(), 0, 1, now, now);
        let result: Result<serde_json::Value, _> = job.to_context(0).json();
        assert!(matches!(result, Err(JobError::Payload(_))));
    }

    #[test]
    fn test_after_saturates() {
        let at = DateTime::<Utc>::MAX_UTC;
        assert_eq!(after(at, Duration::from_secs(1)), DateTime::<Utc>::MAX_UTC);

        let now = Utc::now();
        let later = after(now, Duration::from_millis(500));
        assert_eq!((later - now).num_milliseconds(), 500);
    }
}
