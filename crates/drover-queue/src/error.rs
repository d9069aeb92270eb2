//! Queue error types.

use drover_core::DroverError;
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for queue manager operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by a [`JobStore`](crate::store::JobStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored job could not be decoded.
    #[error("Corrupt job record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// The backend is temporarily unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
                    )
            }
            StoreError::Pool(e) => !matches!(
                e,
                deadpool_redis::PoolError::Closed | deadpool_redis::PoolError::NoRuntimeSpecified
            ),
            StoreError::Unavailable(_) => true,
            StoreError::Serialization(_) | StoreError::CorruptRecord { .. } => false,
        }
    }

    pub(crate) fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::CorruptRecord {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Errors returned synchronously to producers and operators.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was never registered.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// The queue is already registered with a different configuration.
    #[error("Queue already registered with a different configuration: {0}")]
    QueueAlreadyRegistered(String),

    /// Priority is outside the queue's configured tiers.
    #[error("Invalid priority {priority} for queue {queue}: expected 0..{levels}")]
    InvalidPriority { queue: String, priority: u8, levels: u8 },

    /// Queue configuration is unusable.
    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    /// A payload could not be serialized.
    #[error("Invalid job payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// `start` was called on a running manager.
    #[error("Queue manager is already running")]
    AlreadyRunning,

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Returns true for errors that indicate a programming or setup mistake.
    ///
    /// These are never retried automatically.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            QueueError::UnknownQueue(_)
                | QueueError::QueueAlreadyRegistered(_)
                | QueueError::InvalidPriority { .. }
                | QueueError::InvalidConfig(_)
        )
    }
}

impl From<QueueError> for DroverError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidConfig(msg) => DroverError::Configuration(msg),
            QueueError::Store(e) => DroverError::Store(e.to_string()),
            other @ QueueError::AlreadyRunning => DroverError::Internal(other.to_string()),
            other => DroverError::Queue(other.to_string()),
        }
    }
}

/// Failure reported by (or on behalf of) a job handler.
#[derive(Debug, Error)]
pub enum JobError {
    /// The handler returned an error.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// The handler did not finish before the deadline.
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked.
    #[error("Job handler panicked: {0}")]
    Panicked(String),

    /// The payload could not be decoded.
    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl JobError {
    /// Convenience constructor for handler code.
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::ExecutionFailed(message.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::ExecutionFailed(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_transient() {
        let err = StoreError::Unavailable("connection reset".into());
        assert!(err.is_transient());
    }

    #[test]
    fn test_corrupt_record_is_not_transient() {
        let err = StoreError::corrupt("job-1", "missing priority");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("job-1"));
    }

    #[test]
    fn test_redis_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = StoreError::Redis(redis::RedisError::from(io));
        assert!(err.is_transient());
    }

    #[test]
    fn test_redis_script_error_is_not_transient() {
        let err = StoreError::Redis(redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "ERR user_script",
        )));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_configuration_errors() {
        assert!(QueueError::UnknownQueue("emails".into()).is_configuration_error());
        assert!(QueueError::QueueAlreadyRegistered("emails".into()).is_configuration_error());
        assert!(QueueError::InvalidPriority {
            queue: "emails".into(),
            priority: 5,
            levels: 3,
        }
        .is_configuration_error());
        assert!(!QueueError::AlreadyRunning.is_configuration_error());
        assert!(!QueueError::Store(StoreError::Unavailable("down".into())).is_configuration_error());
    }

    #[test]
    fn test_invalid_priority_display() {
        let err = QueueError::InvalidPriority {
            queue: "emails".into(),
            priority: 7,
            levels: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("emails") && msg.contains('7') && msg.contains('3'));
    }

    #[test]
    fn test_into_drover_error() {
        let err: DroverError = QueueError::UnknownQueue("reports".into()).into();
        assert_eq!(err.error_code(), "QUEUE_ERROR");

        let err: DroverError = QueueError::Store(StoreError::Unavailable("down".into())).into();
        assert!(err.is_retriable());
    }

    #[test]
    fn test_job_error_from_anyhow() {
        let err = JobError::from(anyhow::anyhow!("smtp refused").context("sending welcome"));
        match err {
            JobError::ExecutionFailed(msg) => {
                assert!(msg.contains("sending welcome") && msg.contains("smtp refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_display() {
        let err = JobError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
