//! Unified error type shared by the Drover crates.

use std::fmt::Debug;
use thiserror::Error;

/// Top-level error for Drover processes.
///
/// Library crates keep their own precise error enums; they convert into
/// `DroverError` at the composition root so the binary deals with one type.
#[derive(Error, Debug)]
pub enum DroverError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The backing store (Redis, memory) failed.
    #[error("Store error: {0}")]
    Store(String),

    /// A queue management call was rejected.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Tracing or metrics bootstrap failed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// An operation did not finish in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DroverError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Telemetry(_) => "TELEMETRY_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Timeout(_))
    }
}
