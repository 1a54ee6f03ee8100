//! Error types for the admission, publish and consume paths.
//!
//! An admission denial is not an error for the controller itself (it returns a
//! [`Decision`](crate::rate_limit::Decision)); only the tower layer lifts it into
//! [`AdmissionError::Rejected`] so ingress code can tell it apart from a
//! [`PublishError`].
use std::time::Duration;
use thiserror::Error;

/// Error surfaced by [`AdmissionService`](crate::rate_limit::AdmissionService).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError<E> {
    /// The client exhausted its bucket; nothing downstream was called.
    #[error("rate limited; retry after {retry_after:?}")]
    Rejected { retry_after: Duration },
    /// The wrapped service failed.
    #[error("{0}")]
    Inner(#[source] E),
}

impl<E> AdmissionError<E> {
    /// Check if the request was turned away by the rate limiter.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// How long the client should wait, if this is a rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected { retry_after } => Some(*retry_after),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected { .. } => None,
        }
    }
}

/// Infrastructure failure while appending a task to the topic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// No usable connection to the broker.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// The broker refused the write.
    #[error("write rejected by broker: {0}")]
    Rejected(String),
    /// The write was not acknowledged in time.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    /// The publisher was closed.
    #[error("publisher closed")]
    Closed,
}

impl PublishError {
    /// Whether a caller may reasonably try the same publish again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Short label used in telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
        }
    }
}

/// Failure to read from (or acknowledge on) the topic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    /// Lost the broker connection; expected to heal.
    #[error("broker disconnected: {0}")]
    Disconnected(String),
    /// Consumer-group coordination failed (rebalance, coordinator moved).
    #[error("consumer group coordination failed: {0}")]
    Coordination(String),
    /// Unrecoverable, e.g. authorization or a missing topic.
    #[error("fatal consumer error: {0}")]
    Fatal(String),
    /// The reader was closed.
    #[error("reader closed")]
    Closed,
}

impl ConsumeError {
    /// Transient errors are retried with backoff by the worker pool.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Coordination(_))
    }
}

/// Failure of a single task handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    /// Convenience constructor from anything displayable.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must be at least {min:?}, got {actual:?}")]
    TooShort { field: &'static str, min: Duration, actual: Duration },
    #[error("could not parse {key}={value:?}: {reason}")]
    Parse { key: String, value: String, reason: String },
    #[error("{field} must be a whole number of milliseconds, got {actual:?}")]
    NotWholeMillis { field: &'static str, actual: Duration },
    #[error("{key} is not set")]
    Missing { key: String },
}
