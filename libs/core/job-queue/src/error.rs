//! Queue error types and error categorization
//!
//! Errors are categorized to decide what the worker loop does next:
//! - **Transient**: the connection is invalidated and redialed
//! - **Benign**: the broker already expired or redelivered the job; log only
//! - **Timeout**: the handler missed its deadline; the job is abandoned
//! - **Closed**: the consumer or producer was closed; callers must not retry
//! - **Permanent**: configuration problems, surfaced to the caller

use crate::job::JobId;
use std::time::Duration;
use thiserror::Error;

/// Category of error for deciding worker behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection-level failure - invalidate and reconnect
    Transient,
    /// Not-found race with broker-side expiry or redelivery
    Benign,
    /// Handler deadline elapsed
    Timeout,
    /// Component closed by its owner
    Closed,
    /// Invalid configuration or internal failure
    Permanent,
}

impl ErrorCategory {
    /// Whether the connection that produced this error must be torn down.
    pub fn invalidates_connection(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

/// Queue client errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Dial or subscribe failure
    #[error("Connect to {address} failed: {message}")]
    Connect { address: String, message: String },

    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// NATS or JetStream error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Job is no longer reserved by this connection
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// Operation attempted on a connection that is already torn down
    #[error("Connection is not open")]
    Disconnected,

    /// Handler did not return before its deadline
    #[error("Handler timed out after {timeout:?} (queue: {queue}, job: {job_id})")]
    HandlerTimeout {
        queue: String,
        job_id: JobId,
        timeout: Duration,
    },

    /// Consumer or producer has been closed
    #[error("Queue client closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal worker failure (job task cancelled or lost)
    #[error("Worker error: {0}")]
    Worker(String),
}

impl QueueError {
    /// Create a NATS error from any async_nats error
    pub fn nats(error: impl std::fmt::Display) -> Self {
        QueueError::Nats(error.to_string())
    }

    /// Create a connect error
    pub fn connect(address: impl Into<String>, error: impl std::fmt::Display) -> Self {
        QueueError::Connect {
            address: address.into(),
            message: error.to_string(),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            QueueError::Connect { .. } => ErrorCategory::Transient,
            QueueError::Redis(_) => ErrorCategory::Transient,
            QueueError::Nats(_) => ErrorCategory::Transient,
            QueueError::Disconnected => ErrorCategory::Transient,
            QueueError::NotFound(_) => ErrorCategory::Benign,
            QueueError::HandlerTimeout { .. } => ErrorCategory::Timeout,
            QueueError::Closed => ErrorCategory::Closed,
            QueueError::Config(_) => ErrorCategory::Permanent,
            QueueError::Worker(_) => ErrorCategory::Permanent,
        }
    }

    /// Broker reported the job as unknown (expired or redelivered)
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::NotFound(_))
    }

    /// Error means the connection is unusable and must be redialed
    pub fn is_connection_error(&self) -> bool {
        self.category().invalidates_connection()
    }

    /// Handler deadline elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::HandlerTimeout { .. })
    }

    /// Consumer or producer was closed
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            QueueError::connect("redis://127.0.0.1:6379", "refused").category(),
            ErrorCategory::Transient
        );
        assert_eq!(QueueError::nats("broken pipe").category(), ErrorCategory::Transient);
        assert_eq!(QueueError::Disconnected.category(), ErrorCategory::Transient);
        assert_eq!(QueueError::NotFound(JobId::new(7)).category(), ErrorCategory::Benign);
        assert_eq!(QueueError::Closed.category(), ErrorCategory::Closed);
        assert_eq!(QueueError::Config("pool".into()).category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_not_found_does_not_invalidate() {
        let err = QueueError::NotFound(JobId::new(42));
        assert!(err.is_not_found());
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_timeout_carries_context() {
        let err = QueueError::HandlerTimeout {
            queue: "mail".to_string(),
            job_id: JobId::new(9),
            timeout: Duration::from_secs(2),
        };
        assert!(err.is_timeout());
        assert!(!err.is_connection_error());
        let message = err.to_string();
        assert!(message.contains("mail"));
        assert!(message.contains('9'));
    }

    #[test]
    fn test_closed() {
        assert!(QueueError::Closed.is_closed());
        assert!(!QueueError::Disconnected.is_closed());
    }
}
