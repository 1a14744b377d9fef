//! Error types for the worker core.
//!
//! This module provides:
//! - `WorkerError` - the main error type surfaced by the broker, job store
//!   and claim loop
//! - `ErrorCategory` - classification used only to drive the claim loop's
//!   own reconnect backoff (distinct from a job's own retry/backoff, which
//!   is driven by the job's `backoff` configuration, see `job.rs`)

use thiserror::Error;

/// Errors that can occur while claiming, storing or running a job.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job store has no record for the given id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A persisted job record could not be parsed.
    #[error("Malformed job record: {0}")]
    Malformed(String),

    /// The user processor failed.
    #[error("Processing error: {0}")]
    Processing(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Check if this is a connection-related error, recoverable by backing
    /// off and retrying the claim loop.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let s = e.to_string().to_lowercase();
                s.contains("connection")
                    || s.contains("disconnected")
                    || s.contains("broken pipe")
                    || s.contains("reset by peer")
                    || s.contains("refused")
                    || s.contains("eof")
                    || s.contains("io error")
            }
            _ => false,
        }
    }

    /// Check if this is a round-trip timeout, distinct from the benign
    /// block-timeout of the blocking notification wait (which is not
    /// surfaced as an error at all, see `broker::BrokerAdapter`).
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let s = e.to_string().to_lowercase();
                s.contains("timeout") || s.contains("timed out")
            }
            _ => false,
        }
    }

    /// Categorize the error for the claim loop's own backoff policy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Redis(_) if self.is_timeout() => ErrorCategory::Timeout,
            Self::Redis(_) if self.is_connection_error() => ErrorCategory::Connection,
            Self::Redis(_) => ErrorCategory::Malformed,
            Self::Serialization(_) | Self::Malformed(_) => ErrorCategory::Malformed,
            Self::JobNotFound(_) | Self::Config(_) | Self::Internal(_) => ErrorCategory::Malformed,
            Self::Processing(_) => ErrorCategory::Processing,
        }
    }
}

/// Classification of a claim-loop error, used only to pick a backoff for
/// the claim loop's own reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Broker connection dropped or refused; back off and retry the claim.
    Connection,
    /// A broker round-trip timed out.
    Timeout,
    /// A persisted record was malformed; not recoverable by retrying the
    /// same read.
    Malformed,
    /// The user processor itself failed (handled by the runner's own
    /// retry/backoff path, not by the claim loop).
    Processing,
}

/// An error surfaced by the user processor — the `err` half of a job's
/// outcome.
///
/// Because the Rust processor signature returns a `Result` instead of
/// invoking a callback, double invocation of a completion callback is
/// structurally impossible here.
#[derive(Debug, Clone)]
pub struct ProcessorError {
    pub message: String,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The structured error payload used for shutdown-induced failures:
    /// `{"error": true, "message": "Shutdown"}`, persisted and emitted
    /// verbatim as the job's error string.
    pub fn shutdown() -> Self {
        Self::new(serde_json::json!({"error": true, "message": "Shutdown"}).to_string())
    }
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProcessorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkerError::Processing("failed to send email".to_string());
        assert_eq!(err.to_string(), "Processing error: failed to send email");
    }

    #[test]
    fn test_category_processing() {
        let err = WorkerError::Processing("boom".to_string());
        assert_eq!(err.category(), ErrorCategory::Processing);
    }

    #[test]
    fn test_category_malformed() {
        let err = WorkerError::JobNotFound("42".to_string());
        assert_eq!(err.category(), ErrorCategory::Malformed);
    }

    #[test]
    fn test_category_connection_error_backs_off() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = WorkerError::Redis(io_err.into());
        assert!(err.is_connection_error());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }

    #[test]
    fn test_category_redis_non_connection_is_malformed() {
        let redis_err: redis::RedisError =
            (redis::ErrorKind::TypeError, "unexpected response type").into();
        let err = WorkerError::Redis(redis_err);
        assert!(!err.is_connection_error());
        assert!(!err.is_timeout());
        assert_eq!(err.category(), ErrorCategory::Malformed);
    }

    #[test]
    fn test_processor_error_shutdown_marker_is_structured() {
        let err = ProcessorError::shutdown();
        assert_eq!(
            err.message,
            r#"{"error":true,"message":"Shutdown"}"#
        );
        assert_eq!(err.to_string(), r#"{"error":true,"message":"Shutdown"}"#);
    }
}
