//! Error types for job queue operations.
//!
//! Backend failures (an unreachable Redis, a corrupt document) are never
//! masked: they surface as [`QueueError`] so the caller can retry instead of
//! silently dropping work. Unknown job or set ids are not errors; the queue
//! operations report them through `false`/`None` results.

use thiserror::Error;

/// Errors that can occur while talking to a job queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a job document.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored document could not be interpreted.
    #[error("Corrupt document '{key}': {reason}")]
    CorruptDocument { key: String, reason: String },

    /// No registered backend reported itself as enabled.
    #[error("No job queue backend is enabled")]
    NoBackendEnabled,

    /// More than one registered backend reported itself as enabled.
    #[error("Multiple job queue backends are enabled: {0}")]
    MultipleBackendsEnabled(String),

    /// Configuration error while building the queue.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Convenience alias used throughout the scheduler.
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::NoBackendEnabled;
        assert!(err.to_string().contains("No job queue backend"));

        let err = QueueError::MultipleBackendsEnabled("local, redis".to_string());
        assert!(err.to_string().contains("local, redis"));

        let err = QueueError::CorruptDocument {
            key: "xtraplatform:jobs:job:1".to_string(),
            reason: "missing field".to_string(),
        };
        assert!(err.to_string().contains("xtraplatform:jobs:job:1"));
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: QueueError = parse.unwrap_err().into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
