//! # Synchronization Errors
//!
//! One variant per failure class of the sync layer. Each component absorbs the
//! failures it can recover from locally (poll, cache, parse) and only the
//! transport escalates, once its retry budget is spent.
//!
//! Variants carry owned strings so the error is `Clone` and can travel inside
//! `ConnectionState` snapshots on a `watch` channel.

use serde::Serialize;
use thiserror::Error;

/// Errors produced by the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SyncError {
    /// Connect, send or receive failure on the push channel. Retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the handshake credentials. Never retried automatically.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// A poll fetcher returned an error.
    #[error("poll task '{key}' failed: {message}")]
    Polling {
        /// Key of the failing task.
        key: String,
        /// Rendered error returned by the fetcher.
        message: String,
    },

    /// The cache storage engine failed. Callers treat this as a miss.
    #[error("cache error: {0}")]
    Cache(String),

    /// An inbound frame could not be decoded or validated.
    #[error("malformed frame: {0}")]
    Parse(String),

    /// Invalid configuration values.
    #[error("configuration error: {0}")]
    Config(String),

    /// The resource key is not registered with the coordinator.
    #[error("unknown resource: {0}")]
    UnknownResource(String),
}

impl SyncError {
    /// True for failures the transport may recover from by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(!SyncError::Auth("bad token".into()).is_retryable());
        assert!(!SyncError::Parse("eof".into()).is_retryable());
    }

    #[test]
    fn polling_error_names_the_task() {
        let err = SyncError::Polling {
            key: "orders".into(),
            message: "502".into(),
        };
        assert_eq!(err.to_string(), "poll task 'orders' failed: 502");
    }
}
