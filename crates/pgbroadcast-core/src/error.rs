//! Core error types.

use thiserror::Error;

/// Errors raised by the fan-out engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Notification payload could not be decoded or encoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The hub coordinator is no longer running.
    #[error("hub is closed")]
    HubClosed,

    /// The upstream adapter is no longer running.
    #[error("upstream adapter is closed")]
    UpstreamClosed,

    /// Client transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
