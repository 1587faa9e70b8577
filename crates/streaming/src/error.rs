//! Error types for the control protocol and broker layer.

use thiserror::Error;

/// Result type alias for the streaming crate.
pub type Result<T> = std::result::Result<T, StreamingError>;

/// Errors raised while encoding, decoding or moving control traffic.
#[derive(Debug, Error)]
pub enum StreamingError {
    /// Body is not a valid control message
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Broker refused or failed the operation
    #[error("broker error: {0}")]
    Broker(String),
    /// Named queue or exchange does not exist
    #[error("no such queue or exchange: {0}")]
    QueueNotFound(String),
    #[error(transparent)]
    Core(#[from] corelib::Error),
}
