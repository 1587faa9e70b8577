//! Error types for shard supervision.

use thiserror::Error;

/// Result type alias for the coordinator crate.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Startup configuration could not be read or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),
    /// Work item could not be handed off
    #[error("transformer {name} failed: {message}")]
    Transformer { name: &'static str, message: String },
    #[error(transparent)]
    Core(#[from] corelib::Error),
    #[error(transparent)]
    Streaming(#[from] streaming::StreamingError),
}
