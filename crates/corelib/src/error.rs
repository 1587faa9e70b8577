//! Error types for the core library.

use thiserror::Error;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Missing or inconsistent cluster sizing (`node_count` / `index`).
    ///
    /// Fatal at startup: a process must refuse to run rather than compute a
    /// wrong partition.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Identity fields missing or malformed
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
    /// Shard number out of range, or an object id that cannot be routed
    #[error("Invalid shard: {0}")]
    InvalidShard(String),
    /// Shard state machine rejected a transition
    #[error("Invalid transition for shard {shard}: {from:?} -> {to:?}")]
    InvalidTransition {
        shard: u32,
        from: crate::vnode::ShardState,
        to: crate::vnode::ShardState,
    },
}
