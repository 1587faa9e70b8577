//! Shard supervision for a cluster of cooperating workers.
//!
//! This crate drives the pure pieces from `corelib` against a broker:
//! - `VirtualShard`: exclusive consumption of one shard queue
//! - `ShardSupervisor`: per-process agent owning the local shards, applying
//!   control messages, and running leader-gated recovery
//! - `PayloadTransformer`: the seam where work items leave this layer

pub mod config;
pub mod debounce;
pub mod error;
pub mod shard;
pub mod supervisor;
pub mod transform;

pub use config::{BrokerSettings, CoordinatorConfig, OrphanSweep, SupervisorSettings};
pub use debounce::RecoveryDebounce;
pub use error::{CoordinatorError, Result};
pub use shard::{ShardObserver, StartOutcome, VirtualShard};
pub use supervisor::ShardSupervisor;
pub use transform::{LoggingTransformer, PayloadTransformer};
