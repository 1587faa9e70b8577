//! Core library for virtual shard coordination.
//!
//! This crate provides the pure, broker-independent pieces of the cluster
//! coordination layer:
//! - Shard space constants and partition planning
//! - Object-to-shard routing
//! - Node identity and derived queue/exchange names
//! - Virtual shard naming and the shard state machine
//! - The gossip-updated shard ownership table and leader derivation

pub mod error;
pub mod node;
pub mod partitioner;
pub mod topology;
pub mod vnode;

pub use error::{Error, Result};
pub use node::NodeIdentity;
pub use partitioner::{plan, shard_for_object, PartitionPlan, TOTAL_SHARDS};
pub use topology::{ShardTable, TableUpdate, UpdateKind};
pub use vnode::{ShardNumber, ShardState};
