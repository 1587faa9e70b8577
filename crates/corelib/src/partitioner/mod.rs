//! Partition planning and object routing over the fixed shard space.
//!
//! The shard space is a static `0..TOTAL_SHARDS` range. A process learns which
//! contiguous slice of it to own from its position in the cluster, and
//! producers learn which shard an object belongs to from its id.

pub mod plan;
pub mod routing;

pub use plan::{plan, PartitionPlan};
pub use routing::shard_for_object;

/// Number of virtual shards in the cluster. Fixed at compile time.
pub const TOTAL_SHARDS: u32 = 1024;
