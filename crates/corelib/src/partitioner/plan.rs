//! Static partition plan: which contiguous shard range a node position owns.
//!
//! # Algorithm
//!
//! ```text
//! base      = TOTAL_SHARDS / node_count
//! remainder = TOTAL_SHARDS - base * node_count
//!
//! index <  node_count  ->  [(index-1)*base, index*base - 1]
//! index == node_count  ->  [(node_count-1)*base, TOTAL_SHARDS - 1]
//! ```
//!
//! The last position always absorbs the remainder, so the ranges for
//! `1..=node_count` tile `0..TOTAL_SHARDS` with no gaps or overlaps.

use super::TOTAL_SHARDS;
use crate::error::{Error, Result};
use crate::vnode::ShardNumber;
use std::fmt;
use std::ops::RangeInclusive;

/// Shards planned for one node position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPlan {
    /// Inclusive `[low, high]` range of shard numbers.
    Range { low: u32, high: u32 },
    /// Nothing planned (position unset, or more nodes than shards).
    Empty,
}

impl PartitionPlan {
    /// Number of shards in the plan.
    pub fn len(&self) -> usize {
        match self {
            PartitionPlan::Range { low, high } => (high - low + 1) as usize,
            PartitionPlan::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PartitionPlan::Empty)
    }

    /// True if `shard` falls inside the planned range.
    pub fn contains(&self, shard: ShardNumber) -> bool {
        self.range().map_or(false, |r| r.contains(&shard.get()))
    }

    /// The planned range as a `RangeInclusive`, if any.
    pub fn range(&self) -> Option<RangeInclusive<u32>> {
        match *self {
            PartitionPlan::Range { low, high } => Some(low..=high),
            PartitionPlan::Empty => None,
        }
    }

    /// Shard numbers in ascending order.
    pub fn shards(&self) -> impl Iterator<Item = ShardNumber> {
        self.range()
            .into_iter()
            .flatten()
            .map(ShardNumber::from_raw)
    }
}

impl fmt::Display for PartitionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionPlan::Range { low, high } => write!(f, "[{}, {}]", low, high),
            PartitionPlan::Empty => write!(f, "[]"),
        }
    }
}

/// Compute the shard range for a 1-based node position.
///
/// * `node_count` must be present and positive.
/// * `index`, if present, must be in `1..=node_count`; `None` means the
///   process has not been given a position yet and yields an empty plan.
///
/// # Errors
///
/// Returns [`Error::InvalidConfiguration`] for a missing or zero
/// `node_count`, or an `index` outside `1..=node_count`.
///
/// # Example
///
/// ```rust
/// use corelib::{plan, PartitionPlan};
///
/// assert_eq!(plan(Some(5), Some(1)).unwrap(), PartitionPlan::Range { low: 0, high: 203 });
/// assert_eq!(plan(Some(5), Some(5)).unwrap(), PartitionPlan::Range { low: 816, high: 1023 });
/// ```
pub fn plan(node_count: Option<u32>, index: Option<u32>) -> Result<PartitionPlan> {
    let node_count = match node_count {
        Some(n) if n > 0 => n,
        Some(_) => {
            return Err(Error::InvalidConfiguration(
                "node_count must be a positive integer".to_string(),
            ))
        }
        None => {
            return Err(Error::InvalidConfiguration(
                "node_count is not set".to_string(),
            ))
        }
    };

    let index = match index {
        Some(0) => {
            return Err(Error::InvalidConfiguration(
                "index is 1-based and must be at least 1".to_string(),
            ))
        }
        Some(i) if i > node_count => {
            return Err(Error::InvalidConfiguration(format!(
                "index {} is greater than node_count {}",
                i, node_count
            )))
        }
        Some(i) => i,
        None => return Ok(PartitionPlan::Empty),
    };

    let base = TOTAL_SHARDS / node_count;

    if index == node_count {
        return Ok(PartitionPlan::Range {
            low: (node_count - 1) * base,
            high: TOTAL_SHARDS - 1,
        });
    }

    // More nodes than shards: every position but the last gets nothing.
    if base == 0 {
        return Ok(PartitionPlan::Empty);
    }

    Ok(PartitionPlan::Range {
        low: (index - 1) * base,
        high: index * base - 1,
    })
}
