//! Virtual shard abstractions.
//!
//! # Virtual Shards (VNodes) Concept
//!
//! The work space is cut into [`TOTAL_SHARDS`] fixed partitions. Each one is
//! bound to its own durable broker queue, and at most one worker process may
//! consume a given queue at a time. This gives:
//!
//! 1. **Ordering**: all work for one object lands on one queue, consumed by one worker
//!    (in order while the owner is stable)
//! 2. **Cheap rebalancing**: ownership moves one shard at a time, no data is copied
//! 3. **Failure isolation**: a dead worker orphans only its own shards
//!
//! This module holds the broker-independent part of a shard: its number, the
//! queue names derived from it, and the lifecycle state machine. The runtime
//! that drives a shard against a broker lives in the `coordinator` crate.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped -> Starting -> Active -> Stopping -> Stopped
//!               |          |
//!               +----------+--> Stopped   (extra consumer detected)
//! ```

use crate::error::{Error, Result};
use crate::partitioner::TOTAL_SHARDS;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of a virtual shard, always in `0..TOTAL_SHARDS`.
///
/// Serialized as a bare integer so shard lists on the wire stay `[0,1,2]`.
///
/// # Example
///
/// ```rust
/// use corelib::ShardNumber;
///
/// let shard = ShardNumber::new(42).unwrap();
/// assert_eq!(shard.owner_queue(), "vnode-42");
/// assert_eq!(shard.control_queue(), "vnode-42-control");
/// assert!(ShardNumber::new(1024).is_err());
/// ```
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ShardNumber(u32);

impl ShardNumber {
    /// Validate and wrap a shard number.
    pub fn new(number: u32) -> Result<Self> {
        if number < TOTAL_SHARDS {
            Ok(Self(number))
        } else {
            Err(Error::InvalidShard(format!(
                "shard {} is outside 0..{}",
                number, TOTAL_SHARDS
            )))
        }
    }

    /// Wrap a number already known to be in range.
    #[inline]
    pub(crate) fn from_raw(number: u32) -> Self {
        debug_assert!(number < TOTAL_SHARDS);
        Self(number)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Queue carrying this shard's work items.
    pub fn owner_queue(self) -> String {
        format!("vnode-{}", self.0)
    }

    /// Queue carrying control traffic addressed to this shard.
    pub fn control_queue(self) -> String {
        format!("vnode-{}-control", self.0)
    }

    /// Every shard number, ascending.
    pub fn all() -> impl Iterator<Item = ShardNumber> {
        (0..TOTAL_SHARDS).map(ShardNumber)
    }
}

impl TryFrom<u32> for ShardNumber {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ShardNumber> for u32 {
    fn from(shard: ShardNumber) -> Self {
        shard.0
    }
}

impl fmt::Display for ShardNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a virtual shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    /// Not consuming. Initial and terminal state.
    Stopped,
    /// Subscribed, waiting out the duplicate-consumer detection interval.
    Starting,
    /// Exclusive consumer of the owner queue.
    Active,
    /// Cancelling the subscription.
    Stopping,
}

impl ShardState {
    /// True if the state machine allows `self -> next`.
    ///
    /// Any non-terminal state may fall straight to `Stopped`, which covers
    /// both conflict detection and cancellation during startup.
    pub fn can_transition_to(self, next: ShardState) -> bool {
        use ShardState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Active)
                | (Starting, Stopping)
                | (Active, Stopping)
                | (Starting, Stopped)
                | (Active, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Move to `next`, or fail with [`Error::InvalidTransition`].
    pub fn transition(self, shard: ShardNumber, next: ShardState) -> Result<ShardState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                shard: shard.get(),
                from: self,
                to: next,
            })
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        self == ShardState::Stopped
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::Stopped => "stopped",
            ShardState::Starting => "starting",
            ShardState::Active => "active",
            ShardState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}
