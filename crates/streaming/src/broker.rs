//! Message broker abstraction.
//!
//! The coordination layer needs very little from a broker: durable named
//! queues with competing consumers, fan-out exchanges, publish, subscribe,
//! and the ability to count live consumers on a queue. Anything providing
//! those can back a cluster; names are plain strings shared by convention.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Identifies one consumer registration on a broker connection.
pub type ConsumerTag = u64;

/// A live consumer on a queue.
///
/// Deliveries arrive on `deliveries` until the subscription is cancelled or
/// the connection closes, at which point the channel ends.
#[derive(Debug)]
pub struct Subscription {
    pub queue: String,
    pub tag: ConsumerTag,
    pub deliveries: mpsc::UnboundedReceiver<Bytes>,
}

/// Broker operations consumed by shard coordination.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one connection is shared by every
/// shard and listener of a process.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Declare a fan-out exchange. Idempotent.
    async fn declare_fanout(&self, exchange: &str) -> Result<()>;

    /// Bind `queue` to fan-out `exchange`. Idempotent.
    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()>;

    /// Publish to a queue. Delivered to exactly one consumer, or kept until
    /// one subscribes.
    async fn publish(&self, queue: &str, body: Bytes) -> Result<()>;

    /// Publish to every queue bound to `exchange`.
    async fn publish_fanout(&self, exchange: &str, body: Bytes) -> Result<()>;

    /// Start consuming from `queue`.
    async fn subscribe(&self, queue: &str) -> Result<Subscription>;

    /// Stop a consumer. Unknown tags are ignored.
    async fn cancel(&self, tag: ConsumerTag) -> Result<()>;

    /// Number of live consumers on `queue`, across all connections.
    async fn consumer_count(&self, queue: &str) -> Result<usize>;
}
