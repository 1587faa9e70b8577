//! Payload transformer abstractions.
//!
//! Every work item delivered on an active shard's queue is handed, verbatim,
//! to a transformer. What happens next (format conversion, an HTTP write to
//! an external system) is the transformer's business; the shard only waits
//! for it to complete.

pub mod logging;

pub use logging::LoggingTransformer;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use corelib::ShardNumber;

/// Trait for work item transformers.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (Send + Sync): one transformer is
/// shared by every shard of a process, and shards run concurrently.
#[async_trait]
pub trait PayloadTransformer: Send + Sync + 'static {
    /// Process one raw work item received on `shard`'s queue.
    ///
    /// An error is logged by the caller and the item is dropped; it does not
    /// affect shard ownership.
    async fn transform(&self, shard: ShardNumber, body: Bytes) -> Result<()>;

    /// Get the transformer name (for logging/debugging).
    fn name(&self) -> &'static str;
}
