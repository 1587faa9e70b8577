//! Transformer that only logs and counts what it receives.
//!
//! Used where no external system is wired up, e.g. `shardctl simulate`.

use crate::error::Result;
use crate::transform::PayloadTransformer;
use async_trait::async_trait;
use bytes::Bytes;
use corelib::ShardNumber;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
pub struct LoggingTransformer {
    processed: AtomicU64,
}

impl LoggingTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items seen so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PayloadTransformer for LoggingTransformer {
    async fn transform(&self, shard: ShardNumber, body: Bytes) -> Result<()> {
        self.processed.fetch_add(1, Ordering::Relaxed);
        debug!(shard = %shard, bytes = body.len(), "Work item received");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingTransformer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_items() {
        let t = LoggingTransformer::new();
        let shard = ShardNumber::new(1).unwrap();
        t.transform(shard, Bytes::from_static(b"{}")).await.unwrap();
        t.transform(shard, Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(t.processed(), 2);
        assert_eq!(t.name(), "LoggingTransformer");
    }
}
