//! Listening on an identity's control channels.

use crate::broker::{ConsumerTag, Subscription};
use crate::error::Result;
use crate::sender::ControlChannel;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Which of the three control sources a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Broadcast,
    Exclusive,
    Shared,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelKind::Broadcast => "broadcast",
            ChannelKind::Exclusive => "exclusive",
            ChannelKind::Shared => "shared",
        })
    }
}

/// Receives raw control bodies.
///
/// Called once per delivered body. Bodies from one source arrive in order;
/// there is no ordering across sources.
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn handle(&self, source: ChannelKind, body: Bytes);
}

/// Running consumers on the three control sources of one identity.
pub struct Listener {
    channel: ControlChannel,
    consumers: Vec<(ConsumerTag, JoinHandle<()>)>,
}

impl ControlChannel {
    /// Declare this identity's control topology and start consuming the
    /// broadcast, exclusive and shared queues concurrently.
    pub async fn listen(&self, handler: Arc<dyn ControlHandler>) -> Result<Listener> {
        self.declare().await?;

        let sources = [
            (ChannelKind::Broadcast, self.identity().broadcast_control_queue()),
            (ChannelKind::Exclusive, self.identity().exclusive_control_queue()),
            (
                ChannelKind::Shared,
                self.identity().shared_control_queue().to_string(),
            ),
        ];

        let mut consumers = Vec::with_capacity(sources.len());
        for (kind, queue) in sources {
            let subscription = self.broker().subscribe(&queue).await?;
            let tag = subscription.tag;
            let task = tokio::spawn(pump(kind, subscription, Arc::clone(&handler)));
            consumers.push((tag, task));
        }

        debug!(node = %self.identity(), "Listening on control channels");
        Ok(Listener {
            channel: self.clone(),
            consumers,
        })
    }
}

async fn pump(kind: ChannelKind, mut subscription: Subscription, handler: Arc<dyn ControlHandler>) {
    while let Some(body) = subscription.deliveries.recv().await {
        trace!(source = %kind, bytes = body.len(), "Control message received");
        handler.handle(kind, body).await;
    }
    trace!(source = %kind, queue = %subscription.queue, "Control subscription ended");
}

impl Listener {
    /// Cancel all three consumers and wait for in-flight handling to finish.
    pub async fn stop(self) {
        for (tag, task) in self.consumers {
            // Closed connections already dropped the consumer.
            let _ = self.channel.broker().cancel(tag).await;
            let _ = task.await;
        }
        debug!(node = %self.channel.identity(), "Stopped control listeners");
    }

    /// Drop the consumer tasks without talking to the broker.
    pub fn abort(self) {
        for (_, task) in self.consumers {
            task.abort();
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("identity", self.channel.identity())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}
