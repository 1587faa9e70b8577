//! Identity-bound control channels.
//!
//! A [`ControlChannel`] pairs a [`NodeIdentity`] with a broker connection and
//! knows the three places control traffic for that identity can go: the
//! cluster broadcast exchange, the identity's exclusive queue, and the
//! cluster-shared queue. Sends are single publishes with no retry; whatever
//! delivery guarantee the broker gives is the guarantee.

use crate::broker::Broker;
use crate::codec;
use crate::error::Result;
use crate::protocol::ControlMessage;
use bytes::Bytes;
use corelib::NodeIdentity;
use std::sync::Arc;
use tracing::trace;

/// Control endpoints of one identity on one broker connection.
#[derive(Clone)]
pub struct ControlChannel {
    identity: NodeIdentity,
    broker: Arc<dyn Broker>,
}

impl ControlChannel {
    pub fn new(identity: NodeIdentity, broker: Arc<dyn Broker>) -> Self {
        Self { identity, broker }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Declare the shared queue, broadcast exchange, and this identity's
    /// exclusive and broadcast queues (bound to the exchange).
    pub async fn declare(&self) -> Result<()> {
        let broadcast_queue = self.identity.broadcast_control_queue();
        self.broker
            .declare_queue(self.identity.shared_control_queue())
            .await?;
        self.broker
            .declare_fanout(self.identity.broadcast_control_exchange())
            .await?;
        self.broker
            .declare_queue(&self.identity.exclusive_control_queue())
            .await?;
        self.broker.declare_queue(&broadcast_queue).await?;
        self.broker
            .bind_queue(&broadcast_queue, self.identity.broadcast_control_exchange())
            .await
    }

    /// Publish a raw body to every process via the broadcast exchange.
    pub async fn send_broadcast(&self, body: Bytes) -> Result<()> {
        trace!(exchange = self.identity.broadcast_control_exchange(), "Broadcast");
        self.broker
            .publish_fanout(self.identity.broadcast_control_exchange(), body)
            .await
    }

    /// Publish a raw body to this identity's exclusive queue.
    pub async fn send_direct(&self, body: Bytes) -> Result<()> {
        let queue = self.identity.exclusive_control_queue();
        trace!(queue = %queue, "Direct send");
        self.broker.publish(&queue, body).await
    }

    /// Publish a raw body to the cluster-shared queue, where exactly one
    /// process picks it up.
    pub async fn send_shared(&self, body: Bytes) -> Result<()> {
        trace!(queue = self.identity.shared_control_queue(), "Shared send");
        self.broker
            .publish(self.identity.shared_control_queue(), body)
            .await
    }

    /// Encode and broadcast a control message.
    pub async fn broadcast(&self, message: &ControlMessage) -> Result<()> {
        self.send_broadcast(codec::encode(message)?).await
    }

    /// Encode and send a control message to this identity only.
    pub async fn direct(&self, message: &ControlMessage) -> Result<()> {
        self.send_direct(codec::encode(message)?).await
    }

    /// Encode and send a control message to the shared queue.
    pub async fn shared(&self, message: &ControlMessage) -> Result<()> {
        self.send_shared(codec::encode(message)?).await
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("identity", &self.identity)
            .finish()
    }
}
