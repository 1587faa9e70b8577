//! In-process broker.
//!
//! A [`MemoryBroker`] is a hub of queues and fan-out exchanges living in one
//! process. Each simulated worker opens its own [`MemoryConnection`]; closing
//! a connection drops all of its consumers at once, which is what a real
//! broker does when a worker process dies.
//!
//! Queues are created on first use. Messages published to a queue without
//! consumers are buffered and handed to the next subscriber. Consumers on a
//! queue are served round-robin.

use crate::broker::{Broker, ConsumerTag, Subscription};
use crate::error::{Result, StreamingError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

type ConnectionId = u64;

#[derive(Debug)]
struct Consumer {
    tag: ConsumerTag,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Debug, Default)]
struct QueueState {
    buffered: VecDeque<Bytes>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

impl QueueState {
    fn prune(&mut self) {
        self.consumers.retain(|c| !c.tx.is_closed());
    }

    /// Hand `body` to the next live consumer, or buffer it.
    fn deliver(&mut self, mut body: Bytes) {
        self.prune();
        while !self.consumers.is_empty() {
            let idx = self.cursor % self.consumers.len();
            self.cursor = self.cursor.wrapping_add(1);
            match self.consumers[idx].tx.send(body) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    body = returned;
                    self.consumers.remove(idx);
                }
            }
        }
        self.buffered.push_back(body);
    }
}

#[derive(Debug, Default)]
struct Hub {
    queues: DashMap<String, Mutex<QueueState>>,
    exchanges: DashMap<String, BTreeSet<String>>,
    next_tag: AtomicU64,
    next_connection: AtomicU64,
}

impl Hub {
    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let entry = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Mutex::new(QueueState::default()));
        let mut state = entry.lock();
        f(&mut state)
    }

    fn drop_consumers(&self, matches: impl Fn(&Consumer) -> bool) {
        for entry in self.queues.iter() {
            entry.lock().consumers.retain(|c| !matches(c));
        }
    }
}

/// Shared in-process broker. Clones refer to the same hub.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the hub.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.hub.next_connection.fetch_add(1, Ordering::Relaxed);
        MemoryConnection {
            hub: Arc::clone(&self.hub),
            id,
            closed: AtomicBool::new(false),
        }
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.hub
            .queues
            .get(queue)
            .map_or(0, |q| q.lock().buffered.len())
    }

    /// Take every message waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Bytes> {
        self.hub
            .queues
            .get(queue)
            .map_or_else(Vec::new, |q| q.lock().buffered.drain(..).collect())
    }
}

/// One client connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    hub: Arc<Hub>,
    id: ConnectionId,
    closed: AtomicBool,
}

impl MemoryConnection {
    /// Close the connection, dropping all of its consumers. Later operations
    /// on it fail.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let id = self.id;
            self.hub.drop_consumers(|c| c.connection == id);
            trace!(connection = id, "Closed memory broker connection");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StreamingError::Broker(format!(
                "connection {} is closed",
                self.id
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MemoryConnection {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.hub.with_queue(queue, |_| ());
        Ok(())
    }

    async fn declare_fanout(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.hub.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        let mut bindings = self
            .hub
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| StreamingError::QueueNotFound(exchange.to_string()))?;
        bindings.insert(queue.to_string());
        drop(bindings);
        self.hub.with_queue(queue, |_| ());
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.hub.with_queue(queue, |q| q.deliver(body));
        Ok(())
    }

    async fn publish_fanout(&self, exchange: &str, body: Bytes) -> Result<()> {
        self.ensure_open()?;
        let bound: Vec<String> = self
            .hub
            .exchanges
            .get(exchange)
            .ok_or_else(|| StreamingError::QueueNotFound(exchange.to_string()))?
            .iter()
            .cloned()
            .collect();
        for queue in bound {
            self.hub.with_queue(&queue, |q| q.deliver(body.clone()));
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let tag = self.hub.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.with_queue(queue, |q| {
            for body in q.buffered.drain(..) {
                // Receiver is alive: we hold it.
                let _ = tx.send(body);
            }
            q.consumers.push(Consumer {
                tag,
                connection: self.id,
                tx,
            });
        });
        trace!(queue, tag, "Subscribed");
        Ok(Subscription {
            queue: queue.to_string(),
            tag,
            deliveries: rx,
        })
    }

    async fn cancel(&self, tag: ConsumerTag) -> Result<()> {
        self.hub.drop_consumers(|c| c.tag == tag);
        Ok(())
    }

    async fn consumer_count(&self, queue: &str) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.hub.queues.get(queue).map_or(0, |q| {
            let mut state = q.lock();
            state.prune();
            state.consumers.len()
        }))
    }
}
