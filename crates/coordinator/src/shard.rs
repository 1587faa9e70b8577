//! Runtime virtual shard.
//!
//! A [`VirtualShard`] tries to become the only consumer of its owner queue
//! (`vnode-{n}`). Exclusivity is checked by the application, not left to the
//! broker: right after subscribing the shard counts the consumers on its
//! queue, waits one supervise interval, and counts again. Any second
//! consumer means another process already owns (or is recovering) the shard,
//! and the newcomer backs off without ever reporting itself as added. This
//! keeps a recovery advertisement that races a still-alive former owner from
//! producing two owners.
//!
//! Once active, the shard hands every work item to the payload transformer
//! and keeps re-counting consumers every interval.
//!
//! Deliveries received but not yet processed when the shard stops are put
//! back on the owner queue so the next owner sees them. They go to the back
//! of the queue, so across a handoff they may be processed after items
//! published later.

use crate::error::Result;
use crate::transform::PayloadTransformer;
use async_trait::async_trait;
use bytes::Bytes;
use corelib::{ShardNumber, ShardState};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streaming::{Broker, ConsumerTag};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Receives shard lifecycle callbacks. Implemented by the supervisor.
#[async_trait]
pub trait ShardObserver: Send + Sync + 'static {
    /// `shard` won exclusive consumption and is now active.
    async fn shard_added(&self, shard: ShardNumber);

    /// `shard` stopped, for whatever reason, after having been started.
    async fn shard_removed(&self, shard: ShardNumber);
}

/// How a call to [`VirtualShard::start`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Exclusive consumer; the observer has been told.
    Active,
    /// Another consumer was detected; the shard is stopped and the observer
    /// was not told.
    Conflict,
    /// `stop()` was called before the detection interval elapsed.
    Cancelled,
}

struct ShardInner {
    number: ShardNumber,
    broker: Arc<dyn Broker>,
    observer: Arc<dyn ShardObserver>,
    transformer: Arc<dyn PayloadTransformer>,
    supervise_interval: Duration,
    state: Mutex<ShardState>,
    consumer: Mutex<Option<ConsumerTag>>,
    stop_tx: watch::Sender<bool>,
    /// Set by `abandon()`: exit without requeueing or notifying.
    abandoned: AtomicBool,
}

/// One virtual shard owned by one supervisor. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct VirtualShard {
    inner: Arc<ShardInner>,
}

impl VirtualShard {
    pub fn new(
        number: ShardNumber,
        broker: Arc<dyn Broker>,
        observer: Arc<dyn ShardObserver>,
        transformer: Arc<dyn PayloadTransformer>,
        supervise_interval: Duration,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ShardInner {
                number,
                broker,
                observer,
                transformer,
                supervise_interval,
                state: Mutex::new(ShardState::Stopped),
                consumer: Mutex::new(None),
                stop_tx,
                abandoned: AtomicBool::new(false),
            }),
        }
    }

    pub fn number(&self) -> ShardNumber {
        self.inner.number
    }

    pub fn state(&self) -> ShardState {
        *self.inner.state.lock()
    }

    /// Queue carrying this shard's work items.
    pub fn owner_queue(&self) -> String {
        self.inner.number.owner_queue()
    }

    /// Queue carrying control traffic for this shard.
    pub fn control_queue(&self) -> String {
        self.inner.number.control_queue()
    }

    /// True if `other` is a handle to the same shard instance.
    pub fn same_instance(&self, other: &VirtualShard) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to the owner queue and try to win exclusive consumption.
    ///
    /// Returns once the outcome is known, i.e. after at least one supervise
    /// interval when no competitor shows up.
    ///
    /// # Errors
    ///
    /// Fails if the shard is not `Stopped`, or if the broker fails before
    /// the shard became active (the shard is left `Stopped`).
    pub async fn start(&self) -> Result<StartOutcome> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            *state = state.transition(inner.number, ShardState::Starting)?;
        }
        inner.abandoned.store(false, Ordering::SeqCst);
        inner.stop_tx.send_replace(false);
        let mut stop_rx = inner.stop_tx.subscribe();
        let queue = self.owner_queue();
        debug!(shard = %inner.number, "Starting virtual shard");

        let subscription = match self.subscribe(&queue).await {
            Ok(sub) => sub,
            Err(e) => {
                self.abandon_start();
                return Err(e);
            }
        };
        let tag = subscription.tag;
        let mut deliveries = subscription.deliveries;
        *inner.consumer.lock() = Some(tag);

        match self.has_competitor(&queue).await {
            Ok(true) => return Ok(self.back_off(tag, deliveries).await),
            Ok(false) => {}
            Err(e) => {
                self.cancel_consumer(tag, &mut deliveries).await;
                self.abandon_start();
                return Err(e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.supervise_interval) => {}
            _ = stop_rx.changed() => {
                // stop() may have run before the tag was recorded.
                self.cancel_consumer(tag, &mut deliveries).await;
                return Ok(StartOutcome::Cancelled);
            }
        }

        match self.has_competitor(&queue).await {
            Ok(true) => return Ok(self.back_off(tag, deliveries).await),
            Ok(false) => {}
            Err(e) => {
                self.cancel_consumer(tag, &mut deliveries).await;
                self.abandon_start();
                return Err(e);
            }
        }

        {
            let mut state = inner.state.lock();
            if *state == ShardState::Starting {
                *state = ShardState::Active;
            }
        }
        if self.state() != ShardState::Active {
            // stop() got in between the last check and here.
            self.cancel_consumer(tag, &mut deliveries).await;
            return Ok(StartOutcome::Cancelled);
        }

        info!(shard = %inner.number, "Virtual shard active");
        inner.observer.shard_added(inner.number).await;
        tokio::spawn(self.clone().run(tag, deliveries, stop_rx));
        Ok(StartOutcome::Active)
    }

    /// Stop consuming. Idempotent; a no-op on a stopped shard.
    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            match *state {
                ShardState::Stopped | ShardState::Stopping => return,
                _ => *state = ShardState::Stopping,
            }
        }
        debug!(shard = %inner.number, "Stopping virtual shard");

        inner.stop_tx.send_replace(true);
        let tag = inner.consumer.lock().take();
        if let Some(tag) = tag {
            if let Err(e) = inner.broker.cancel(tag).await {
                warn!(shard = %inner.number, error = %e, "Failed to cancel shard consumer");
            }
        }

        *inner.state.lock() = ShardState::Stopped;
        info!(shard = %inner.number, "Virtual shard stopped");
        inner.observer.shard_removed(inner.number).await;
    }

    /// Stop processing as a crashed process would: the task exits, nothing
    /// is requeued, the consumer is left for the broker to reap and the
    /// observer is not told.
    pub fn abandon(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = ShardState::Stopped;
        }
        inner.abandoned.store(true, Ordering::SeqCst);
        inner.consumer.lock().take();
        inner.stop_tx.send_replace(true);
        debug!(shard = %inner.number, "Abandoned virtual shard");
    }

    async fn subscribe(&self, queue: &str) -> Result<streaming::Subscription> {
        self.inner.broker.declare_queue(queue).await?;
        Ok(self.inner.broker.subscribe(queue).await?)
    }

    async fn has_competitor(&self, queue: &str) -> Result<bool> {
        Ok(self.inner.broker.consumer_count(queue).await? > 1)
    }

    /// Lost the race during startup: give the queue back without telling
    /// the observer.
    async fn back_off(
        &self,
        tag: ConsumerTag,
        mut deliveries: mpsc::UnboundedReceiver<Bytes>,
    ) -> StartOutcome {
        let inner = &self.inner;
        let lost_race = {
            let mut state = inner.state.lock();
            if *state == ShardState::Starting {
                *state = ShardState::Stopped;
                true
            } else {
                false
            }
        };
        self.cancel_consumer(tag, &mut deliveries).await;
        if !lost_race {
            return StartOutcome::Cancelled;
        }
        warn!(shard = %inner.number, "extra consumers detected, backing off");
        metrics::counter!("virtual_shard.conflicts").increment(1);
        StartOutcome::Conflict
    }

    fn abandon_start(&self) {
        let mut state = self.inner.state.lock();
        if *state == ShardState::Starting {
            *state = ShardState::Stopped;
        }
        self.inner.consumer.lock().take();
    }

    async fn cancel_consumer(
        &self,
        tag: ConsumerTag,
        deliveries: &mut mpsc::UnboundedReceiver<Bytes>,
    ) {
        self.inner.consumer.lock().take();
        if let Err(e) = self.inner.broker.cancel(tag).await {
            warn!(shard = %self.inner.number, error = %e, "Failed to cancel shard consumer");
        }
        self.requeue_pending(deliveries).await;
    }

    /// Put deliveries this consumer received but never processed back on the
    /// owner queue.
    async fn requeue_pending(&self, deliveries: &mut mpsc::UnboundedReceiver<Bytes>) {
        deliveries.close();
        let queue = self.owner_queue();
        let mut requeued = 0usize;
        while let Ok(body) = deliveries.try_recv() {
            match self.inner.broker.publish(&queue, body).await {
                Ok(()) => requeued += 1,
                Err(e) => {
                    warn!(shard = %self.inner.number, error = %e, "Dropped pending work item");
                }
            }
        }
        if requeued > 0 {
            debug!(shard = %self.inner.number, requeued, "Requeued pending work items");
        }
    }

    /// Active loop: process work items and keep checking exclusivity.
    async fn run(
        self,
        tag: ConsumerTag,
        mut deliveries: mpsc::UnboundedReceiver<Bytes>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let inner = Arc::clone(&self.inner);
        let queue = self.owner_queue();
        let mut ticker = tokio::time::interval(inner.supervise_interval);
        // The first tick completes immediately; startup just checked.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    if !inner.abandoned.load(Ordering::SeqCst) {
                        self.requeue_pending(&mut deliveries).await;
                    }
                    return;
                }
                delivery = deliveries.recv() => match delivery {
                    Some(body) => self.process(body).await,
                    None => {
                        warn!(shard = %inner.number, "Shard subscription ended unexpectedly");
                        self.lose_ownership().await;
                        return;
                    }
                },
                _ = ticker.tick() => match self.has_competitor(&queue).await {
                    Ok(false) => {}
                    Ok(true) => {
                        warn!(shard = %inner.number, "extra consumers detected, releasing shard");
                        metrics::counter!("virtual_shard.conflicts").increment(1);
                        self.cancel_consumer(tag, &mut deliveries).await;
                        self.lose_ownership().await;
                        return;
                    }
                    Err(e) => {
                        warn!(shard = %inner.number, error = %e, "Cannot verify shard exclusivity, releasing shard");
                        self.cancel_consumer(tag, &mut deliveries).await;
                        self.lose_ownership().await;
                        return;
                    }
                },
            }
        }
    }

    async fn process(&self, body: Bytes) {
        let inner = &self.inner;
        match inner.transformer.transform(inner.number, body).await {
            Ok(()) => metrics::counter!("virtual_shard.items_processed").increment(1),
            Err(e) => warn!(
                shard = %inner.number,
                transformer = inner.transformer.name(),
                error = %e,
                "Work item failed"
            ),
        }
    }

    /// `Active -> Stopped` without going through `stop()`.
    async fn lose_ownership(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != ShardState::Active {
                return;
            }
            *state = ShardState::Stopped;
        }
        self.inner.consumer.lock().take();
        self.inner.observer.shard_removed(self.inner.number).await;
    }
}

impl fmt::Debug for VirtualShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualShard")
            .field("number", &self.inner.number)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::LoggingTransformer;
    use streaming::MemoryBroker;

    #[derive(Default)]
    struct Events {
        added: Mutex<Vec<ShardNumber>>,
        removed: Mutex<Vec<ShardNumber>>,
    }

    #[async_trait]
    impl ShardObserver for Events {
        async fn shard_added(&self, shard: ShardNumber) {
            self.added.lock().push(shard);
        }

        async fn shard_removed(&self, shard: ShardNumber) {
            self.removed.lock().push(shard);
        }
    }

    const INTERVAL: Duration = Duration::from_millis(30);

    fn shard(broker: &MemoryBroker, events: &Arc<Events>, n: u32) -> VirtualShard {
        VirtualShard::new(
            ShardNumber::new(n).unwrap(),
            Arc::new(broker.connect()),
            events.clone(),
            Arc::new(LoggingTransformer::new()),
            INTERVAL,
        )
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let vnode = shard(&broker, &events, 5);
        assert_eq!(vnode.owner_queue(), "vnode-5");
        assert_eq!(vnode.control_queue(), "vnode-5-control");

        assert_eq!(vnode.start().await.unwrap(), StartOutcome::Active);
        assert_eq!(vnode.state(), ShardState::Active);
        assert_eq!(*events.added.lock(), vec![ShardNumber::new(5).unwrap()]);

        vnode.stop().await;
        assert_eq!(vnode.state(), ShardState::Stopped);
        assert_eq!(*events.removed.lock(), vec![ShardNumber::new(5).unwrap()]);

        // Stopping again is a no-op.
        vnode.stop().await;
        assert_eq!(events.removed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let vnode = shard(&broker, &events, 6);
        vnode.start().await.unwrap();
        assert!(vnode.start().await.is_err());
        vnode.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let vnode = shard(&broker, &events, 8);
        vnode.start().await.unwrap();
        vnode.stop().await;
        assert_eq!(vnode.start().await.unwrap(), StartOutcome::Active);
        assert_eq!(events.added.lock().len(), 2);
        vnode.stop().await;
    }

    #[tokio::test]
    async fn test_stop_during_startup_cancels() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let vnode = shard(&broker, &events, 7);
        let starter = vnode.clone();
        let handle = tokio::spawn(async move { starter.start().await });
        tokio::time::sleep(INTERVAL / 3).await;
        vnode.stop().await;

        assert_eq!(handle.await.unwrap().unwrap(), StartOutcome::Cancelled);
        assert_eq!(vnode.state(), ShardState::Stopped);
        assert!(events.added.lock().is_empty());
    }

    #[tokio::test]
    async fn test_active_shard_processes_work() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let transformer = Arc::new(LoggingTransformer::new());
        let vnode = VirtualShard::new(
            ShardNumber::new(9).unwrap(),
            Arc::new(broker.connect()),
            events.clone(),
            transformer.clone(),
            INTERVAL,
        );
        let producer = broker.connect();
        producer.publish("vnode-9", Bytes::from_static(b"queued")).await.unwrap();

        vnode.start().await.unwrap();
        producer.publish("vnode-9", Bytes::from_static(b"live")).await.unwrap();
        tokio::time::sleep(INTERVAL).await;

        assert_eq!(transformer.processed(), 2);
        vnode.stop().await;
    }

    #[tokio::test]
    async fn test_stop_requeues_pending_items_behind_newer_ones() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let transformer = Arc::new(LoggingTransformer::new());
        let vnode = VirtualShard::new(
            ShardNumber::new(10).unwrap(),
            Arc::new(broker.connect()),
            events.clone(),
            transformer.clone(),
            INTERVAL,
        );
        vnode.start().await.unwrap();

        // Received by the shard, but it stops before getting to it.
        let producer = broker.connect();
        producer.publish("vnode-10", Bytes::from_static(b"older")).await.unwrap();
        vnode.stop().await;
        producer.publish("vnode-10", Bytes::from_static(b"newer")).await.unwrap();
        tokio::time::sleep(INTERVAL).await;

        assert_eq!(transformer.processed(), 0);
        assert_eq!(
            broker.drain("vnode-10"),
            vec![Bytes::from_static(b"newer"), Bytes::from_static(b"older")]
        );
    }

    #[tokio::test]
    async fn test_active_shard_yields_to_late_competitor() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let vnode = shard(&broker, &events, 11);
        vnode.start().await.unwrap();

        // A consumer that never backs off, e.g. a misbehaving peer.
        let rogue = broker.connect();
        let _sub = rogue.subscribe("vnode-11").await.unwrap();
        tokio::time::sleep(INTERVAL * 3).await;

        assert_eq!(vnode.state(), ShardState::Stopped);
        assert_eq!(*events.removed.lock(), vec![ShardNumber::new(11).unwrap()]);
    }

    #[tokio::test]
    async fn test_closed_connection_drops_ownership() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let conn = Arc::new(broker.connect());
        let vnode = VirtualShard::new(
            ShardNumber::new(12).unwrap(),
            conn.clone(),
            events.clone(),
            Arc::new(LoggingTransformer::new()),
            INTERVAL,
        );
        vnode.start().await.unwrap();
        conn.close();
        tokio::time::sleep(INTERVAL).await;

        assert_eq!(vnode.state(), ShardState::Stopped);
        assert_eq!(events.removed.lock().len(), 1);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_second_instance_detects_owner_and_stays_stopped() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let broker = MemoryBroker::new();
        let owner_events = Arc::new(Events::default());
        let loser_events = Arc::new(Events::default());
        let owner = shard(&broker, &owner_events, 42);
        let loser = shard(&broker, &loser_events, 42);

        assert_eq!(owner.start().await.unwrap(), StartOutcome::Active);
        assert_eq!(loser.start().await.unwrap(), StartOutcome::Conflict);

        assert_eq!(loser.state(), ShardState::Stopped);
        assert!(loser_events.added.lock().is_empty());
        assert!(loser_events.removed.lock().is_empty());
        assert_eq!(owner.state(), ShardState::Active);
        let logs = String::from_utf8_lossy(&captured.0.lock()).into_owned();
        assert!(logs.contains("extra consumers"));

        owner.stop().await;
    }

    #[tokio::test]
    async fn test_abandon_exits_silently() {
        let broker = MemoryBroker::new();
        let events = Arc::new(Events::default());
        let transformer = Arc::new(LoggingTransformer::new());
        let vnode = VirtualShard::new(
            ShardNumber::new(13).unwrap(),
            Arc::new(broker.connect()),
            events.clone(),
            transformer.clone(),
            INTERVAL,
        );
        vnode.start().await.unwrap();

        vnode.abandon();
        assert_eq!(vnode.state(), ShardState::Stopped);
        tokio::time::sleep(INTERVAL).await;

        // The task is gone: new work waits on the queue for the next owner.
        let producer = broker.connect();
        producer.publish("vnode-13", Bytes::from_static(b"late")).await.unwrap();
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(transformer.processed(), 0);
        assert_eq!(broker.queue_depth("vnode-13"), 1);
        assert!(events.removed.lock().is_empty());

        // A later stop has nothing left to do.
        vnode.stop().await;
        assert!(events.removed.lock().is_empty());
    }
}
