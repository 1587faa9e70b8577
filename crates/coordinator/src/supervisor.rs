//! Per-process shard supervisor.
//!
//! The supervisor owns this process's virtual shards, listens on the local
//! identity's control channels, keeps the local [`ShardTable`] current, and
//! runs recovery when the table says this process is leader.
//!
//! # Announcements
//!
//! Every change to the set of active local shards is broadcast as a complete
//! `update_vnode_table` for the local identity (a `remove` once the set is
//! empty). Announcements are serialized so they leave in the same order the
//! set changed; the local table learns about them the same way every other
//! process does, through the broadcast queue.
//!
//! # Recovery
//!
//! `recover_vnode` is acted on only by the process that currently believes it
//! is leader. The leader advertises the shard on the shared queue as
//! `claim_vnode`; the broker hands that to exactly one listening process,
//! which spawns the shard. Advertisements are debounced per shard.
//!
//! With an orphan sweep configured, each process also periodically drops
//! table claims whose queue has no live consumer (the claimant died without
//! saying goodbye) and, if leader, recovers every unclaimed shard.

use crate::config::SupervisorSettings;
use crate::debounce::RecoveryDebounce;
use crate::error::Result;
use crate::shard::{ShardObserver, StartOutcome, VirtualShard};
use crate::transform::PayloadTransformer;
use async_trait::async_trait;
use bytes::Bytes;
use corelib::{NodeIdentity, ShardNumber, ShardState, ShardTable, TableUpdate};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use streaming::{codec, Broker, ChannelKind, ControlChannel, ControlHandler, ControlMessage, Listener};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

struct SupervisorInner {
    channel: ControlChannel,
    settings: SupervisorSettings,
    transformer: Arc<dyn PayloadTransformer>,
    table: Mutex<ShardTable>,
    local_shards: Mutex<BTreeSet<ShardNumber>>,
    shards: Mutex<HashMap<ShardNumber, VirtualShard>>,
    debounce: Mutex<RecoveryDebounce>,
    /// Serializes "mutate local_shards + broadcast" so announcements leave
    /// in order.
    announce_lock: tokio::sync::Mutex<()>,
    listener: Mutex<Option<Listener>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<SupervisorInner>,
}

/// The per-process shard agent. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ShardSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ShardSupervisor {
    /// Supervisor for `identity`, talking to the cluster through `broker`.
    pub fn new(
        identity: NodeIdentity,
        broker: Arc<dyn Broker>,
        transformer: Arc<dyn PayloadTransformer>,
        settings: SupervisorSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak_self| SupervisorInner {
            channel: ControlChannel::new(identity.clone(), broker),
            settings,
            transformer,
            table: Mutex::new(ShardTable::new(identity)),
            local_shards: Mutex::new(BTreeSet::new()),
            shards: Mutex::new(HashMap::new()),
            debounce: Mutex::new(RecoveryDebounce::new(settings.recovery_cooldown)),
            announce_lock: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
            sweeper: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.inner.channel.identity()
    }

    /// Control endpoints of the local identity.
    pub fn channel(&self) -> &ControlChannel {
        &self.inner.channel
    }

    /// Listen on the local control channels, then spawn `initial` shards.
    pub async fn start(&self, initial: impl IntoIterator<Item = ShardNumber>) -> Result<()> {
        self.listen().await?;

        let mut count = 0usize;
        for shard in initial {
            self.spawn(shard);
            count += 1;
        }
        info!(node = %self.identity(), shards = count, "Shard supervisor started");
        Ok(())
    }

    /// Start a virtual shard for `shard` in the background, unless one is
    /// already running here.
    pub fn spawn(&self, shard: ShardNumber) {
        self.inner.spawn(shard);
    }

    /// Decode and dispatch one raw control body. Malformed bodies are logged
    /// and dropped.
    pub async fn process_control_message(&self, body: &[u8]) {
        self.inner.process_control_message(body).await;
    }

    /// Dispatch one decoded control message.
    pub async fn dispatch(&self, message: ControlMessage) {
        self.inner.dispatch(message).await;
    }

    /// Run the leader-gated, debounced recovery path for `shard`. Returns
    /// `true` if an advertisement was published.
    pub async fn recover(&self, shard: ShardNumber) -> bool {
        self.inner.recover(shard).await
    }

    /// One pass of the orphan sweep.
    pub async fn sweep_orphans(&self) {
        self.inner.sweep_orphans().await;
    }

    /// Ask the leader (whoever it is) to recover `shard`.
    pub async fn request_recovery(&self, shard: ShardNumber) -> Result<()> {
        self.inner
            .channel
            .broadcast(&ControlMessage::RecoverShard { shard })
            .await?;
        Ok(())
    }

    /// Shards currently active under this process.
    pub fn local_shards(&self) -> BTreeSet<ShardNumber> {
        self.inner.local_shards.lock().clone()
    }

    /// Snapshot of the local shard table.
    pub fn table(&self) -> ShardTable {
        self.inner.table.lock().clone()
    }

    /// True if the local table says this process is leader.
    pub fn is_leader(&self) -> bool {
        self.inner.table.lock().is_local_leader()
    }

    /// State of the local shard instance for `shard`, if there is one.
    pub fn shard_state(&self, shard: ShardNumber) -> Option<ShardState> {
        self.inner.shards.lock().get(&shard).map(VirtualShard::state)
    }

    /// Stop every local shard. Each stop is announced.
    pub async fn release_all(&self) {
        self.inner.release_all().await;
    }

    /// Re-run the full start sequence after the broker connection was
    /// re-established: listen on the control channels again, then restart
    /// every shard this process still held. Claims are re-announced as the
    /// shards become active again.
    ///
    /// Shards that already noticed the lost connection have been announced
    /// as removed; the orphan sweep recovers those.
    pub async fn resync(&self) -> Result<()> {
        let held: BTreeSet<ShardNumber> = {
            let mut held = self.inner.local_shards.lock().clone();
            held.extend(self.inner.shards.lock().keys().copied());
            held
        };
        info!(node = %self.identity(), shards = held.len(), "Resyncing local shards");
        self.inner.release_all().await;
        self.listen().await?;
        for shard in held {
            self.spawn(shard);
        }
        Ok(())
    }

    /// Stop listening, then stop all local shards (announcing the final
    /// removal).
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
        self.inner.release_all().await;
        info!(node = %self.identity(), "Shard supervisor shut down");
    }

    /// Stop listening and halt every shard task without announcing
    /// anything, as a crashed process would.
    pub fn abandon(&self) {
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        let shards: Vec<VirtualShard> = self.inner.shards.lock().drain().map(|(_, s)| s).collect();
        for shard in shards {
            shard.abandon();
        }
        self.inner.local_shards.lock().clear();
    }

    /// (Re)subscribe to the control channels and (re)start the sweep.
    async fn listen(&self) -> Result<()> {
        let handler: Arc<dyn ControlHandler> = Arc::clone(&self.inner) as Arc<dyn ControlHandler>;
        let listener = self.inner.channel.listen(handler).await?;
        if let Some(previous) = self.inner.listener.lock().replace(listener) {
            // Its consumers are gone with the old connection.
            previous.abort();
        }

        if let Some(period) = self.inner.settings.orphan_sweep_period() {
            let task = tokio::spawn(sweep_loop(Arc::downgrade(&self.inner), period));
            if let Some(previous) = self.inner.sweeper.lock().replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }
}

impl SupervisorInner {
    fn strong(&self) -> Option<Arc<SupervisorInner>> {
        self.weak_self.upgrade()
    }

    fn spawn(&self, number: ShardNumber) {
        let Some(this) = self.strong() else {
            return;
        };

        let shard = {
            let mut shards = self.shards.lock();
            if let Some(existing) = shards.get(&number) {
                if !existing.state().is_terminal() {
                    debug!(shard = %number, state = %existing.state(), "Shard already running locally");
                    return;
                }
            }
            let shard = VirtualShard::new(
                number,
                Arc::clone(self.channel.broker()),
                Arc::clone(&this) as Arc<dyn ShardObserver>,
                Arc::clone(&self.transformer),
                self.settings.supervise_interval,
            );
            shards.insert(number, shard.clone());
            shard
        };

        tokio::spawn(async move {
            let outcome = shard.start().await;
            match &outcome {
                Ok(StartOutcome::Active) => {
                    if !this.is_registered(&shard) {
                        // Released before it became active.
                        debug!(shard = %number, "Shard released while starting, stopping it");
                        shard.stop().await;
                    }
                    return;
                }
                Ok(StartOutcome::Conflict) => {
                    debug!(shard = %number, "Shard owned elsewhere, not claiming")
                }
                Ok(StartOutcome::Cancelled) => {}
                Err(e) => warn!(shard = %number, error = %e, "Failed to start shard"),
            }
            this.forget(&shard);
        });
    }

    fn is_registered(&self, shard: &VirtualShard) -> bool {
        self.shards
            .lock()
            .get(&shard.number())
            .map_or(false, |current| current.same_instance(shard))
    }

    /// Drop the handle for `shard` if it is still the registered instance.
    fn forget(&self, shard: &VirtualShard) {
        let mut shards = self.shards.lock();
        if shards
            .get(&shard.number())
            .map_or(false, |current| current.same_instance(shard))
        {
            shards.remove(&shard.number());
        }
    }

    async fn process_control_message(&self, body: &[u8]) {
        match codec::decode(body) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                warn!(
                    node = %self.channel.identity(),
                    error = %e,
                    body = %String::from_utf8_lossy(body),
                    "Dropping malformed control message"
                );
            }
        }
    }

    async fn dispatch(&self, message: ControlMessage) {
        metrics::counter!("shard_supervisor.control_messages", "action" => message.action())
            .increment(1);
        trace!(action = message.action(), "Dispatching control message");

        match message {
            ControlMessage::UpdateTable { data } => {
                self.table.lock().apply(&data);
            }
            ControlMessage::RecoverShard { shard } => {
                self.recover(shard).await;
            }
            ControlMessage::ClaimShard { shard } => {
                info!(shard = %shard, "Claiming advertised shard");
                self.spawn(shard);
            }
            ControlMessage::ReleaseShards => {
                info!(node = %self.channel.identity(), "Releasing all local shards");
                self.release_all().await;
            }
            ControlMessage::PublishTable => {
                // Reserved for full-table gossip.
                debug!("Ignoring vnode_table_publish");
            }
            ControlMessage::Unknown => {
                trace!("Ignoring control message with unknown action");
            }
        }
    }

    async fn recover(&self, shard: ShardNumber) -> bool {
        if !self.table.lock().is_local_leader() {
            trace!(shard = %shard, "Not leader, ignoring recovery request");
            return false;
        }

        if !self.debounce.lock().try_advertise(shard, Instant::now()) {
            debug!(shard = %shard, "Recovery advertised recently, suppressing");
            metrics::counter!("shard_supervisor.recoveries_suppressed").increment(1);
            return false;
        }

        match self.channel.shared(&ControlMessage::ClaimShard { shard }).await {
            Ok(()) => {
                info!(shard = %shard, "Advertised orphaned shard");
                metrics::counter!("shard_supervisor.recoveries_advertised").increment(1);
                true
            }
            Err(e) => {
                warn!(shard = %shard, error = %e, "Failed to advertise orphaned shard");
                false
            }
        }
    }

    async fn sweep_orphans(&self) {
        let broker = Arc::clone(self.channel.broker());

        let remote = self.table.lock().remote_claims();
        for (shard, owner) in remote {
            match broker.consumer_count(&shard.owner_queue()).await {
                Ok(0) => {
                    let mut table = self.table.lock();
                    // The owner may have re-announced while we were asking.
                    if table.owner_of(shard) == Some(&owner) {
                        table.mark_orphaned(shard);
                        debug!(shard = %shard, former_owner = %owner, "Claimed shard has no consumer");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Orphan sweep aborted");
                    return;
                }
            }
        }

        if !self.table.lock().is_local_leader() {
            return;
        }

        let candidates: Vec<ShardNumber> = {
            let table = self.table.lock();
            let running = self.shards.lock();
            table
                .unclaimed()
                .into_iter()
                .filter(|s| !running.contains_key(s))
                .collect()
        };
        for shard in candidates {
            match broker.consumer_count(&shard.owner_queue()).await {
                Ok(0) => {
                    self.recover(shard).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Orphan sweep aborted");
                    return;
                }
            }
        }
    }

    async fn release_all(&self) {
        let shards: Vec<VirtualShard> = self.shards.lock().drain().map(|(_, s)| s).collect();
        for shard in shards {
            shard.stop().await;
        }
    }

    /// Apply `change` to the local shard set and, if it changed, broadcast
    /// the complete new set.
    async fn update_local_shards(&self, change: impl FnOnce(&mut BTreeSet<ShardNumber>) -> bool) {
        let _ordered = self.announce_lock.lock().await;
        let snapshot = {
            let mut local = self.local_shards.lock();
            if !change(&mut local) {
                return;
            }
            local.clone()
        };

        let update = TableUpdate::announce(self.channel.identity().clone(), snapshot);
        debug!(
            shards = update.shards.len(),
            kind = ?update.kind,
            "Announcing local shard claims"
        );
        if let Err(e) = self
            .channel
            .broadcast(&ControlMessage::UpdateTable { data: update })
            .await
        {
            warn!(error = %e, "Failed to announce local shard claims");
        }
    }
}

#[async_trait]
impl ShardObserver for SupervisorInner {
    async fn shard_added(&self, shard: ShardNumber) {
        self.update_local_shards(|local| local.insert(shard)).await;
    }

    async fn shard_removed(&self, shard: ShardNumber) {
        self.update_local_shards(|local| local.remove(&shard)).await;
        let mut shards = self.shards.lock();
        if shards
            .get(&shard)
            .map_or(false, |s| s.state().is_terminal())
        {
            shards.remove(&shard);
        }
    }
}

#[async_trait]
impl ControlHandler for SupervisorInner {
    async fn handle(&self, source: ChannelKind, body: Bytes) {
        trace!(source = %source, "Control message");
        self.process_control_message(&body).await;
    }
}

async fn sweep_loop(inner: Weak<SupervisorInner>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    // Give initial claims a period to be announced.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.sweep_orphans().await;
    }
}

impl fmt::Debug for ShardSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardSupervisor")
            .field("identity", self.identity())
            .field("local_shards", &self.inner.local_shards.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrphanSweep;
    use crate::transform::LoggingTransformer;
    use corelib::node::SHARED_CONTROL_QUEUE;
    use std::time::Duration;
    use streaming::MemoryBroker;

    fn shard(n: u32) -> ShardNumber {
        ShardNumber::new(n).unwrap()
    }

    fn node(name: &str) -> NodeIdentity {
        NodeIdentity::new(format!("guid-{}", name), name, 1).unwrap()
    }

    fn claims(shards: &[u32]) -> BTreeSet<ShardNumber> {
        shards.iter().copied().map(shard).collect()
    }

    /// A supervisor that is not listening, so anything it publishes on the
    /// shared queue stays there.
    fn idle_supervisor(broker: &MemoryBroker, name: &str, cooldown: Duration) -> ShardSupervisor {
        ShardSupervisor::new(
            node(name),
            Arc::new(broker.connect()),
            Arc::new(LoggingTransformer::new()),
            SupervisorSettings {
                supervise_interval: Duration::from_millis(30),
                recovery_cooldown: cooldown,
                orphan_sweep: OrphanSweep::Disabled,
            },
        )
    }

    async fn announce(supervisor: &ShardSupervisor, name: &str, shards: &[u32]) {
        supervisor
            .dispatch(ControlMessage::UpdateTable {
                data: TableUpdate::announce(node(name), claims(shards)),
            })
            .await;
    }

    #[tokio::test]
    async fn test_update_table_changes_leader() {
        let broker = MemoryBroker::new();
        let a = idle_supervisor(&broker, "alpha", Duration::ZERO);
        assert!(!a.is_leader());

        announce(&a, "alpha", &[10, 11]).await;
        assert!(a.is_leader());

        announce(&a, "beta", &[3]).await;
        assert!(!a.is_leader());
        assert_eq!(a.table().leader(), Some(&node("beta")));

        announce(&a, "beta", &[]).await;
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn test_non_leader_does_not_advertise() {
        let broker = MemoryBroker::new();
        let a = idle_supervisor(&broker, "alpha", Duration::ZERO);
        announce(&a, "beta", &[0]).await;
        announce(&a, "alpha", &[1]).await;

        a.dispatch(ControlMessage::RecoverShard { shard: shard(7) })
            .await;
        assert!(!a.recover(shard(7)).await);
        assert_eq!(broker.queue_depth(SHARED_CONTROL_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_no_leader_without_claims() {
        let broker = MemoryBroker::new();
        let a = idle_supervisor(&broker, "alpha", Duration::ZERO);
        assert!(!a.recover(shard(7)).await);
        assert_eq!(broker.queue_depth(SHARED_CONTROL_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_leader_advertises_once_per_request() {
        let broker = MemoryBroker::new();
        let a = idle_supervisor(&broker, "alpha", Duration::ZERO);
        announce(&a, "alpha", &[0]).await;
        announce(&a, "beta", &[1]).await;

        a.dispatch(ControlMessage::RecoverShard { shard: shard(7) })
            .await;
        assert_eq!(broker.queue_depth(SHARED_CONTROL_QUEUE), 1);
        a.dispatch(ControlMessage::RecoverShard { shard: shard(7) })
            .await;
        assert_eq!(broker.queue_depth(SHARED_CONTROL_QUEUE), 2);

        let published: Vec<ControlMessage> = broker
            .drain(SHARED_CONTROL_QUEUE)
            .iter()
            .map(|body| codec::decode(body).unwrap())
            .collect();
        assert_eq!(
            published,
            vec![
                ControlMessage::ClaimShard { shard: shard(7) },
                ControlMessage::ClaimShard { shard: shard(7) },
            ]
        );
    }

    #[tokio::test]
    async fn test_recovery_is_debounced_per_shard() {
        let broker = MemoryBroker::new();
        let a = idle_supervisor(&broker, "alpha", Duration::from_secs(60));
        announce(&a, "alpha", &[0]).await;

        assert!(a.recover(shard(7)).await);
        assert!(!a.recover(shard(7)).await);
        assert!(a.recover(shard(8)).await);
        assert_eq!(broker.queue_depth(SHARED_CONTROL_QUEUE), 2);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_leave_table_alone() {
        let broker = MemoryBroker::new();
        let a = idle_supervisor(&broker, "alpha", Duration::ZERO);
        announce(&a, "alpha", &[0]).await;

        a.process_control_message(b"{not json").await;
        a.process_control_message(br#"{"action":"rebalance","weight":3}"#)
            .await;
        a.process_control_message(br#"{"action":"vnode_table_publish"}"#)
            .await;

        let table = a.table();
        assert_eq!(table.claims_of(&node("alpha")), Some(&claims(&[0])));
        assert_eq!(table.claimed_count(), 1);
        assert_eq!(broker.queue_depth(SHARED_CONTROL_QUEUE), 0);
    }
}
