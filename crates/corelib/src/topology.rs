//! Shard ownership table.
//!
//! Each process keeps its own copy of "who claims which shards", updated by
//! applying `update_vnode_table` control messages as they arrive. Copies on
//! different processes converge once the same updates have been delivered
//! everywhere; nothing here coordinates them.
//!
//! # Leader
//!
//! The leader is derived, not elected: it is the identity claiming the lowest
//! shard number currently in the table. It is only used to decide who may
//! re-advertise orphaned shards, and different processes may briefly disagree
//! about it.
//!
//! # Duplicate claims
//!
//! Updates are complete claim sets, so the most recent update for a shard is
//! the freshest evidence of who holds it. Applying an update therefore strips
//! the claimed shards from every other identity.

use crate::node::NodeIdentity;
use crate::vnode::ShardNumber;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// What a table update does to the named identity's claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Add or replace the identity's claim set.
    #[serde(rename = "update", alias = "add")]
    Add,
    /// Drop the identity's claim set, whatever it contains.
    Remove,
}

/// Payload of an `update_vnode_table` control message.
///
/// Always the complete claim set of one identity, never a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableUpdate {
    #[serde(flatten)]
    pub identity: NodeIdentity,
    #[serde(rename = "vnodes", default)]
    pub shards: BTreeSet<ShardNumber>,
    #[serde(rename = "update")]
    pub kind: UpdateKind,
}

impl TableUpdate {
    /// Update announcing `identity`'s current claims.
    ///
    /// An empty claim set is announced as a removal.
    pub fn announce(identity: NodeIdentity, shards: BTreeSet<ShardNumber>) -> Self {
        let kind = if shards.is_empty() {
            UpdateKind::Remove
        } else {
            UpdateKind::Add
        };
        Self {
            identity,
            shards,
            kind,
        }
    }
}

/// Locally cached view of shard ownership across the cluster.
#[derive(Debug, Clone)]
pub struct ShardTable {
    local: NodeIdentity,
    claims: HashMap<NodeIdentity, BTreeSet<ShardNumber>>,
}

impl ShardTable {
    /// Empty table, as seen by the process identified by `local`.
    pub fn new(local: NodeIdentity) -> Self {
        Self {
            local,
            claims: HashMap::new(),
        }
    }

    /// Identity of the process that owns this copy of the table.
    pub fn local_identity(&self) -> &NodeIdentity {
        &self.local
    }

    /// Apply one update.
    pub fn apply(&mut self, update: &TableUpdate) {
        match update.kind {
            UpdateKind::Remove => {
                if self.claims.remove(&update.identity).is_some() {
                    debug!(node = %update.identity, "Removed node from shard table");
                }
            }
            UpdateKind::Add if update.shards.is_empty() => {
                self.claims.remove(&update.identity);
            }
            UpdateKind::Add => {
                for (other, claimed) in self.claims.iter_mut() {
                    if *other == update.identity {
                        continue;
                    }
                    let before = claimed.len();
                    claimed.retain(|s| !update.shards.contains(s));
                    if claimed.len() != before {
                        debug!(
                            from = %other,
                            to = %update.identity,
                            moved = before - claimed.len(),
                            "Resolved duplicate shard claims in favour of newest update"
                        );
                    }
                }
                self.claims.retain(|_, claimed| !claimed.is_empty());
                self.claims
                    .insert(update.identity.clone(), update.shards.clone());
                trace!(
                    node = %update.identity,
                    shards = update.shards.len(),
                    "Updated shard table"
                );
            }
        }
    }

    /// Identity claiming the globally lowest shard number, if any shard is
    /// claimed. Recomputed on every call.
    pub fn leader(&self) -> Option<&NodeIdentity> {
        self.claims
            .iter()
            .filter_map(|(node, shards)| shards.first().map(|low| (*low, node)))
            .min()
            .map(|(_, node)| node)
    }

    /// True if this process is the current leader.
    pub fn is_local_leader(&self) -> bool {
        self.leader() == Some(&self.local)
    }

    /// Every identity with at least one claim, in identity order.
    pub fn identities(&self) -> Vec<&NodeIdentity> {
        let mut nodes: Vec<_> = self.claims.keys().collect();
        nodes.sort();
        nodes
    }

    /// Claim set of `node`, if it has one.
    pub fn claims_of(&self, node: &NodeIdentity) -> Option<&BTreeSet<ShardNumber>> {
        self.claims.get(node)
    }

    /// Identity currently claiming `shard`.
    pub fn owner_of(&self, shard: ShardNumber) -> Option<&NodeIdentity> {
        self.claims
            .iter()
            .find(|(_, shards)| shards.contains(&shard))
            .map(|(node, _)| node)
    }

    /// Shards claimed by nobody, ascending.
    pub fn unclaimed(&self) -> Vec<ShardNumber> {
        ShardNumber::all()
            .filter(|s| !self.claims.values().any(|claimed| claimed.contains(s)))
            .collect()
    }

    /// `(shard, owner)` for every shard claimed by an identity other than
    /// the local one.
    pub fn remote_claims(&self) -> Vec<(ShardNumber, NodeIdentity)> {
        let mut out: Vec<_> = self
            .claims
            .iter()
            .filter(|(node, _)| **node != self.local)
            .flat_map(|(node, shards)| shards.iter().map(move |s| (*s, node.clone())))
            .collect();
        out.sort();
        out
    }

    /// Forget whoever claims `shard`. Identities left with no claims are
    /// dropped. Returns the former owner.
    pub fn mark_orphaned(&mut self, shard: ShardNumber) -> Option<NodeIdentity> {
        let owner = self.owner_of(shard)?.clone();
        if let Some(claimed) = self.claims.get_mut(&owner) {
            claimed.remove(&shard);
            if claimed.is_empty() {
                self.claims.remove(&owner);
            }
        }
        debug!(shard = %shard, former_owner = %owner, "Marked shard orphaned");
        Some(owner)
    }

    /// Number of claimed shards across all identities.
    pub fn claimed_count(&self) -> usize {
        self.claims.values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(guid: &str) -> NodeIdentity {
        NodeIdentity::new(guid, "fermi.local", 1).unwrap()
    }

    fn shards(range: std::ops::Range<u32>) -> BTreeSet<ShardNumber> {
        range.map(|n| ShardNumber::new(n).unwrap()).collect()
    }

    fn add(identity: &NodeIdentity, range: std::ops::Range<u32>) -> TableUpdate {
        TableUpdate {
            identity: identity.clone(),
            shards: shards(range),
            kind: UpdateKind::Add,
        }
    }

    #[test]
    fn test_empty_table_has_no_leader() {
        let table = ShardTable::new(node("a"));
        assert!(table.leader().is_none());
        assert!(!table.is_local_leader());
        assert_eq!(table.unclaimed().len(), 1024);
    }

    #[test]
    fn test_lowest_shard_wins_leadership() {
        let a = node("a");
        let b = node("b");
        let mut table = ShardTable::new(b.clone());
        table.apply(&add(&a, 0..512));
        table.apply(&add(&b, 512..768));

        assert_eq!(table.leader(), Some(&a));
        assert!(!table.is_local_leader());

        let mut seen_by_a = table.clone();
        seen_by_a.local = a.clone();
        assert!(seen_by_a.is_local_leader());
    }

    #[test]
    fn test_remove_drops_all_claims() {
        let a = node("a");
        let b = node("b");
        let mut table = ShardTable::new(a.clone());
        table.apply(&add(&a, 0..10));
        table.apply(&add(&b, 10..20));
        table.apply(&TableUpdate {
            identity: a.clone(),
            shards: BTreeSet::new(),
            kind: UpdateKind::Remove,
        });
        assert_eq!(table.identities(), vec![&b]);
        assert_eq!(table.leader(), Some(&b));
    }

    #[test]
    fn test_update_replaces_instead_of_merging() {
        let a = node("a");
        let mut table = ShardTable::new(a.clone());
        table.apply(&add(&a, 0..10));
        table.apply(&add(&a, 5..6));
        assert_eq!(table.claims_of(&a).unwrap().len(), 1);
    }

    #[test]
    fn test_newest_claim_wins_duplicates() {
        let a = node("a");
        let b = node("b");
        let mut table = ShardTable::new(a.clone());
        table.apply(&add(&a, 0..4));
        table.apply(&add(&b, 2..3));

        assert_eq!(table.owner_of(ShardNumber::new(2).unwrap()), Some(&b));
        let mut expected = shards(0..2);
        expected.extend(shards(3..4));
        assert_eq!(table.claims_of(&a), Some(&expected));
        assert_eq!(table.claimed_count(), 4);
    }

    #[test]
    fn test_mark_orphaned_drops_empty_identities() {
        let a = node("a");
        let b = node("b");
        let mut table = ShardTable::new(b.clone());
        table.apply(&add(&a, 0..1));
        table.apply(&add(&b, 1..2));
        assert_eq!(table.mark_orphaned(ShardNumber::new(0).unwrap()), Some(a));
        assert!(table.is_local_leader());
        assert!(table.mark_orphaned(ShardNumber::new(0).unwrap()).is_none());
        assert_eq!(table.unclaimed().len(), 1023);
    }

    #[test]
    fn test_remote_claims_skip_local() {
        let a = node("a");
        let b = node("b");
        let mut table = ShardTable::new(a.clone());
        table.apply(&add(&a, 0..2));
        table.apply(&add(&b, 2..4));
        let remote: Vec<u32> = table.remote_claims().iter().map(|(s, _)| s.get()).collect();
        assert_eq!(remote, vec![2, 3]);
    }

    #[test]
    fn test_update_wire_format() {
        let update: TableUpdate = serde_json::from_value(json!({
            "guid": "a",
            "hostname_f": "fermi.local",
            "pid": 1,
            "vnodes": [3, 1, 2],
            "update": "update"
        }))
        .unwrap();
        assert_eq!(update.identity, node("a"));
        assert_eq!(update.kind, UpdateKind::Add);
        assert_eq!(update.shards, shards(1..4));

        let encoded = serde_json::to_value(&update).unwrap();
        assert_eq!(encoded["vnodes"], json!([1, 2, 3]));
        assert_eq!(encoded["update"], json!("update"));

        let removal = TableUpdate::announce(node("a"), BTreeSet::new());
        assert_eq!(serde_json::to_value(&removal).unwrap()["update"], json!("remove"));
    }
}
