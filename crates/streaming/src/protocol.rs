//! Control protocol messages.
//!
//! Control messages are JSON objects tagged by an `action` field:
//!
//! ```text
//! {"action": "update_vnode_table", "data": {"guid": "...", "hostname_f": "...", "pid": 12345, "vnodes": [0,1,2], "update": "update"}}
//! {"action": "recover_vnode", "vnode_id": 23}
//! {"action": "claim_vnode", "vnode_id": 23}
//! {"action": "release_vnodes"}
//! {"action": "vnode_table_publish"}
//! ```
//!
//! Bodies are decoded once, at the broker boundary, into [`ControlMessage`].
//! Actions this revision does not know decode to [`ControlMessage::Unknown`]
//! so newer peers cannot crash older ones.

use corelib::{ShardNumber, TableUpdate};
use serde::{Deserialize, Serialize};

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ControlMessage {
    /// Complete claim set of one identity, to apply to every shard table.
    #[serde(rename = "update_vnode_table")]
    UpdateTable { data: TableUpdate },
    /// Ask the leader to re-advertise an orphaned shard.
    #[serde(rename = "recover_vnode")]
    RecoverShard {
        #[serde(rename = "vnode_id")]
        shard: ShardNumber,
    },
    /// Advertisement on the shared queue: whoever receives it should start
    /// the shard.
    #[serde(rename = "claim_vnode")]
    ClaimShard {
        #[serde(rename = "vnode_id")]
        shard: ShardNumber,
    },
    /// Stop every local shard of the receiving process.
    #[serde(rename = "release_vnodes")]
    ReleaseShards,
    /// Full-table gossip. Reserved; not acted on by this protocol revision.
    #[serde(rename = "vnode_table_publish")]
    PublishTable,
    /// Any action this revision does not recognise.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Wire name of the action, for logs and metric labels.
    pub fn action(&self) -> &'static str {
        match self {
            ControlMessage::UpdateTable { .. } => "update_vnode_table",
            ControlMessage::RecoverShard { .. } => "recover_vnode",
            ControlMessage::ClaimShard { .. } => "claim_vnode",
            ControlMessage::ReleaseShards => "release_vnodes",
            ControlMessage::PublishTable => "vnode_table_publish",
            ControlMessage::Unknown => "unknown",
        }
    }
}
