//! Node identity for cluster participants.
//!
//! A worker process is identified by a `(guid, hostname, pid)` triple. Every
//! queue and exchange a process listens on is a pure function of that triple,
//! so independent processes agree on names without a shared registry.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Separator between identity fields in derived names.
pub const FIELD_SEPARATOR: &str = "--";

/// Queue shared by every process in the cluster (competing consumers).
pub const SHARED_CONTROL_QUEUE: &str = "chef-search-control--shared";

/// Fan-out exchange reaching every process in the cluster.
pub const BROADCAST_CONTROL_EXCHANGE: &str = "chef-search-control--broadcast";

/// Identity of one worker process.
///
/// Equality, ordering and hashing cover the triple only, so an identity
/// decoded from a control message compares equal to the one the sending
/// process built for itself.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawIdentity")]
pub struct NodeIdentity {
    guid: String,
    #[serde(rename = "hostname_f")]
    hostname: String,
    pid: u32,
}

/// Unvalidated wire form.
#[derive(Deserialize)]
struct RawIdentity {
    guid: String,
    #[serde(rename = "hostname_f", alias = "hostname")]
    hostname: String,
    pid: u32,
}

impl TryFrom<RawIdentity> for NodeIdentity {
    type Error = Error;

    fn try_from(raw: RawIdentity) -> Result<Self> {
        Self::new(raw.guid, raw.hostname, raw.pid)
    }
}

impl NodeIdentity {
    /// Build an identity from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentity`] if `guid` or `hostname` is empty or
    /// contains the `--` field separator.
    pub fn new(guid: impl Into<String>, hostname: impl Into<String>, pid: u32) -> Result<Self> {
        let guid = guid.into();
        let hostname = hostname.into();
        check_field("guid", &guid)?;
        check_field("hostname", &hostname)?;
        Ok(Self {
            guid,
            hostname,
            pid,
        })
    }

    /// Identity for the running process: live hostname, live PID and a fresh
    /// random GUID.
    ///
    /// Call once at startup and pass the result around; two calls yield two
    /// distinct identities.
    pub fn for_current_process() -> Result<Self> {
        let hostname = sysinfo::System::host_name()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        // "--" separates identity fields in queue names.
        let hostname = hostname.replace(FIELD_SEPARATOR, "-");
        Self::new(uuid::Uuid::new_v4().to_string(), hostname, std::process::id())
    }

    /// Decode from a field mapping containing at least `guid`, `hostname`
    /// (or `hostname_f`) and `pid`. Extra fields are ignored and the input is
    /// left untouched.
    pub fn from_hash(fields: &Map<String, Value>) -> Result<Self> {
        let guid = string_field(fields, &["guid"])?;
        let hostname = string_field(fields, &["hostname_f", "hostname"])?;
        let pid = match fields.get("pid") {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|p| u32::try_from(p).ok())
                .ok_or_else(|| Error::InvalidIdentity(format!("pid {} out of range", n)))?,
            Some(Value::String(s)) => s
                .parse()
                .map_err(|_| Error::InvalidIdentity(format!("pid {:?} is not a number", s)))?,
            Some(other) => {
                return Err(Error::InvalidIdentity(format!(
                    "pid has unexpected type: {}",
                    other
                )))
            }
            None => return Err(Error::InvalidIdentity("missing field pid".to_string())),
        };
        Self::new(guid, hostname, pid)
    }

    /// Encode as the field mapping used on the wire (`guid`, `hostname_f`, `pid`).
    pub fn to_hash(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("guid".to_string(), Value::from(self.guid.as_str()));
        map.insert("hostname_f".to_string(), Value::from(self.hostname.as_str()));
        map.insert("pid".to_string(), Value::from(self.pid));
        map
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Cluster-wide shared control queue. Same for every identity.
    pub fn shared_control_queue(&self) -> &'static str {
        SHARED_CONTROL_QUEUE
    }

    /// Cluster-wide broadcast exchange. Same for every identity.
    pub fn broadcast_control_exchange(&self) -> &'static str {
        BROADCAST_CONTROL_EXCHANGE
    }

    /// `{hostname}--{pid}--{guid}--exclusive-control`
    pub fn exclusive_control_queue(&self) -> String {
        self.derived_name("exclusive-control")
    }

    /// `{hostname}--{pid}--{guid}--broadcast`, bound to the broadcast exchange.
    pub fn broadcast_control_queue(&self) -> String {
        self.derived_name("broadcast")
    }

    fn derived_name(&self, suffix: &str) -> String {
        [
            self.hostname.as_str(),
            &self.pid.to_string(),
            self.guid.as_str(),
            suffix,
        ]
        .join(FIELD_SEPARATOR)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.pid, self.guid)
    }
}

fn check_field(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidIdentity(format!("{} is empty", name)));
    }
    if value.contains(FIELD_SEPARATOR) {
        return Err(Error::InvalidIdentity(format!(
            "{} {:?} contains the {:?} separator",
            name, value, FIELD_SEPARATOR
        )));
    }
    Ok(())
}

fn string_field(fields: &Map<String, Value>, keys: &[&str]) -> Result<String> {
    keys.iter()
        .find_map(|k| fields.get(*k))
        .ok_or_else(|| Error::InvalidIdentity(format!("missing field {}", keys[0])))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidIdentity(format!("field {} is not a string", keys[0])))
}
