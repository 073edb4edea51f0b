//! Domain Entities - Core fleet concepts
//!
//! These entities model the replication topology: instance identities,
//! binlog positions, replica classification, and the shard lifecycle states.
//! They carry only business logic and serde derives.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for a shard range with no upper bound.
pub const INFINITY: u64 = u64::MAX;

/// Identity of one database instance: IP address plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub ip: String,
    pub port: u16,
}

impl InstanceId {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Parse "ip" or "ip:port", falling back to `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Self {
        match s.rsplit_once(':') {
            Some((ip, port)) => match port.parse() {
                Ok(port) => Self::new(ip, port),
                Err(_) => Self::new(s, default_port),
            },
            None => Self::new(s, default_port),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A (file, position) pair identifying a point in a master's binlog stream.
///
/// MySQL binlog file names carry a zero-padded sequence suffix, so
/// lexicographic file comparison followed by position yields event order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub file: String,
    pub position: u64,
}

impl BinlogCoordinates {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Self {
            file: file.into(),
            position,
        }
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

/// Credentials a replica uses to connect to its master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCredentials {
    pub user: String,
    pub password: String,
}

/// Classification of a replica within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    /// Serving live read traffic, carries a nonzero read weight.
    Active,
    /// Kept for failover and cloning, no live traffic.
    Standby,
    /// Dedicated to backups/batch jobs, never promotable.
    Backup,
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaRole::Active => "active",
            ReplicaRole::Standby => "standby",
            ReplicaRole::Backup => "backup",
        };
        write!(f, "{}", s)
    }
}

/// Role a claimed spare machine will take on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpareRole {
    Master,
    Standby,
    Backup,
}

/// Selection criteria for claiming spare machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpareCriteria {
    pub role: SpareRole,
    /// Hardware-affinity hint: prefer spares similar to this instance.
    pub like: Option<InstanceId>,
}

impl SpareCriteria {
    pub fn for_role(role: SpareRole) -> Self {
        Self { role, like: None }
    }

    pub fn like(mut self, instance: InstanceId) -> Self {
        self.like = Some(instance);
        self
    }
}

/// Contiguous, inclusive range of sharding-key values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    pub min_id: u64,
    pub max_id: u64,
}

impl ShardRange {
    pub fn new(min_id: u64, max_id: u64) -> Self {
        debug_assert!(min_id <= max_id);
        Self { min_id, max_id }
    }

    pub fn contains(&self, id: u64) -> bool {
        id >= self.min_id && id <= self.max_id
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_id == INFINITY
    }

    /// Number of ids covered; meaningless for unbounded ranges.
    pub fn span(&self) -> u64 {
        self.max_id - self.min_id + 1
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "[{}, inf)", self.min_id)
        } else {
            write!(f, "[{}, {}]", self.min_id, self.max_id)
        }
    }
}

/// Lifecycle state of a shard.
///
/// Child-side path: Initializing -> Exporting -> Importing -> Replicating
/// -> Child -> NeedsCleanup -> Ready. Parent-side path after a split:
/// Deprecated -> Recycle. ReadOnly/Offline are maintenance states reachable
/// from Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Initializing,
    Exporting,
    Importing,
    Replicating,
    Child,
    NeedsCleanup,
    Ready,
    ReadOnly,
    Offline,
    Deprecated,
    Recycle,
}

impl ShardState {
    /// Whether the shard is visible to production routing queries.
    pub fn in_production(&self) -> bool {
        matches!(
            self,
            ShardState::Child
                | ShardState::NeedsCleanup
                | ShardState::Ready
                | ShardState::ReadOnly
                | ShardState::Deprecated
        )
    }

    /// Legal direct transitions out of this state.
    pub fn can_transition_to(&self, to: ShardState) -> bool {
        use ShardState::*;
        matches!(
            (self, to),
            (Initializing, Exporting)
                | (Exporting, Importing)
                | (Importing, Replicating)
                | (Replicating, Child)
                | (Child, NeedsCleanup)
                | (NeedsCleanup, Ready)
                | (Ready, ReadOnly)
                | (Ready, NeedsCleanup)
                | (ReadOnly, Ready)
                | (ReadOnly, Offline)
                | (Offline, ReadOnly)
                | (Ready, Deprecated)
                | (Deprecated, Recycle)
        )
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::Initializing => "initializing",
            ShardState::Exporting => "exporting",
            ShardState::Importing => "importing",
            ShardState::Replicating => "replicating",
            ShardState::Child => "child",
            ShardState::NeedsCleanup => "needs_cleanup",
            ShardState::Ready => "ready",
            ShardState::ReadOnly => "read_only",
            ShardState::Offline => "offline",
            ShardState::Deprecated => "deprecated",
            ShardState::Recycle => "recycle",
        };
        write!(f, "{}", s)
    }
}

/// One sharded table: name plus the column(s) carrying the sharding key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub sharding_keys: Vec<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, sharding_keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            sharding_keys,
        }
    }

    /// Primary sharding key column.
    pub fn key(&self) -> &str {
        &self.sharding_keys[0]
    }
}

/// Parsed replica status of one instance (SHOW SLAVE STATUS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub master: InstanceId,
    pub master_user: String,
    pub io_running: bool,
    pub sql_running: bool,
    /// Coordinates the IO thread has read through on the master.
    pub master_log_file: String,
    pub read_master_log_pos: u64,
    /// Coordinates the SQL thread has executed through on the master.
    pub relay_master_log_file: String,
    pub exec_master_log_pos: u64,
    pub seconds_behind_master: Option<u64>,
}

impl ReplicationStatus {
    /// Master-side coordinates this replica has executed through.
    pub fn executed_coordinates(&self) -> BinlogCoordinates {
        BinlogCoordinates::new(self.relay_master_log_file.clone(), self.exec_master_log_pos)
    }
}

/// Serializable description of a pool, handed to the configuration sink
/// after every state-affecting transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub master: InstanceId,
    pub aliases: Vec<String>,
    pub master_read_weight: u32,
    pub active_slaves: Vec<(InstanceId, u32)>,
    pub standby_slaves: Vec<InstanceId>,
    pub backup_slaves: Vec<InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSnapshot>,
}

/// Shard-specific portion of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub keyspace: String,
    pub min_id: u64,
    pub max_id: u64,
    pub state: ShardState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}
