//! Core types shared by the planner, the scheduler and nameserver clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical table identifier. Negative ids are valid.
pub type TableId = i32;

/// Position in a table's forwarding key space.
pub type BaseId = i64;

/// Busy flag value written before a copy is requested.
pub const BUSY: i32 = 1;

/// Identity of one physical shard instance.
///
/// Ordered by hostname, then table prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Host serving the shard.
    pub hostname: String,
    /// Table prefix naming the shard on that host.
    pub table_prefix: String,
}

impl ShardId {
    /// Create a new shard id.
    pub fn new(hostname: impl Into<String>, table_prefix: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            table_prefix: table_prefix.into(),
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hostname, self.table_prefix)
    }
}

/// Snapshot of a shard's metadata as stored by the nameserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard identity.
    pub id: ShardId,
    /// Implementation class, concrete or virtual.
    pub class_name: String,
    /// Source type tag.
    pub source_type: String,
    /// Destination type tag.
    pub destination_type: String,
    /// 0 when idle, positive while a copy or repair is running.
    pub busy: i32,
}

impl ShardInfo {
    /// Create an idle shard info.
    pub fn new(
        id: ShardId,
        class_name: impl Into<String>,
        source_type: impl Into<String>,
        destination_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            class_name: class_name.into(),
            source_type: source_type.into(),
            destination_type: destination_type.into(),
            busy: 0,
        }
    }

    /// Check whether the shard is under an active copy or repair.
    pub fn is_busy(&self) -> bool {
        self.busy > 0
    }
}

/// Directed edge from a parent shard to one of its children.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkInfo {
    /// Parent (routing) shard.
    pub up_id: ShardId,
    /// Child shard.
    pub down_id: ShardId,
    /// Relative read/replica weight among siblings.
    pub weight: u32,
}

impl LinkInfo {
    /// Create a new link.
    pub fn new(up_id: ShardId, down_id: ShardId, weight: u32) -> Self {
        Self {
            up_id,
            down_id,
            weight,
        }
    }
}

/// Maps a point in a table's key space to the root shard serving it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Forwarding {
    /// Table the forwarding belongs to.
    pub table_id: TableId,
    /// Start of the key range.
    pub base_id: BaseId,
    /// Root shard of the tree serving the range.
    pub shard_id: ShardId,
}

impl Forwarding {
    /// Create a new forwarding.
    pub fn new(table_id: TableId, base_id: BaseId, shard_id: ShardId) -> Self {
        Self {
            table_id,
            base_id,
            shard_id,
        }
    }

    /// Same forwarding slot pointed at another root.
    pub fn with_shard(&self, shard_id: ShardId) -> Self {
        Self {
            table_id: self.table_id,
            base_id: self.base_id,
            shard_id,
        }
    }
}

impl fmt::Display for Forwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:016x} -> {}", self.table_id, self.base_id, self.shard_id)
    }
}
