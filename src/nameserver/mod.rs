//! Nameserver client contract and topology snapshots.
//!
//! The nameserver owns the shard graph: shard metadata, parent/child links and
//! the forwardings that map key ranges to root shards. This crate never stores
//! topology itself; it reads a [`Manifest`] snapshot, plans against it and then
//! issues mutations through the [`Nameserver`] trait.
//!
//! # Implementations
//!
//! - [`InMemoryNameserver`]: local state with simulated asynchronous copies
//! - [`DryRunNameserver`]: forwards reads, logs mutations without sending them
//!
//! A production client wraps the remote RPC transport (and its retry policy)
//! behind the same trait.

mod dry_run;
mod manifest;
mod memory;

pub use dry_run::DryRunNameserver;
pub use manifest::{Manifest, Shard};
pub use memory::InMemoryNameserver;

use crate::error::Result;
use crate::types::{BaseId, Forwarding, LinkInfo, ShardId, ShardInfo, TableId};

/// Client interface to the topology metadata service.
///
/// Every call may fail. Implementations surface failures as
/// [`Error::Nameserver`](crate::error::Error::Nameserver); retries belong to the
/// transport, not to callers of this trait.
#[async_trait::async_trait]
pub trait Nameserver: Send + Sync + std::fmt::Debug {
    /// Create a shard.
    async fn create_shard(&self, info: &ShardInfo) -> Result<()>;

    /// Delete a shard. Links are not touched.
    async fn delete_shard(&self, id: &ShardId) -> Result<()>;

    /// Add (or re-weight) a link from `up` to `down`.
    async fn add_link(&self, up: &ShardId, down: &ShardId, weight: u32) -> Result<()>;

    /// Remove the link from `up` to `down`.
    async fn remove_link(&self, up: &ShardId, down: &ShardId) -> Result<()>;

    /// Point a forwarding slot at a root shard, replacing any previous root.
    async fn set_forwarding(&self, forwarding: &Forwarding) -> Result<()>;

    /// Remove a forwarding.
    async fn remove_forwarding(&self, forwarding: &Forwarding) -> Result<()>;

    /// Fetch shard metadata.
    async fn get_shard(&self, id: &ShardId) -> Result<ShardInfo>;

    /// All shards with a positive busy flag.
    async fn get_busy_shards(&self) -> Result<Vec<ShardInfo>>;

    /// Set a shard's busy flag.
    async fn mark_shard_busy(&self, id: &ShardId, busy: i32) -> Result<()>;

    /// Start copying data from `source` to `dest`. Returns once the copy is queued.
    async fn copy_shard(&self, source: &ShardId, dest: &ShardId) -> Result<()>;

    /// Start repairing the given replicas against each other.
    async fn repair_shards(&self, ids: &[ShardId]) -> Result<()>;

    /// Start diffing the given replicas against each other.
    async fn diff_shards(&self, ids: &[ShardId]) -> Result<()>;

    /// Links whose child is `id`.
    async fn list_upward_links(&self, id: &ShardId) -> Result<Vec<LinkInfo>>;

    /// Links whose parent is `id`.
    async fn list_downward_links(&self, id: &ShardId) -> Result<Vec<LinkInfo>>;

    /// Forwarding at an exact slot.
    async fn get_forwarding(&self, table_id: TableId, base_id: BaseId) -> Result<Forwarding>;

    /// All forwardings.
    async fn get_forwardings(&self) -> Result<Vec<Forwarding>>;

    /// Ask application servers to pick up forwarding changes.
    async fn reload_updated_forwardings(&self) -> Result<()>;

    /// Every host serving at least one shard.
    async fn list_hostnames(&self) -> Result<Vec<String>>;
}
