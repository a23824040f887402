//! Read-through nameserver that only logs mutations.

use super::Nameserver;
use crate::error::Result;
use crate::types::{BaseId, Forwarding, LinkInfo, ShardId, ShardInfo, TableId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Forwards reads to an inner nameserver and records mutations without sending them.
#[derive(Debug)]
pub struct DryRunNameserver {
    inner: Arc<dyn Nameserver>,
    planned: Mutex<Vec<String>>,
}

impl DryRunNameserver {
    /// Wrap a nameserver.
    pub fn new(inner: Arc<dyn Nameserver>) -> Self {
        Self {
            inner,
            planned: Mutex::new(Vec::new()),
        }
    }

    /// Mutations that would have been sent, in order.
    pub fn planned(&self) -> Vec<String> {
        self.planned.lock().clone()
    }

    fn skip(&self, call: String) -> Result<()> {
        tracing::info!(call = %call, "Dry run: skipping nameserver mutation");
        self.planned.lock().push(call);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Nameserver for DryRunNameserver {
    async fn create_shard(&self, info: &ShardInfo) -> Result<()> {
        self.skip(format!("create_shard {} {}", info.id, info.class_name))
    }

    async fn delete_shard(&self, id: &ShardId) -> Result<()> {
        self.skip(format!("delete_shard {}", id))
    }

    async fn add_link(&self, up: &ShardId, down: &ShardId, weight: u32) -> Result<()> {
        self.skip(format!("add_link {} -> {} {}", up, down, weight))
    }

    async fn remove_link(&self, up: &ShardId, down: &ShardId) -> Result<()> {
        self.skip(format!("remove_link {} -> {}", up, down))
    }

    async fn set_forwarding(&self, forwarding: &Forwarding) -> Result<()> {
        self.skip(format!("set_forwarding {}", forwarding))
    }

    async fn remove_forwarding(&self, forwarding: &Forwarding) -> Result<()> {
        self.skip(format!("remove_forwarding {}", forwarding))
    }

    async fn get_shard(&self, id: &ShardId) -> Result<ShardInfo> {
        self.inner.get_shard(id).await
    }

    async fn get_busy_shards(&self) -> Result<Vec<ShardInfo>> {
        self.inner.get_busy_shards().await
    }

    async fn mark_shard_busy(&self, id: &ShardId, busy: i32) -> Result<()> {
        self.skip(format!("mark_shard_busy {} {}", id, busy))
    }

    async fn copy_shard(&self, source: &ShardId, dest: &ShardId) -> Result<()> {
        self.skip(format!("copy_shard {} => {}", source, dest))
    }

    async fn repair_shards(&self, ids: &[ShardId]) -> Result<()> {
        let names: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.skip(format!("repair_shards {}", names.join(" ")))
    }

    async fn diff_shards(&self, ids: &[ShardId]) -> Result<()> {
        let names: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.skip(format!("diff_shards {}", names.join(" ")))
    }

    async fn list_upward_links(&self, id: &ShardId) -> Result<Vec<LinkInfo>> {
        self.inner.list_upward_links(id).await
    }

    async fn list_downward_links(&self, id: &ShardId) -> Result<Vec<LinkInfo>> {
        self.inner.list_downward_links(id).await
    }

    async fn get_forwarding(&self, table_id: TableId, base_id: BaseId) -> Result<Forwarding> {
        self.inner.get_forwarding(table_id, base_id).await
    }

    async fn get_forwardings(&self) -> Result<Vec<Forwarding>> {
        self.inner.get_forwardings().await
    }

    async fn reload_updated_forwardings(&self) -> Result<()> {
        self.skip("reload_updated_forwardings".to_string())
    }

    async fn list_hostnames(&self) -> Result<Vec<String>> {
        self.inner.list_hostnames().await
    }
}
