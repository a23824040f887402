//! In-process nameserver with simulated asynchronous copies.

use super::Nameserver;
use crate::error::{NameserverError, Result};
use crate::types::{BaseId, Forwarding, LinkInfo, ShardId, ShardInfo, TableId, BUSY};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
struct State {
    shards: BTreeMap<ShardId, ShardInfo>,
    links: BTreeMap<(ShardId, ShardId), u32>,
    forwardings: BTreeMap<(TableId, BaseId), Forwarding>,
    /// Remaining busy polls per shard with work in flight.
    in_flight: BTreeMap<ShardId, usize>,
    journal: Vec<String>,
    reloads: usize,
    copies: Vec<(ShardId, ShardId)>,
    peak_busy: usize,
    peak_busy_per_host: BTreeMap<String, usize>,
}

impl State {
    fn shard_mut(&mut self, id: &ShardId) -> Result<&mut ShardInfo> {
        self.shards
            .get_mut(id)
            .ok_or_else(|| NameserverError::ShardNotFound(id.clone()).into())
    }

    fn require(&self, id: &ShardId) -> Result<()> {
        if self.shards.contains_key(id) {
            Ok(())
        } else {
            Err(NameserverError::ShardNotFound(id.clone()).into())
        }
    }

    fn start_work(&mut self, id: &ShardId, ticks: usize) -> Result<()> {
        self.shard_mut(id)?.busy = BUSY;
        self.in_flight.insert(id.clone(), ticks);
        self.record_busy();
        Ok(())
    }

    fn record_busy(&mut self) {
        let busy: Vec<&ShardInfo> = self.shards.values().filter(|s| s.is_busy()).collect();
        self.peak_busy = self.peak_busy.max(busy.len());

        let mut per_host: BTreeMap<String, usize> = BTreeMap::new();
        for info in busy {
            *per_host.entry(info.id.hostname.clone()).or_default() += 1;
        }
        for (host, count) in per_host {
            let peak = self.peak_busy_per_host.entry(host).or_default();
            *peak = (*peak).max(count);
        }
    }
}

/// Nameserver holding its whole state in memory.
///
/// Copies, repairs and diffs mark their target shards busy; the flag clears after
/// the target has been reported busy by `copy_ticks` calls to
/// [`get_busy_shards`](Nameserver::get_busy_shards). Every mutation is recorded in
/// a journal so tests can assert on the exact call sequence.
#[derive(Debug)]
pub struct InMemoryNameserver {
    state: RwLock<State>,
    copy_ticks: usize,
}

impl Default for InMemoryNameserver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNameserver {
    /// Create an empty nameserver whose copies finish after one poll.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            copy_ticks: 1,
        }
    }

    /// Set how many busy polls each copy, repair or diff lasts.
    pub fn with_copy_ticks(mut self, ticks: usize) -> Self {
        self.copy_ticks = ticks.max(1);
        self
    }

    /// Insert records directly, bypassing the journal.
    pub fn seed(&self, shards: &[ShardInfo], links: &[LinkInfo], forwardings: &[Forwarding]) {
        let mut state = self.state.write();
        for info in shards {
            state.shards.insert(info.id.clone(), info.clone());
        }
        for link in links {
            state
                .links
                .insert((link.up_id.clone(), link.down_id.clone()), link.weight);
        }
        for forwarding in forwardings {
            state.forwardings.insert(
                (forwarding.table_id, forwarding.base_id),
                forwarding.clone(),
            );
        }
    }

    /// Mutations applied so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.state.read().journal.clone()
    }

    /// `(source, dest)` of every copy issued.
    pub fn copies(&self) -> Vec<(ShardId, ShardId)> {
        self.state.read().copies.clone()
    }

    /// Number of forwarding reloads requested.
    pub fn reload_count(&self) -> usize {
        self.state.read().reloads
    }

    /// Highest number of simultaneously busy shards observed.
    pub fn peak_busy(&self) -> usize {
        self.state.read().peak_busy
    }

    /// Highest number of simultaneously busy shards observed per host.
    pub fn peak_busy_per_host(&self) -> BTreeMap<String, usize> {
        self.state.read().peak_busy_per_host.clone()
    }

    /// All shard ids currently stored.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.state.read().shards.keys().cloned().collect()
    }

    /// All links currently stored.
    pub fn links(&self) -> Vec<LinkInfo> {
        self.state
            .read()
            .links
            .iter()
            .map(|((up, down), weight)| LinkInfo::new(up.clone(), down.clone(), *weight))
            .collect()
    }

    fn log(state: &mut State, entry: String) {
        tracing::trace!(call = %entry, "In-memory nameserver call");
        state.journal.push(entry);
    }
}

#[async_trait::async_trait]
impl Nameserver for InMemoryNameserver {
    async fn create_shard(&self, info: &ShardInfo) -> Result<()> {
        let mut state = self.state.write();
        if state.shards.contains_key(&info.id) {
            return Err(NameserverError::ShardAlreadyExists(info.id.clone()).into());
        }
        state.shards.insert(info.id.clone(), info.clone());
        Self::log(&mut state, format!("create_shard {} {}", info.id, info.class_name));
        Ok(())
    }

    async fn delete_shard(&self, id: &ShardId) -> Result<()> {
        let mut state = self.state.write();
        if state.shards.remove(id).is_none() {
            return Err(NameserverError::ShardNotFound(id.clone()).into());
        }
        state.in_flight.remove(id);
        Self::log(&mut state, format!("delete_shard {}", id));
        Ok(())
    }

    async fn add_link(&self, up: &ShardId, down: &ShardId, weight: u32) -> Result<()> {
        let mut state = self.state.write();
        state.require(up)?;
        state.require(down)?;
        state.links.insert((up.clone(), down.clone()), weight);
        Self::log(&mut state, format!("add_link {} -> {} {}", up, down, weight));
        Ok(())
    }

    async fn remove_link(&self, up: &ShardId, down: &ShardId) -> Result<()> {
        let mut state = self.state.write();
        if state.links.remove(&(up.clone(), down.clone())).is_none() {
            return Err(NameserverError::LinkNotFound {
                up: up.clone(),
                down: down.clone(),
            }
            .into());
        }
        Self::log(&mut state, format!("remove_link {} -> {}", up, down));
        Ok(())
    }

    async fn set_forwarding(&self, forwarding: &Forwarding) -> Result<()> {
        let mut state = self.state.write();
        state.require(&forwarding.shard_id)?;
        state.forwardings.insert(
            (forwarding.table_id, forwarding.base_id),
            forwarding.clone(),
        );
        Self::log(&mut state, format!("set_forwarding {}", forwarding));
        Ok(())
    }

    async fn remove_forwarding(&self, forwarding: &Forwarding) -> Result<()> {
        let mut state = self.state.write();
        let key = (forwarding.table_id, forwarding.base_id);
        let present = state
            .forwardings
            .get(&key)
            .map(|existing| existing.shard_id == forwarding.shard_id)
            .unwrap_or(false);
        if !present {
            return Err(NameserverError::ForwardingNotFound {
                table_id: forwarding.table_id,
                base_id: forwarding.base_id,
            }
            .into());
        }
        state.forwardings.remove(&key);
        Self::log(&mut state, format!("remove_forwarding {}", forwarding));
        Ok(())
    }

    async fn get_shard(&self, id: &ShardId) -> Result<ShardInfo> {
        self.state
            .read()
            .shards
            .get(id)
            .cloned()
            .ok_or_else(|| NameserverError::ShardNotFound(id.clone()).into())
    }

    async fn get_busy_shards(&self) -> Result<Vec<ShardInfo>> {
        let mut state = self.state.write();
        let busy: Vec<ShardInfo> = state
            .shards
            .values()
            .filter(|info| info.is_busy())
            .cloned()
            .collect();

        // Work reported busy now has one poll fewer to go.
        let mut done = Vec::new();
        for (id, remaining) in state.in_flight.iter_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                done.push(id.clone());
            }
        }
        for id in done {
            state.in_flight.remove(&id);
            if let Some(info) = state.shards.get_mut(&id) {
                info.busy = 0;
            }
        }

        Ok(busy)
    }

    async fn mark_shard_busy(&self, id: &ShardId, busy: i32) -> Result<()> {
        let mut state = self.state.write();
        state.shard_mut(id)?.busy = busy;
        state.record_busy();
        Self::log(&mut state, format!("mark_shard_busy {} {}", id, busy));
        Ok(())
    }

    async fn copy_shard(&self, source: &ShardId, dest: &ShardId) -> Result<()> {
        let mut state = self.state.write();
        state.require(source)?;
        state.start_work(dest, self.copy_ticks)?;
        state.copies.push((source.clone(), dest.clone()));
        Self::log(&mut state, format!("copy_shard {} => {}", source, dest));
        Ok(())
    }

    async fn repair_shards(&self, ids: &[ShardId]) -> Result<()> {
        let mut state = self.state.write();
        for id in ids {
            state.start_work(id, self.copy_ticks)?;
        }
        let names: Vec<String> = ids.iter().map(ToString::to_string).collect();
        Self::log(&mut state, format!("repair_shards {}", names.join(" ")));
        Ok(())
    }

    async fn diff_shards(&self, ids: &[ShardId]) -> Result<()> {
        let mut state = self.state.write();
        for id in ids {
            state.start_work(id, self.copy_ticks)?;
        }
        let names: Vec<String> = ids.iter().map(ToString::to_string).collect();
        Self::log(&mut state, format!("diff_shards {}", names.join(" ")));
        Ok(())
    }

    async fn list_upward_links(&self, id: &ShardId) -> Result<Vec<LinkInfo>> {
        Ok(self
            .state
            .read()
            .links
            .iter()
            .filter(|((_, down), _)| down == id)
            .map(|((up, down), weight)| LinkInfo::new(up.clone(), down.clone(), *weight))
            .collect())
    }

    async fn list_downward_links(&self, id: &ShardId) -> Result<Vec<LinkInfo>> {
        Ok(self
            .state
            .read()
            .links
            .iter()
            .filter(|((up, _), _)| up == id)
            .map(|((up, down), weight)| LinkInfo::new(up.clone(), down.clone(), *weight))
            .collect())
    }

    async fn get_forwarding(&self, table_id: TableId, base_id: BaseId) -> Result<Forwarding> {
        self.state
            .read()
            .forwardings
            .get(&(table_id, base_id))
            .cloned()
            .ok_or_else(|| NameserverError::ForwardingNotFound { table_id, base_id }.into())
    }

    async fn get_forwardings(&self) -> Result<Vec<Forwarding>> {
        Ok(self.state.read().forwardings.values().cloned().collect())
    }

    async fn reload_updated_forwardings(&self) -> Result<()> {
        let mut state = self.state.write();
        state.reloads += 1;
        Self::log(&mut state, "reload_updated_forwardings".to_string());
        Ok(())
    }

    async fn list_hostnames(&self) -> Result<Vec<String>> {
        let hosts: BTreeSet<String> = self
            .state
            .read()
            .shards
            .keys()
            .map(|id| id.hostname.clone())
            .collect();
        Ok(hosts.into_iter().collect())
    }
}
