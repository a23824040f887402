//! Materialized shard trees and per-table topology snapshots.

use super::Nameserver;
use crate::error::{Error, NameserverError, Result};
use crate::template::{ShardKey, ShardTemplate, VirtualKind, ABSTRACT_HOST, DEFAULT_WEIGHT};
use crate::types::{Forwarding, LinkInfo, ShardId, ShardInfo, TableId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A shard and everything below it, as read from the nameserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Shard metadata.
    pub info: ShardInfo,
    /// Weight of the link from the parent; roots carry the default weight.
    pub weight: u32,
    /// Children, heaviest first.
    pub children: Vec<Shard>,
}

impl Shard {
    /// Create a tree node. Children are sorted heaviest first, then by id.
    pub fn new(info: ShardInfo, weight: u32, mut children: Vec<Shard>) -> Self {
        children.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.id().cmp(b.id())));
        Self {
            info,
            weight,
            children,
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.info.id
    }

    /// Host as a template would report it.
    pub fn effective_host(&self) -> &str {
        if VirtualKind::from_class_name(&self.info.class_name).is_none() {
            return &self.info.id.hostname;
        }
        match self.children.as_slice() {
            [only] => only.effective_host(),
            _ => ABSTRACT_HOST,
        }
    }

    /// Template identity of this node alone.
    pub fn shard_key(&self) -> ShardKey {
        ShardKey {
            shard_type: self.info.class_name.clone(),
            host: self.effective_host().to_string(),
            source_type: self.info.source_type.clone(),
            dest_type: self.info.destination_type.clone(),
        }
    }

    /// Abstract shape of this tree.
    pub fn template(&self) -> Result<ShardTemplate> {
        let children = self
            .children
            .iter()
            .map(Shard::template)
            .collect::<Result<Vec<_>>>()?;
        ShardTemplate::new(
            self.info.class_name.clone(),
            self.info.id.hostname.clone(),
            self.weight,
            self.info.source_type.clone(),
            self.info.destination_type.clone(),
            children,
        )
    }

    /// Self followed by every descendant, pre-order.
    pub fn descendants(&self) -> Vec<&Shard> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.descendants());
        }
        nodes
    }

    /// Map from template identity to the id already serving it.
    ///
    /// When two nodes share an identity the first one in pre-order wins.
    pub fn id_map(&self) -> BTreeMap<ShardKey, ShardId> {
        let mut map = BTreeMap::new();
        for node in self.descendants() {
            map.entry(node.shard_key()).or_insert_with(|| node.id().clone());
        }
        map
    }
}

/// Snapshot of the topology serving a set of tables.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Forwardings of the requested tables, sorted.
    pub forwardings: Vec<Forwarding>,
    /// Every link reachable from those forwardings.
    pub links: Vec<LinkInfo>,
    /// Every shard reachable from those forwardings.
    pub shard_infos: BTreeMap<ShardId, ShardInfo>,
    /// Materialized tree per forwarding.
    pub trees: BTreeMap<Forwarding, Shard>,
    /// Forwardings grouped by the template of their tree.
    pub templates: BTreeMap<ShardTemplate, Vec<Forwarding>>,
}

impl Manifest {
    /// Read the topology for `table_ids` from the nameserver.
    pub async fn load(nameserver: &dyn Nameserver, table_ids: &[TableId]) -> Result<Self> {
        let forwardings: Vec<Forwarding> = nameserver
            .get_forwardings()
            .await?
            .into_iter()
            .filter(|f| table_ids.contains(&f.table_id))
            .collect();

        let mut shard_infos = BTreeMap::new();
        let mut links = Vec::new();
        let mut queue: VecDeque<ShardId> =
            forwardings.iter().map(|f| f.shard_id.clone()).collect();

        while let Some(id) = queue.pop_front() {
            if shard_infos.contains_key(&id) {
                continue;
            }
            let info = nameserver.get_shard(&id).await?;
            shard_infos.insert(id.clone(), info);
            for link in nameserver.list_downward_links(&id).await? {
                queue.push_back(link.down_id.clone());
                links.push(link);
            }
        }

        let manifest = Self::from_parts(forwardings, links, shard_infos.into_values().collect())?;
        tracing::debug!(
            tables = ?table_ids,
            forwardings = manifest.forwardings.len(),
            shards = manifest.shard_infos.len(),
            templates = manifest.templates.len(),
            "Loaded manifest"
        );
        Ok(manifest)
    }

    /// Build a manifest from raw nameserver records.
    pub fn from_parts(
        mut forwardings: Vec<Forwarding>,
        links: Vec<LinkInfo>,
        shard_infos: Vec<ShardInfo>,
    ) -> Result<Self> {
        forwardings.sort();
        let shard_infos: BTreeMap<ShardId, ShardInfo> = shard_infos
            .into_iter()
            .map(|info| (info.id.clone(), info))
            .collect();

        let mut downward: BTreeMap<&ShardId, Vec<&LinkInfo>> = BTreeMap::new();
        for link in &links {
            downward.entry(&link.up_id).or_default().push(link);
        }

        let mut trees = BTreeMap::new();
        let mut templates: BTreeMap<ShardTemplate, Vec<Forwarding>> = BTreeMap::new();
        for forwarding in &forwardings {
            let mut path = Vec::new();
            let tree = build_tree(
                &forwarding.shard_id,
                DEFAULT_WEIGHT,
                &shard_infos,
                &downward,
                &mut path,
            )?;
            templates
                .entry(tree.template()?)
                .or_default()
                .push(forwarding.clone());
            trees.insert(forwarding.clone(), tree);
        }

        Ok(Self {
            forwardings,
            links,
            shard_infos,
            trees,
            templates,
        })
    }

    /// Refuse to plan writes against shards that are mid-migration.
    pub fn validate_for_write(&self) -> Result<()> {
        let busy: Vec<String> = self
            .shard_infos
            .values()
            .filter(|info| info.is_busy())
            .map(|info| info.id.to_string())
            .collect();
        if !busy.is_empty() {
            return Err(Error::Precondition(format!(
                "busy shards: {}",
                busy.join(", ")
            )));
        }

        let transitional: Vec<String> = self
            .shard_infos
            .values()
            .filter(|info| {
                VirtualKind::from_class_name(&info.class_name)
                    .map(VirtualKind::is_transitional)
                    .unwrap_or(false)
            })
            .map(|info| info.id.to_string())
            .collect();
        if !transitional.is_empty() {
            return Err(Error::Precondition(format!(
                "shards left over from an unfinished migration: {}",
                transitional.join(", ")
            )));
        }

        Ok(())
    }

    /// Hosts serving any shard in the snapshot.
    pub fn hosts(&self) -> BTreeSet<&str> {
        self.shard_infos
            .keys()
            .map(|id| id.hostname.as_str())
            .collect()
    }
}

fn build_tree(
    id: &ShardId,
    weight: u32,
    shard_infos: &BTreeMap<ShardId, ShardInfo>,
    downward: &BTreeMap<&ShardId, Vec<&LinkInfo>>,
    path: &mut Vec<ShardId>,
) -> Result<Shard> {
    if path.contains(id) {
        return Err(NameserverError::Cycle(id.clone()).into());
    }
    let info = shard_infos
        .get(id)
        .cloned()
        .ok_or_else(|| NameserverError::ShardNotFound(id.clone()))?;

    path.push(id.clone());
    let mut children = Vec::new();
    for link in downward.get(id).map(Vec::as_slice).unwrap_or_default() {
        children.push(build_tree(
            &link.down_id,
            link.weight,
            shard_infos,
            downward,
            path,
        )?);
    }
    path.pop();

    Ok(Shard::new(info, weight, children))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nameserver::InMemoryNameserver;

    fn info(host: &str, prefix: &str, class: &str) -> ShardInfo {
        ShardInfo::new(ShardId::new(host, prefix), class, "", "")
    }

    fn link(up: &ShardInfo, down: &ShardInfo, weight: u32) -> LinkInfo {
        LinkInfo::new(up.id.clone(), down.id.clone(), weight)
    }

    fn replicated_parts() -> (Vec<Forwarding>, Vec<LinkInfo>, Vec<ShardInfo>) {
        let root = info("localhost", "users_0_0000_replicating", "ReplicatingShard");
        let a = info("db1", "users_0_0000", "SqlShard");
        let b = info("db2", "users_0_0000", "SqlShard");
        let forwarding = Forwarding::new(0, 0, root.id.clone());
        let links = vec![link(&root, &a, 1), link(&root, &b, 2)];
        (vec![forwarding], links, vec![root, a, b])
    }

    #[test]
    fn test_from_parts() {
        let (forwardings, links, infos) = replicated_parts();
        let manifest = Manifest::from_parts(forwardings.clone(), links, infos).unwrap();

        let tree = &manifest.trees[&forwardings[0]];
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].id().hostname, "db2");
        assert_eq!(tree.effective_host(), ABSTRACT_HOST);

        assert_eq!(manifest.templates.len(), 1);
        let (template, fwds) = manifest.templates.iter().next().unwrap();
        assert_eq!(template.concrete_descendants().len(), 2);
        assert_eq!(fwds, &forwardings);
        assert_eq!(manifest.hosts().len(), 3);
    }

    #[test]
    fn test_id_map_uses_template_identity() {
        let (forwardings, links, infos) = replicated_parts();
        let manifest = Manifest::from_parts(forwardings.clone(), links, infos).unwrap();
        let tree = &manifest.trees[&forwardings[0]];
        let template = tree.template().unwrap();

        let ids = tree.id_map();
        assert_eq!(ids.len(), 3);
        for node in template.descendants() {
            assert!(ids.contains_key(&node.shard_key()), "{} unmapped", node.short_id());
        }
        assert_eq!(
            ids[&template.shard_key()],
            ShardId::new("localhost", "users_0_0000_replicating")
        );
    }

    #[test]
    fn test_cycle_detected() {
        let a = info("localhost", "a", "ReplicatingShard");
        let b = info("localhost", "b", "ReplicatingShard");
        let forwarding = Forwarding::new(0, 0, a.id.clone());
        let links = vec![link(&a, &b, 1), link(&b, &a, 1)];
        let result = Manifest::from_parts(vec![forwarding], links, vec![a, b]);
        assert!(matches!(
            result,
            Err(Error::Nameserver(NameserverError::Cycle(_)))
        ));
    }

    #[test]
    fn test_missing_shard() {
        let forwarding = Forwarding::new(0, 0, ShardId::new("db1", "gone"));
        let result = Manifest::from_parts(vec![forwarding], vec![], vec![]);
        assert!(matches!(
            result,
            Err(Error::Nameserver(NameserverError::ShardNotFound(_)))
        ));
    }

    #[test]
    fn test_validate_for_write() {
        let (forwardings, links, mut infos) = replicated_parts();
        let clean = Manifest::from_parts(forwardings.clone(), links.clone(), infos.clone()).unwrap();
        assert!(clean.validate_for_write().is_ok());

        infos[1].busy = 1;
        let busy = Manifest::from_parts(forwardings.clone(), links, infos).unwrap();
        assert!(matches!(busy.validate_for_write(), Err(Error::Precondition(_))));

        let blocked = info("db1", "t_blocked", "BlockedShard");
        let inner = info("db1", "t", "SqlShard");
        let forwarding = Forwarding::new(0, 0, blocked.id.clone());
        let manifest = Manifest::from_parts(
            vec![forwarding],
            vec![link(&blocked, &inner, 1)],
            vec![blocked, inner],
        )
        .unwrap();
        assert!(matches!(
            manifest.validate_for_write(),
            Err(Error::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_load_filters_tables() {
        let (forwardings, links, infos) = replicated_parts();
        let ns = InMemoryNameserver::new();
        ns.seed(&infos, &links, &forwardings);

        let other = info("db9", "other_1_0000", "SqlShard");
        ns.seed(&[other.clone()], &[], &[Forwarding::new(1, 0, other.id.clone())]);

        let manifest = Manifest::load(&ns, &[0]).await.unwrap();
        assert_eq!(manifest.forwardings, forwardings);
        assert_eq!(manifest.shard_infos.len(), 3);
        assert_eq!(manifest.links.len(), 2);

        let both = Manifest::load(&ns, &[0, 1]).await.unwrap();
        assert_eq!(both.templates.len(), 2);
    }
}
