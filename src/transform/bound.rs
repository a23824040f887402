//! Transformations bound to a forwarding and concrete shard ids.

use super::{Phase, ResolvedOp, Transformation};
use crate::error::Result;
use crate::nameserver::{Nameserver, Shard};
use crate::rollback::{RollbackEntry, RollbackLog};
use crate::template::{ShardKey, ShardTemplate, VirtualKind};
use crate::types::{Forwarding, ShardId, TableId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Canonical table prefix, `{base}_{table}_{enumeration:04}`.
///
/// Negative table ids are written as `n{abs}`.
pub fn canonical_table_prefix(enumeration: u32, table_id: TableId, base_name: &str) -> String {
    let table = if table_id < 0 {
        format!("n{}", table_id.unsigned_abs())
    } else {
        table_id.to_string()
    };
    format!("{}_{}_{:04}", base_name, table, enumeration)
}

/// Enumeration encoded in the last `_` segment of a table prefix.
pub fn parse_enumeration(table_prefix: &str) -> Option<u32> {
    let last = strip_virtual_suffix(table_prefix).rsplit('_').next()?;
    if last.is_empty() || !last.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    last.parse().ok()
}

fn strip_virtual_suffix(table_prefix: &str) -> &str {
    VirtualKind::ALL
        .iter()
        .find_map(|kind| {
            table_prefix
                .strip_suffix(kind.table_suffix())
                .and_then(|rest| rest.strip_suffix('_'))
        })
        .unwrap_or(table_prefix)
}

/// A transformation resolved against one forwarding.
///
/// Shards already present in the current tree keep their ids; only new shards
/// get ids minted from the table prefix.
#[derive(Debug, Clone)]
pub struct BoundTransformation {
    transformation: Transformation,
    forwarding: Forwarding,
    table_prefix: String,
    phases: BTreeMap<Phase, Vec<ResolvedOp>>,
}

impl BoundTransformation {
    /// Resolve `transformation` for `forwarding`, whose current tree is `tree`.
    pub fn new(
        transformation: Transformation,
        forwarding: &Forwarding,
        tree: Option<&Shard>,
        base_name: Option<&str>,
    ) -> Result<Self> {
        let existing_prefix = tree
            .map(|t| t.id().table_prefix.as_str())
            .unwrap_or(forwarding.shard_id.table_prefix.as_str());
        let stripped = strip_virtual_suffix(existing_prefix);

        let table_prefix = match (base_name, parse_enumeration(stripped)) {
            (Some(base), Some(enumeration)) => {
                canonical_table_prefix(enumeration, forwarding.table_id, base)
            }
            _ => stripped.to_string(),
        };

        let ids: BTreeMap<ShardKey, ShardId> = tree.map(Shard::id_map).unwrap_or_default();
        let id_of = |t: &ShardTemplate| -> ShardId {
            ids.get(&t.shard_key())
                .cloned()
                .unwrap_or_else(|| mint_id(t, &table_prefix))
        };

        let mut current_root = tree.map(|t| t.id().clone());
        let mut phases = BTreeMap::new();
        for (phase, ops) in transformation.operations() {
            let mut resolved = Vec::with_capacity(ops.len());
            for op in ops {
                let mut op = op.resolve(&id_of, forwarding);
                match &mut op {
                    ResolvedOp::SetForwarding {
                        forwarding,
                        previous,
                    } => {
                        *previous = current_root.replace(forwarding.shard_id.clone());
                    }
                    ResolvedOp::RemoveForwarding(_) => current_root = None,
                    _ => {}
                }
                resolved.push(op);
            }
            phases.insert(*phase, resolved);
        }

        Ok(Self {
            transformation,
            forwarding: forwarding.clone(),
            table_prefix,
            phases,
        })
    }

    pub fn transformation(&self) -> &Transformation {
        &self.transformation
    }

    pub fn forwarding(&self) -> &Forwarding {
        &self.forwarding
    }

    /// Prefix new shards are named after.
    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    /// Resolved ops of one phase, in execution order.
    pub fn ops(&self, phase: Phase) -> &[ResolvedOp] {
        self.phases.get(&phase).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_ops(&self, phase: Phase) -> bool {
        !self.ops(phase).is_empty()
    }

    /// Shards touched by a phase.
    pub fn involved_shards(&self, phase: Phase) -> BTreeSet<ShardId> {
        self.ops(phase)
            .iter()
            .flat_map(ResolvedOp::involved_shards)
            .cloned()
            .collect()
    }

    /// Hosts touched by a phase.
    pub fn involved_hosts(&self, phase: Phase) -> BTreeSet<String> {
        self.involved_shards(phase)
            .into_iter()
            .map(|id| id.hostname)
            .collect()
    }

    /// Number of copies issued by the copy phase.
    pub fn copy_count(&self) -> usize {
        self.ops(Phase::Copy).iter().filter(|op| op.is_copy()).count()
    }

    /// Execute a phase, logging each op's inverse when a rollback log is given.
    pub async fn apply(
        &self,
        nameserver: &dyn Nameserver,
        phase: Phase,
        rollback: Option<&dyn RollbackLog>,
    ) -> Result<()> {
        for op in self.ops(phase) {
            tracing::debug!(
                forwarding = %self.forwarding,
                phase = %phase,
                op = %op,
                "Applying op"
            );
            op.apply(nameserver).await?;

            if let (Some(log), Some(inverse)) = (rollback, op.inverse()) {
                log.push(&RollbackEntry {
                    forwarding: self.forwarding.clone(),
                    phase,
                    inverse,
                })
                .await?;
            }
        }
        Ok(())
    }
}

fn mint_id(t: &ShardTemplate, table_prefix: &str) -> ShardId {
    match t.table_suffix() {
        Some(suffix) => ShardId::new(t.host(), format!("{}_{}", table_prefix, suffix)),
        None => ShardId::new(t.host(), table_prefix),
    }
}

impl fmt::Display for BoundTransformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({})", self.forwarding, self.table_prefix)?;
        for (phase, ops) in &self.phases {
            writeln!(f, "  {}", phase.as_str().to_uppercase())?;
            for op in ops {
                writeln!(f, "    {}", op)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TemplateOptions, TransformOptions};
    use crate::nameserver::{InMemoryNameserver, Manifest};
    use crate::rollback::MemoryRollbackLog;
    use crate::types::{LinkInfo, ShardInfo};

    fn t(text: &str) -> ShardTemplate {
        ShardTemplate::parse(text, &TemplateOptions::default()).unwrap()
    }

    /// One forwarding at base 0 pointing at `ReplicatingShard -> (host1, host2)`.
    fn seeded() -> (InMemoryNameserver, Forwarding) {
        let root = ShardInfo::new(
            ShardId::new("localhost", "users_0_0003_replicating"),
            "ReplicatingShard",
            "",
            "",
        );
        let a = ShardInfo::new(ShardId::new("host1", "users_0_0003"), "SqlShard", "", "");
        let b = ShardInfo::new(ShardId::new("host2", "users_0_0003"), "SqlShard", "", "");
        let forwarding = Forwarding::new(0, 0, root.id.clone());
        let ns = InMemoryNameserver::new();
        ns.seed(
            &[root.clone(), a.clone(), b.clone()],
            &[
                LinkInfo::new(root.id.clone(), a.id.clone(), 1),
                LinkInfo::new(root.id.clone(), b.id.clone(), 1),
            ],
            &[forwarding.clone()],
        );
        (ns, forwarding)
    }

    #[test]
    fn test_canonical_names() {
        assert_eq!(canonical_table_prefix(3, 0, "users"), "users_0_0003");
        assert_eq!(canonical_table_prefix(12, -2, "users"), "users_n2_0012");
        assert_eq!(parse_enumeration("users_0_0003"), Some(3));
        assert_eq!(parse_enumeration("users_n2_0012_replicating"), Some(12));
        assert_eq!(parse_enumeration("users_0_0003_write_only"), Some(3));
        assert_eq!(parse_enumeration("legacy"), None);
        assert_eq!(strip_virtual_suffix("users_0_0003_blocked"), "users_0_0003");
    }

    #[tokio::test]
    async fn test_bind_reuses_existing_ids() {
        let (ns, forwarding) = seeded();
        let manifest = Manifest::load(&ns, &[0]).await.unwrap();
        let tree = &manifest.trees[&forwarding];

        let tr = Transformation::new(
            Some(tree.template().unwrap()),
            Some(t("ReplicatingShard -> (SqlShard(host1), SqlShard(host2), SqlShard(host3))")),
            TransformOptions::default(),
        )
        .unwrap();
        let bound = tr.bind(&forwarding, Some(tree), Some("users")).unwrap();
        assert_eq!(bound.table_prefix(), "users_0_0003");

        let copy = bound.ops(Phase::Copy);
        assert_eq!(
            copy,
            &[ResolvedOp::CopyShard {
                source: ShardId::new("host1", "users_0_0003"),
                dest: ShardId::new("host3", "users_0_0003"),
            }]
        );
        assert!(bound
            .involved_shards(Phase::Prepare)
            .contains(&ShardId::new("host3", "users_0_0003_blocked")));
        assert!(bound
            .involved_shards(Phase::Prepare)
            .contains(&ShardId::new("localhost", "users_0_0003_replicating")));
        assert_eq!(
            bound.involved_hosts(Phase::Copy),
            ["host1", "host3"]
                .iter()
                .map(|h| h.to_string())
                .collect::<BTreeSet<String>>()
        );
        assert_eq!(bound.copy_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_renames_when_base_changes() {
        let (ns, forwarding) = seeded();
        let manifest = Manifest::load(&ns, &[0]).await.unwrap();
        let tree = &manifest.trees[&forwarding];

        let tr = Transformation::new(
            Some(tree.template().unwrap()),
            Some(t("ReplicatingShard -> (SqlShard(host3), SqlShard(host4))")),
            TransformOptions::default(),
        )
        .unwrap();
        let renamed = tr.bind(&forwarding, Some(tree), Some("people")).unwrap();
        assert_eq!(renamed.table_prefix(), "people_0_0003");
        let kept = tr.bind(&forwarding, Some(tree), None).unwrap();
        assert_eq!(kept.table_prefix(), "users_0_0003");
    }

    #[tokio::test]
    async fn test_apply_all_phases() {
        let (ns, forwarding) = seeded();
        let manifest = Manifest::load(&ns, &[0]).await.unwrap();
        let tree = &manifest.trees[&forwarding];
        let to = t("ReplicatingShard -> (SqlShard(host2), SqlShard(host3))");

        let tr = Transformation::new(
            Some(tree.template().unwrap()),
            Some(to.clone()),
            TransformOptions::default(),
        )
        .unwrap();
        let bound = tr.bind(&forwarding, Some(tree), None).unwrap();
        let log = MemoryRollbackLog::new();

        for phase in Phase::ALL {
            bound.apply(&ns, phase, Some(&log)).await.unwrap();
        }
        // Let the simulated copy finish.
        ns.get_busy_shards().await.unwrap();

        let after = Manifest::load(&ns, &[0]).await.unwrap();
        assert_eq!(after.templates.len(), 1);
        assert_eq!(after.templates.keys().next(), Some(&to));
        assert!(after.validate_for_write().is_ok());
        assert_eq!(ns.copies().len(), 1);

        // The copy has no inverse; everything else does.
        let entries = log.entries();
        let applied: usize = Phase::ALL.iter().map(|p| bound.ops(*p).len()).sum();
        let markers = Phase::ALL
            .iter()
            .flat_map(|p| bound.ops(*p))
            .filter(|op| op.inverse().is_none())
            .count();
        assert_eq!(entries.len(), applied - markers);
    }

    #[test]
    fn test_set_forwarding_records_previous_root() {
        let forwarding = Forwarding::new(0, 0, ShardId::new("host1", "users_0_0001"));
        let tr = Transformation::new(
            Some(t("SqlShard(host1)")),
            Some(t("SqlShard(host2)")),
            TransformOptions::default(),
        )
        .unwrap();
        let tree = Shard::new(
            ShardInfo::new(forwarding.shard_id.clone(), "SqlShard", "", ""),
            1,
            vec![],
        );
        let bound = tr.bind(&forwarding, Some(&tree), None).unwrap();

        let previous: Vec<Option<ShardId>> = Phase::ALL
            .iter()
            .flat_map(|p| bound.ops(*p))
            .filter_map(|op| match op {
                ResolvedOp::SetForwarding { previous, .. } => Some(previous.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            previous,
            vec![
                Some(ShardId::new("host1", "users_0_0001")),
                Some(ShardId::new("host2", "users_0_0001_blocked")),
            ]
        );
    }
}
