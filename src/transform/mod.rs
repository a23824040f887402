//! Transformations: diffing one shard tree shape into another.
//!
//! A [`Transformation`] compares an old template with a new one and compiles the
//! difference into topology operations grouped by [`Phase`]. Destinations that
//! need data are shielded by a wrapper shard while they are copied, so readers
//! never see a half-filled replica.
//!
//! # Phases
//!
//! ```text
//! prepare ──► copy ──► repair ──► diff ──► unblock_writes ──► unblock_reads ──► cleanup
//!   │          │         │          │             │                  │              │
//!   │          │         └──────────┘             └── batch finish ──┘              │
//!   │          │        optional checks                                             │
//!   create     copy                                                      expose dests,
//!   shards,    data                                                      drop wrappers
//!   wrap dests                                                           and old shards
//! ```
//!
//! When nothing needs copying every op runs in `prepare`.
//!
//! # Example
//!
//! ```rust
//! use shardshift::config::{TemplateOptions, TransformOptions};
//! use shardshift::template::ShardTemplate;
//! use shardshift::transform::{Phase, Transformation};
//!
//! let opts = TemplateOptions::default();
//! let from = ShardTemplate::parse("ReplicatingShard -> (SqlShard(db1), SqlShard(db2))", &opts).unwrap();
//! let to = ShardTemplate::parse("ReplicatingShard -> (SqlShard(db1), SqlShard(db2), SqlShard(db3))", &opts).unwrap();
//!
//! let t = Transformation::new(Some(from), Some(to), TransformOptions::default()).unwrap();
//! assert!(t.copies_required());
//! assert_eq!(t.ops(Phase::Copy).len(), 1);
//! ```

mod bound;
mod op;

pub use bound::{canonical_table_prefix, parse_enumeration, BoundTransformation};
pub use op::{Op, ResolvedOp};

use crate::config::TransformOptions;
use crate::error::{Error, Result};
use crate::nameserver::Shard;
use crate::template::ShardTemplate;
use crate::types::Forwarding;
use op::ExpandContext;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Ordered stage of a topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Create shards and shield copy destinations.
    Prepare,
    /// Copy data into destinations.
    Copy,
    /// Repair destinations against each other.
    Repair,
    /// Diff destinations against each other.
    Diff,
    /// Let destinations accept writes.
    UnblockWrites,
    /// Let destinations serve reads.
    UnblockReads,
    /// Drop wrappers and old shards.
    Cleanup,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 7] = [
        Phase::Prepare,
        Phase::Copy,
        Phase::Repair,
        Phase::Diff,
        Phase::UnblockWrites,
        Phase::UnblockReads,
        Phase::Cleanup,
    ];

    /// Phases whose work runs asynchronously on the hosts and is polled.
    pub fn is_async(self) -> bool {
        matches!(self, Phase::Copy | Phase::Repair | Phase::Diff)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Copy => "copy",
            Phase::Repair => "repair",
            Phase::Diff => "diff",
            Phase::UnblockWrites => "unblock_writes",
            Phase::UnblockReads => "unblock_reads",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Planned change from one tree shape to another.
///
/// The operation set is compiled once, at construction. Two transformations are
/// equal when they share `from`, `to` and copy wrapper.
#[derive(Debug, Clone)]
pub struct Transformation {
    from: Option<ShardTemplate>,
    to: Option<ShardTemplate>,
    options: TransformOptions,
    copy_source: Option<ShardTemplate>,
    copies_required: bool,
    operations: BTreeMap<Phase, Vec<Op>>,
}

impl Transformation {
    /// Compile the transformation from `from` to `to`.
    pub fn new(
        from: Option<ShardTemplate>,
        to: Option<ShardTemplate>,
        options: TransformOptions,
    ) -> Result<Self> {
        options.validate()?;

        let destinations: Vec<&ShardTemplate> = match (&from, &to) {
            (Some(from), Some(to)) => to
                .concrete_descendants()
                .into_iter()
                .filter(|d| !d.shared_host(from))
                .collect(),
            _ => Vec::new(),
        };
        let copies_required = !options.skip_copies && !destinations.is_empty();

        let sources: Vec<&ShardTemplate> =
            from.as_ref().map(|f| f.copy_sources()).unwrap_or_default();
        let copy_source = sources.first().copied();

        if copies_required && copy_source.is_none() {
            return Err(Error::InvalidCopySource {
                from: from.as_ref().map(ToString::to_string).unwrap_or_default(),
                to: to.as_ref().map(ToString::to_string).unwrap_or_default(),
            });
        }

        let operations = {
            let ctx = ExpandContext {
                copies_required,
                copy_source,
                sources,
                destinations,
                wrapper: options.copy_wrapper,
                batch_finish: options.batch_finish,
            };
            compile(from.as_ref(), to.as_ref(), &options, &ctx)
        };
        let copy_source = copy_source.cloned();

        Ok(Self {
            from,
            to,
            options,
            copy_source,
            copies_required,
            operations,
        })
    }

    pub fn from(&self) -> Option<&ShardTemplate> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&ShardTemplate> {
        self.to.as_ref()
    }

    pub fn options(&self) -> &TransformOptions {
        &self.options
    }

    /// Shard data is read from, when copies are required.
    pub fn copy_source(&self) -> Option<&ShardTemplate> {
        if self.copies_required {
            self.copy_source.as_ref()
        } else {
            None
        }
    }

    /// Check whether any new concrete shard needs data copied in.
    pub fn copies_required(&self) -> bool {
        self.copies_required
    }

    /// Operations by phase. Empty phases are absent.
    pub fn operations(&self) -> &BTreeMap<Phase, Vec<Op>> {
        &self.operations
    }

    /// Operations of one phase.
    pub fn ops(&self, phase: Phase) -> &[Op] {
        self.operations
            .get(&phase)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Check whether the transformation changes nothing.
    pub fn is_noop(&self) -> bool {
        self.operations.is_empty()
    }

    /// Bind to one forwarding and the tree it currently points at.
    pub fn bind(
        &self,
        forwarding: &Forwarding,
        tree: Option<&Shard>,
        base_name: Option<&str>,
    ) -> Result<BoundTransformation> {
        BoundTransformation::new(self.clone(), forwarding, tree, base_name)
    }

    fn key(&self) -> (&Option<ShardTemplate>, &Option<ShardTemplate>, crate::template::VirtualKind) {
        (&self.from, &self.to, self.options.copy_wrapper)
    }
}

/// Walk, collapse, expand and order the operations of a transformation.
fn compile(
    from: Option<&ShardTemplate>,
    to: Option<&ShardTemplate>,
    options: &TransformOptions,
    ctx: &ExpandContext<'_>,
) -> BTreeMap<Phase, Vec<Op>> {
    let mut ops = Vec::new();
    if let Some(from) = from {
        ops.extend(destroy_tree(from));
    }
    if let Some(to) = to {
        ops.extend(create_tree(to));
    }
    let mut ops = collapse(ops);

    if !ops.is_empty() && ctx.copies_required {
        if let Some(to) = to {
            let checked: Vec<ShardTemplate> =
                to.concrete_descendants().into_iter().cloned().collect();
            if options.repair {
                ops.push(Op::RepairShards(checked.clone()));
            }
            if options.diff {
                ops.push(Op::DiffShards(checked));
            }
        }
    }

    let mut operations: BTreeMap<Phase, Vec<Op>> = BTreeMap::new();
    for op in &ops {
        for (phase, expanded) in op.expand(ctx) {
            operations.entry(phase).or_default().push(expanded);
        }
    }

    if !operations.contains_key(&Phase::Copy) {
        let mut folded = Vec::new();
        for phase in Phase::ALL {
            if let Some(phase_ops) = operations.remove(&phase) {
                folded.extend(phase_ops);
            }
        }
        if !folded.is_empty() {
            operations.insert(Phase::Prepare, folded);
        }
    }

    for phase_ops in operations.values_mut() {
        phase_ops.sort_by_key(Op::priority);
    }
    operations
}

/// Remove the forwarding, then every link and shard bottom-up.
fn destroy_tree(root: &ShardTemplate) -> Vec<Op> {
    let mut ops = vec![Op::CommitBegin, Op::RemoveForwarding(root.clone())];
    ops.extend(destroy_children(root));
    ops.push(Op::DeleteShard(root.clone()));
    ops.push(Op::CommitEnd);
    ops
}

fn destroy_children(parent: &ShardTemplate) -> Vec<Op> {
    let mut ops = Vec::new();
    for child in parent.children() {
        ops.extend(destroy_children(child));
        ops.push(Op::RemoveLink {
            up: parent.clone(),
            down: child.clone(),
        });
        ops.push(Op::DeleteShard(child.clone()));
    }
    ops
}

/// Create every shard and link top-down, then the forwarding.
fn create_tree(root: &ShardTemplate) -> Vec<Op> {
    let mut ops = vec![Op::CreateShard(root.clone())];
    ops.extend(create_children(root));
    ops.push(Op::SetForwarding(root.clone()));
    ops
}

fn create_children(parent: &ShardTemplate) -> Vec<Op> {
    let mut ops = Vec::new();
    for child in parent.children() {
        ops.push(Op::CreateShard(child.clone()));
        ops.push(Op::AddLink {
            up: parent.clone(),
            down: child.clone(),
        });
        ops.extend(create_children(child));
    }
    ops
}

/// Drop ops cancelled by another op in the same list.
fn collapse(ops: Vec<Op>) -> Vec<Op> {
    let survivors: Vec<Op> = ops
        .iter()
        .filter(|op| !ops.iter().any(|other| op.is_inverse_of(other)))
        .cloned()
        .collect();

    // A bound transformation addresses a single forwarding slot, so setting it
    // replaces the old root. Re-adding a link re-weights it in place.
    let sets_forwarding = survivors.iter().any(|op| matches!(op, Op::SetForwarding(_)));
    let survivors: Vec<Op> = survivors
        .iter()
        .filter(|op| !(sets_forwarding && matches!(op, Op::RemoveForwarding(_))))
        .filter(|op| !survivors.iter().any(|other| op.is_reweighted_by(other)))
        .cloned()
        .collect();

    if survivors.iter().all(Op::is_trivial) {
        Vec::new()
    } else {
        survivors
    }
}

impl PartialEq for Transformation {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Transformation {}

impl Hash for Transformation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl Ord for Transformation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Transformation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |t: &Option<ShardTemplate>| {
            t.as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "(none)".to_string())
        };
        writeln!(f, "{} => {}", side(&self.from), side(&self.to))?;
        for (phase, ops) in &self.operations {
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
    use crate::config::TemplateOptions;
    use crate::template::VirtualKind;

    fn t(text: &str) -> ShardTemplate {
        ShardTemplate::parse(text, &TemplateOptions::default()).unwrap()
    }

    fn transform(from: &str, to: &str) -> Transformation {
        Transformation::new(Some(t(from)), Some(t(to)), TransformOptions::default()).unwrap()
    }

    fn rendered(tr: &Transformation, phase: Phase) -> Vec<String> {
        tr.ops(phase).iter().map(ToString::to_string).collect()
    }

    const PAIR: &str = "ReplicatingShard -> (SqlShard(host1), SqlShard(host2))";

    #[test]
    fn test_self_transform_is_noop() {
        for text in [
            "SqlShard(host1)",
            PAIR,
            "ReplicatingShard -> (SqlShard(host1,3), BlockedShard -> SqlShard(host2))",
        ] {
            let tr = transform(text, text);
            assert!(tr.is_noop(), "{text}");
            assert!(tr.operations().is_empty());
        }
    }

    #[test]
    fn test_create_and_destroy_cancel() {
        let template = t("ReplicatingShard -> (SqlShard(host1), FailingOverShard -> (SqlShard(host2), SqlShard(host3)))");
        let mut ops = create_tree(&template);
        ops.extend(destroy_tree(&template));
        assert!(collapse(ops).is_empty());
    }

    #[test]
    fn test_walk_shapes() {
        let template = t(PAIR);
        let created: Vec<String> = create_tree(&template).iter().map(ToString::to_string).collect();
        assert_eq!(
            created,
            vec![
                "create_shard(ReplicatingShard/localhost)",
                "create_shard(SqlShard/host1)",
                "add_link(ReplicatingShard/localhost -> SqlShard/host1)",
                "create_shard(SqlShard/host2)",
                "add_link(ReplicatingShard/localhost -> SqlShard/host2)",
                "set_forwarding(ReplicatingShard/localhost)",
            ]
        );

        let destroyed: Vec<String> = destroy_tree(&template).iter().map(ToString::to_string).collect();
        assert_eq!(destroyed.first().map(String::as_str), Some("commit_begin"));
        assert_eq!(destroyed[1], "remove_forwarding(ReplicatingShard/localhost)");
        assert_eq!(destroyed[2], "remove_link(ReplicatingShard/localhost -> SqlShard/host1)");
        assert_eq!(destroyed[3], "delete_shard(SqlShard/host1)");
        assert_eq!(destroyed[6], "delete_shard(ReplicatingShard/localhost)");
        assert_eq!(destroyed.last().map(String::as_str), Some("commit_end"));
    }

    #[test]
    fn test_add_replica() {
        let tr = transform(
            PAIR,
            "ReplicatingShard -> (SqlShard(host1), SqlShard(host2), SqlShard(host3))",
        );
        assert!(tr.copies_required());
        assert_eq!(tr.copy_source().map(|s| s.host()), Some("host1"));

        assert_eq!(
            rendered(&tr, Phase::Prepare),
            vec![
                "create_shard(SqlShard/host3)",
                "create_shard(BlockedShard/host3)",
                "add_link(BlockedShard/host3 -> SqlShard/host3)",
                "add_link(ReplicatingShard/localhost -> BlockedShard/host3)",
            ]
        );
        assert_eq!(
            rendered(&tr, Phase::Copy),
            vec!["copy_shard(SqlShard/host1 => SqlShard/host3)"]
        );
        assert_eq!(
            rendered(&tr, Phase::Cleanup),
            vec![
                "add_link(ReplicatingShard/localhost -> SqlShard/host3)",
                "commit_begin",
                "remove_link(BlockedShard/host3 -> SqlShard/host3)",
                "remove_link(ReplicatingShard/localhost -> BlockedShard/host3)",
                "delete_shard(BlockedShard/host3)",
                "commit_end",
            ]
        );
    }

    #[test]
    fn test_partition_migration() {
        let tr = transform(PAIR, "ReplicatingShard -> (SqlShard(host3), SqlShard(host4))");

        let prepare = tr.ops(Phase::Prepare);
        let creates = prepare.iter().filter(|op| matches!(op, Op::CreateShard(_))).count();
        let wrappers = prepare
            .iter()
            .filter(|op| matches!(op, Op::CreateShard(w) if w.virtual_kind() == Some(VirtualKind::Blocked)))
            .count();
        let links = prepare.iter().filter(|op| matches!(op, Op::AddLink { .. })).count();
        assert_eq!((creates, wrappers, links, prepare.len()), (4, 2, 4, 8));

        assert_eq!(
            rendered(&tr, Phase::Copy),
            vec![
                "copy_shard(SqlShard/host1 => SqlShard/host3)",
                "copy_shard(SqlShard/host1 => SqlShard/host4)",
            ]
        );

        let cleanup = rendered(&tr, Phase::Cleanup);
        for expected in [
            "remove_link(ReplicatingShard/localhost -> SqlShard/host1)",
            "remove_link(ReplicatingShard/localhost -> SqlShard/host2)",
            "delete_shard(SqlShard/host1)",
            "delete_shard(SqlShard/host2)",
            "delete_shard(BlockedShard/host3)",
            "delete_shard(BlockedShard/host4)",
            "add_link(ReplicatingShard/localhost -> SqlShard/host3)",
        ] {
            assert!(cleanup.iter().any(|op| op == expected), "missing {expected}");
        }
        let priorities: Vec<u8> = tr.ops(Phase::Cleanup).iter().map(Op::priority).collect();
        assert!(priorities.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_move_single_shard() {
        let tr = transform("SqlShard(host1)", "SqlShard(host2)");
        assert_eq!(
            rendered(&tr, Phase::Prepare),
            vec![
                "create_shard(SqlShard/host2)",
                "create_shard(BlockedShard/host2)",
                "add_link(BlockedShard/host2 -> SqlShard/host2)",
                "set_forwarding(BlockedShard/host2)",
            ]
        );
        assert_eq!(
            rendered(&tr, Phase::Cleanup),
            vec![
                "set_forwarding(SqlShard/host2)",
                "commit_begin",
                "remove_link(BlockedShard/host2 -> SqlShard/host2)",
                "delete_shard(SqlShard/host1)",
                "delete_shard(BlockedShard/host2)",
                "commit_end",
            ]
        );
    }

    #[test]
    fn test_no_copy_folds_into_prepare() {
        let tr = transform(PAIR, "ReplicatingShard -> SqlShard(host1)");
        assert!(!tr.copies_required());
        assert_eq!(tr.operations().keys().collect::<Vec<_>>(), vec![&Phase::Prepare]);
        assert!(rendered(&tr, Phase::Prepare)
            .iter()
            .any(|op| op == "delete_shard(SqlShard/host2)"));

        let skipped = Transformation::new(
            Some(t("SqlShard(host1)")),
            Some(t("SqlShard(host2)")),
            TransformOptions::default().with_skip_copies(true),
        )
        .unwrap();
        assert!(!skipped.copies_required());
        assert_eq!(skipped.operations().len(), 1);
        assert_eq!(
            rendered(&skipped, Phase::Prepare),
            vec![
                "create_shard(SqlShard/host2)",
                "set_forwarding(SqlShard/host2)",
                "commit_begin",
                "delete_shard(SqlShard/host1)",
                "commit_end",
            ]
        );
    }

    #[test]
    fn test_reweight_keeps_link() {
        let tr = transform(PAIR, "ReplicatingShard -> (SqlShard(host1,3), SqlShard(host2))");
        assert_eq!(
            rendered(&tr, Phase::Prepare),
            vec![
                "add_link(ReplicatingShard/localhost -> SqlShard/host1)",
                "commit_begin",
                "commit_end",
            ]
        );
    }

    #[test]
    fn test_invalid_copy_source() {
        for kind in [
            VirtualKind::ReadOnly,
            VirtualKind::WriteOnly,
            VirtualKind::Blocked,
            VirtualKind::BlackHole,
        ] {
            let from = ShardTemplate::wrapper_for(kind, &t("SqlShard(host1)"));
            let result = Transformation::new(
                Some(from),
                Some(t("SqlShard(host2)")),
                TransformOptions::default(),
            );
            assert!(
                matches!(result, Err(Error::InvalidCopySource { .. })),
                "{kind} should not be a copy source"
            );
        }
    }

    #[test]
    fn test_invalid_wrapper() {
        let result = Transformation::new(
            Some(t("SqlShard(host1)")),
            Some(t("SqlShard(host2)")),
            TransformOptions::default().with_copy_wrapper(VirtualKind::FailingOver),
        );
        assert!(matches!(result, Err(Error::InvalidWrapper(_))));
    }

    #[test]
    fn test_batch_finish_stages_exposure() {
        let tr = Transformation::new(
            Some(t("SqlShard(host1)")),
            Some(t("SqlShard(host2)")),
            TransformOptions::default().with_batch_finish(true),
        )
        .unwrap();

        assert_eq!(
            rendered(&tr, Phase::UnblockWrites),
            vec![
                "create_shard(WriteOnlyShard/host2)",
                "add_link(WriteOnlyShard/host2 -> SqlShard/host2)",
                "set_forwarding(WriteOnlyShard/host2)",
                "remove_link(BlockedShard/host2 -> SqlShard/host2)",
                "delete_shard(BlockedShard/host2)",
            ]
        );
        assert_eq!(
            rendered(&tr, Phase::UnblockReads),
            vec![
                "set_forwarding(SqlShard/host2)",
                "remove_link(WriteOnlyShard/host2 -> SqlShard/host2)",
                "delete_shard(WriteOnlyShard/host2)",
            ]
        );
        assert_eq!(
            rendered(&tr, Phase::Cleanup),
            vec!["commit_begin", "delete_shard(SqlShard/host1)", "commit_end"]
        );

        let write_only = Transformation::new(
            Some(t("SqlShard(host1)")),
            Some(t("SqlShard(host2)")),
            TransformOptions::default()
                .with_batch_finish(true)
                .with_copy_wrapper(VirtualKind::WriteOnly),
        )
        .unwrap();
        assert!(write_only.ops(Phase::UnblockWrites).is_empty());
        assert_eq!(write_only.ops(Phase::UnblockReads).len(), 3);
    }

    #[test]
    fn test_verification_phases() {
        let tr = Transformation::new(
            Some(t("SqlShard(host1)")),
            Some(t("ReplicatingShard -> (SqlShard(host1), SqlShard(host2))")),
            TransformOptions::default().with_repair(true).with_diff(true),
        )
        .unwrap();
        assert_eq!(
            rendered(&tr, Phase::Repair),
            vec!["repair_shards(SqlShard/host1, SqlShard/host2)"]
        );
        assert_eq!(
            rendered(&tr, Phase::Diff),
            vec!["diff_shards(SqlShard/host1, SqlShard/host2)"]
        );
    }

    #[test]
    fn test_create_only_and_destroy_only() {
        let created = Transformation::new(None, Some(t(PAIR)), TransformOptions::default()).unwrap();
        assert!(!created.copies_required());
        assert_eq!(created.ops(Phase::Prepare).len(), 6);

        let destroyed = Transformation::new(Some(t(PAIR)), None, TransformOptions::default()).unwrap();
        assert_eq!(destroyed.ops(Phase::Prepare).len(), 8);
        assert_eq!(destroyed.ops(Phase::Prepare)[0], Op::CommitBegin);
    }

    #[test]
    fn test_equality_and_order() {
        let a = transform("SqlShard(host1)", "SqlShard(host2)");
        let b = transform("SqlShard(host1)", "SqlShard(host2)");
        let c = transform("SqlShard(host1)", "SqlShard(host3)");
        assert_eq!(a, b);
        assert!(a < c);

        let wrapped = Transformation::new(
            Some(t("SqlShard(host1)")),
            Some(t("SqlShard(host2)")),
            TransformOptions::default().with_copy_wrapper(VirtualKind::WriteOnly),
        )
        .unwrap();
        assert_ne!(a, wrapped);
    }
}
