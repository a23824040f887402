//! Topology operations, before and after binding to concrete shard ids.

use super::Phase;
use crate::error::Result;
use crate::nameserver::Nameserver;
use crate::template::{ShardTemplate, VirtualKind};
use crate::types::{Forwarding, ShardId, ShardInfo, BUSY};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single planned change, expressed on templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    CreateShard(ShardTemplate),
    DeleteShard(ShardTemplate),
    AddLink {
        up: ShardTemplate,
        down: ShardTemplate,
    },
    RemoveLink {
        up: ShardTemplate,
        down: ShardTemplate,
    },
    SetForwarding(ShardTemplate),
    RemoveForwarding(ShardTemplate),
    CopyShard {
        source: ShardTemplate,
        dest: ShardTemplate,
    },
    RepairShards(Vec<ShardTemplate>),
    DiffShards(Vec<ShardTemplate>),
    CommitBegin,
    CommitEnd,
}

/// What an op needs to know about its transformation to pick its phases.
#[derive(Debug)]
pub(super) struct ExpandContext<'a> {
    pub copies_required: bool,
    pub copy_source: Option<&'a ShardTemplate>,
    /// Every readable concrete shard of the old tree.
    pub sources: Vec<&'a ShardTemplate>,
    /// Concrete shards of the new tree that need data.
    pub destinations: Vec<&'a ShardTemplate>,
    pub wrapper: VirtualKind,
    pub batch_finish: bool,
}

impl ExpandContext<'_> {
    fn is_destination(&self, t: &ShardTemplate) -> bool {
        self.copies_required && self.destinations.iter().any(|d| d.shard_eq(t))
    }

    /// True for a copy source or any ancestor of one.
    fn holds_source(&self, t: &ShardTemplate) -> bool {
        self.copies_required && self.sources.iter().any(|s| t.shared_host(s))
    }

    fn wrap(&self, t: &ShardTemplate) -> ShardTemplate {
        ShardTemplate::wrapper_for(self.wrapper, t)
    }

    fn write_only(&self, t: &ShardTemplate) -> ShardTemplate {
        ShardTemplate::wrapper_for(VirtualKind::WriteOnly, t)
    }

    /// Where destination exposure happens, and whether writes open first.
    fn staged(&self) -> (Phase, bool) {
        if !self.batch_finish {
            (Phase::Cleanup, false)
        } else {
            (Phase::UnblockReads, self.wrapper.blocks_writes())
        }
    }
}

impl Op {
    /// Fixed execution order within a phase.
    pub fn priority(&self) -> u8 {
        match self {
            Op::CreateShard(_) => 0,
            Op::AddLink { .. } => 1,
            Op::SetForwarding(_) => 2,
            Op::CommitBegin => 3,
            Op::RemoveForwarding(_) => 4,
            Op::RemoveLink { .. } => 5,
            Op::DeleteShard(_) => 6,
            Op::CopyShard { .. } => 7,
            Op::RepairShards(_) => 8,
            Op::DiffShards(_) => 9,
            Op::CommitEnd => 10,
        }
    }

    /// Commit markers carry no change of their own.
    pub fn is_trivial(&self) -> bool {
        matches!(self, Op::CommitBegin | Op::CommitEnd)
    }

    /// Check whether applying both ops leaves the topology unchanged.
    pub fn is_inverse_of(&self, other: &Op) -> bool {
        match (self, other) {
            (Op::CreateShard(a), Op::DeleteShard(b)) | (Op::DeleteShard(a), Op::CreateShard(b)) => {
                a.shard_eq(b)
            }
            (Op::AddLink { up: u1, down: d1 }, Op::RemoveLink { up: u2, down: d2 })
            | (Op::RemoveLink { up: u1, down: d1 }, Op::AddLink { up: u2, down: d2 }) => {
                u1.shard_eq(u2) && d1.link_eq(d2)
            }
            (Op::SetForwarding(a), Op::RemoveForwarding(b))
            | (Op::RemoveForwarding(a), Op::SetForwarding(b)) => a.shard_eq(b),
            _ => false,
        }
    }

    /// Check whether `self` removes a link that `other` re-adds with a new weight.
    pub(super) fn is_reweighted_by(&self, other: &Op) -> bool {
        match (self, other) {
            (Op::RemoveLink { up: u1, down: d1 }, Op::AddLink { up: u2, down: d2 }) => {
                u1.shard_eq(u2) && d1.shard_eq(d2)
            }
            _ => false,
        }
    }

    /// Spread this op over the phases it needs.
    pub(super) fn expand(&self, ctx: &ExpandContext<'_>) -> Vec<(Phase, Op)> {
        let (expose, open_writes_first) = ctx.staged();

        match self {
            Op::CreateShard(dest) if ctx.is_destination(dest) => {
                let wrapper = ctx.wrap(dest);
                let mut ops = vec![
                    (Phase::Prepare, self.clone()),
                    (Phase::Prepare, Op::CreateShard(wrapper.clone())),
                    (Phase::Prepare, link(&wrapper, dest)),
                ];
                if let Some(source) = ctx.copy_source {
                    ops.push((
                        Phase::Copy,
                        Op::CopyShard {
                            source: source.clone(),
                            dest: dest.clone(),
                        },
                    ));
                }
                let teardown_phase = if open_writes_first {
                    let write_only = ctx.write_only(dest);
                    ops.push((Phase::UnblockWrites, Op::CreateShard(write_only.clone())));
                    ops.push((Phase::UnblockWrites, link(&write_only, dest)));
                    ops.push((Phase::UnblockReads, unlink(&write_only, dest)));
                    ops.push((Phase::UnblockReads, Op::DeleteShard(write_only)));
                    Phase::UnblockWrites
                } else {
                    expose
                };
                ops.push((teardown_phase, unlink(&wrapper, dest)));
                ops.push((teardown_phase, Op::DeleteShard(wrapper)));
                ops
            }
            Op::AddLink { up, down } if ctx.is_destination(down) => {
                let wrapper = ctx.wrap(down);
                let mut ops = vec![(Phase::Prepare, link(up, &wrapper))];
                if open_writes_first {
                    let write_only = ctx.write_only(down);
                    ops.push((Phase::UnblockWrites, link(up, &write_only)));
                    ops.push((Phase::UnblockWrites, unlink(up, &wrapper)));
                    ops.push((Phase::UnblockReads, self.clone()));
                    ops.push((Phase::UnblockReads, unlink(up, &write_only)));
                } else {
                    ops.push((expose, self.clone()));
                    ops.push((expose, unlink(up, &wrapper)));
                }
                ops
            }
            Op::SetForwarding(dest) if ctx.is_destination(dest) => {
                let mut ops = vec![(Phase::Prepare, Op::SetForwarding(ctx.wrap(dest)))];
                if open_writes_first {
                    ops.push((Phase::UnblockWrites, Op::SetForwarding(ctx.write_only(dest))));
                }
                ops.push((expose, self.clone()));
                ops
            }
            Op::DeleteShard(t) | Op::RemoveForwarding(t) if ctx.holds_source(t) => {
                vec![(Phase::Cleanup, self.clone())]
            }
            Op::RemoveLink { down, .. } if ctx.holds_source(down) => {
                vec![(Phase::Cleanup, self.clone())]
            }
            Op::CommitBegin | Op::CommitEnd if ctx.copies_required => {
                vec![(Phase::Cleanup, self.clone())]
            }
            Op::CopyShard { .. } => vec![(Phase::Copy, self.clone())],
            Op::RepairShards(_) => vec![(Phase::Repair, self.clone())],
            Op::DiffShards(_) => vec![(Phase::Diff, self.clone())],
            _ => vec![(Phase::Prepare, self.clone())],
        }
    }

    /// Bind templates to nameserver ids.
    pub(super) fn resolve(
        &self,
        id_of: &impl Fn(&ShardTemplate) -> ShardId,
        forwarding: &Forwarding,
    ) -> ResolvedOp {
        let info = |t: &ShardTemplate| {
            ShardInfo::new(id_of(t), t.shard_type(), t.source_type(), t.dest_type())
        };
        match self {
            Op::CreateShard(t) => ResolvedOp::CreateShard(info(t)),
            Op::DeleteShard(t) => ResolvedOp::DeleteShard(info(t)),
            Op::AddLink { up, down } => ResolvedOp::AddLink {
                up: id_of(up),
                down: id_of(down),
                weight: down.weight(),
            },
            Op::RemoveLink { up, down } => ResolvedOp::RemoveLink {
                up: id_of(up),
                down: id_of(down),
                weight: down.weight(),
            },
            Op::SetForwarding(t) => ResolvedOp::SetForwarding {
                forwarding: forwarding.with_shard(id_of(t)),
                previous: None,
            },
            Op::RemoveForwarding(t) => ResolvedOp::RemoveForwarding(forwarding.with_shard(id_of(t))),
            Op::CopyShard { source, dest } => ResolvedOp::CopyShard {
                source: id_of(source),
                dest: id_of(dest),
            },
            Op::RepairShards(ts) => ResolvedOp::RepairShards(ts.iter().map(id_of).collect()),
            Op::DiffShards(ts) => ResolvedOp::DiffShards(ts.iter().map(id_of).collect()),
            Op::CommitBegin => ResolvedOp::CommitBegin,
            Op::CommitEnd => ResolvedOp::CommitEnd,
        }
    }
}

fn link(up: &ShardTemplate, down: &ShardTemplate) -> Op {
    Op::AddLink {
        up: up.clone(),
        down: down.clone(),
    }
}

fn unlink(up: &ShardTemplate, down: &ShardTemplate) -> Op {
    Op::RemoveLink {
        up: up.clone(),
        down: down.clone(),
    }
}

fn short_list(ts: &[ShardTemplate]) -> String {
    ts.iter().map(ShardTemplate::short_id).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::CreateShard(t) => write!(f, "create_shard({})", t.short_id()),
            Op::DeleteShard(t) => write!(f, "delete_shard({})", t.short_id()),
            Op::AddLink { up, down } => write!(f, "add_link({} -> {})", up.short_id(), down.short_id()),
            Op::RemoveLink { up, down } => {
                write!(f, "remove_link({} -> {})", up.short_id(), down.short_id())
            }
            Op::SetForwarding(t) => write!(f, "set_forwarding({})", t.short_id()),
            Op::RemoveForwarding(t) => write!(f, "remove_forwarding({})", t.short_id()),
            Op::CopyShard { source, dest } => {
                write!(f, "copy_shard({} => {})", source.short_id(), dest.short_id())
            }
            Op::RepairShards(ts) => write!(f, "repair_shards({})", short_list(ts)),
            Op::DiffShards(ts) => write!(f, "diff_shards({})", short_list(ts)),
            Op::CommitBegin => f.write_str("commit_begin"),
            Op::CommitEnd => f.write_str("commit_end"),
        }
    }
}

/// An op bound to concrete nameserver ids, ready to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedOp {
    CreateShard(ShardInfo),
    DeleteShard(ShardInfo),
    AddLink {
        up: ShardId,
        down: ShardId,
        weight: u32,
    },
    RemoveLink {
        up: ShardId,
        down: ShardId,
        weight: u32,
    },
    SetForwarding {
        forwarding: Forwarding,
        /// Root the slot pointed at before, if any.
        previous: Option<ShardId>,
    },
    RemoveForwarding(Forwarding),
    CopyShard {
        source: ShardId,
        dest: ShardId,
    },
    RepairShards(Vec<ShardId>),
    DiffShards(Vec<ShardId>),
    CommitBegin,
    CommitEnd,
}

impl ResolvedOp {
    /// Send this op to the nameserver.
    pub async fn apply(&self, nameserver: &dyn Nameserver) -> Result<()> {
        match self {
            ResolvedOp::CreateShard(info) => nameserver.create_shard(info).await,
            ResolvedOp::DeleteShard(info) => nameserver.delete_shard(&info.id).await,
            ResolvedOp::AddLink { up, down, weight } => nameserver.add_link(up, down, *weight).await,
            ResolvedOp::RemoveLink { up, down, .. } => nameserver.remove_link(up, down).await,
            ResolvedOp::SetForwarding { forwarding, .. } => {
                nameserver.set_forwarding(forwarding).await
            }
            ResolvedOp::RemoveForwarding(forwarding) => {
                nameserver.remove_forwarding(forwarding).await
            }
            ResolvedOp::CopyShard { source, dest } => {
                nameserver.mark_shard_busy(dest, BUSY).await?;
                nameserver.copy_shard(source, dest).await
            }
            ResolvedOp::RepairShards(ids) => {
                for id in ids {
                    nameserver.mark_shard_busy(id, BUSY).await?;
                }
                nameserver.repair_shards(ids).await
            }
            ResolvedOp::DiffShards(ids) => {
                for id in ids {
                    nameserver.mark_shard_busy(id, BUSY).await?;
                }
                nameserver.diff_shards(ids).await
            }
            ResolvedOp::CommitBegin | ResolvedOp::CommitEnd => Ok(()),
        }
    }

    /// The op that undoes this one, if the change is reversible.
    pub fn inverse(&self) -> Option<ResolvedOp> {
        match self {
            ResolvedOp::CreateShard(info) => Some(ResolvedOp::DeleteShard(info.clone())),
            ResolvedOp::DeleteShard(info) => Some(ResolvedOp::CreateShard(info.clone())),
            ResolvedOp::AddLink { up, down, weight } => Some(ResolvedOp::RemoveLink {
                up: up.clone(),
                down: down.clone(),
                weight: *weight,
            }),
            ResolvedOp::RemoveLink { up, down, weight } => Some(ResolvedOp::AddLink {
                up: up.clone(),
                down: down.clone(),
                weight: *weight,
            }),
            ResolvedOp::SetForwarding {
                forwarding,
                previous: Some(previous),
            } => Some(ResolvedOp::SetForwarding {
                forwarding: forwarding.with_shard(previous.clone()),
                previous: Some(forwarding.shard_id.clone()),
            }),
            ResolvedOp::SetForwarding {
                forwarding,
                previous: None,
            } => Some(ResolvedOp::RemoveForwarding(forwarding.clone())),
            ResolvedOp::RemoveForwarding(forwarding) => Some(ResolvedOp::SetForwarding {
                forwarding: forwarding.clone(),
                previous: None,
            }),
            ResolvedOp::CopyShard { .. }
            | ResolvedOp::RepairShards(_)
            | ResolvedOp::DiffShards(_)
            | ResolvedOp::CommitBegin
            | ResolvedOp::CommitEnd => None,
        }
    }

    /// Shards this op reads or writes.
    pub fn involved_shards(&self) -> Vec<&ShardId> {
        match self {
            ResolvedOp::CreateShard(info) | ResolvedOp::DeleteShard(info) => vec![&info.id],
            ResolvedOp::AddLink { up, down, .. } | ResolvedOp::RemoveLink { up, down, .. } => {
                vec![up, down]
            }
            ResolvedOp::SetForwarding { forwarding, .. }
            | ResolvedOp::RemoveForwarding(forwarding) => vec![&forwarding.shard_id],
            ResolvedOp::CopyShard { source, dest } => vec![source, dest],
            ResolvedOp::RepairShards(ids) | ResolvedOp::DiffShards(ids) => ids.iter().collect(),
            ResolvedOp::CommitBegin | ResolvedOp::CommitEnd => Vec::new(),
        }
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, ResolvedOp::CopyShard { .. })
    }
}

fn id_list(ids: &[ShardId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for ResolvedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedOp::CreateShard(info) => {
                write!(f, "create_shard({}, {})", info.id, info.class_name)
            }
            ResolvedOp::DeleteShard(info) => write!(f, "delete_shard({})", info.id),
            ResolvedOp::AddLink { up, down, weight } => {
                write!(f, "add_link({} -> {}, {})", up, down, weight)
            }
            ResolvedOp::RemoveLink { up, down, .. } => write!(f, "remove_link({} -> {})", up, down),
            ResolvedOp::SetForwarding { forwarding, .. } => {
                write!(f, "set_forwarding({})", forwarding)
            }
            ResolvedOp::RemoveForwarding(forwarding) => {
                write!(f, "remove_forwarding({})", forwarding)
            }
            ResolvedOp::CopyShard { source, dest } => write!(f, "copy_shard({} => {})", source, dest),
            ResolvedOp::RepairShards(ids) => write!(f, "repair_shards({})", id_list(ids)),
            ResolvedOp::DiffShards(ids) => write!(f, "diff_shards({})", id_list(ids)),
            ResolvedOp::CommitBegin => f.write_str("commit_begin"),
            ResolvedOp::CommitEnd => f.write_str("commit_end"),
        }
    }
}
