//! Shard templates: abstract shard tree shapes.
//!
//! A template describes the *shape* of a shard tree (types, hosts, link weights)
//! without the concrete table prefixes the nameserver uses to name shards. Two
//! trees that serve the same data from the same hosts produce equal templates,
//! which is what lets the planner diff a desired layout against an observed one.
//!
//! # Equivalence
//!
//! ```text
//! ==          type, host, source, dest, weight and children (deep)
//! link_eq     type, host, source, dest, weight
//! shard_eq    type, host, source, dest
//! shared_host some concrete descendant of each side is shard_eq
//! ```
//!
//! # Example
//!
//! ```rust
//! use shardshift::template::ShardTemplate;
//! use shardshift::config::TemplateOptions;
//!
//! let t = ShardTemplate::parse(
//!     "ReplicatingShard -> (SqlShard(db1,1), SqlShard(db2,1))",
//!     &TemplateOptions::default(),
//! ).unwrap();
//! assert_eq!(t.host(), "localhost");
//! assert_eq!(t.concrete_descendants().len(), 2);
//! ```

mod parse;

use crate::config::TemplateOptions;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Placeholder host for virtual shards that fan out to several children.
pub const ABSTRACT_HOST: &str = "localhost";

/// Link weight used when none is given.
pub const DEFAULT_WEIGHT: u32 = 1;

/// Known virtual (routing/wrapper) shard types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VirtualKind {
    /// Writes to every child, reads from one.
    Replicating,
    /// Reads from the first healthy child.
    FailingOver,
    /// Rejects writes.
    ReadOnly,
    /// Rejects reads.
    WriteOnly,
    /// Rejects reads and writes.
    Blocked,
    /// Discards writes and returns nothing.
    BlackHole,
}

impl VirtualKind {
    /// All virtual kinds.
    pub const ALL: [VirtualKind; 6] = [
        VirtualKind::Replicating,
        VirtualKind::FailingOver,
        VirtualKind::ReadOnly,
        VirtualKind::WriteOnly,
        VirtualKind::Blocked,
        VirtualKind::BlackHole,
    ];

    /// Class name stored in the nameserver.
    pub fn class_name(self) -> &'static str {
        match self {
            VirtualKind::Replicating => "ReplicatingShard",
            VirtualKind::FailingOver => "FailingOverShard",
            VirtualKind::ReadOnly => "ReadOnlyShard",
            VirtualKind::WriteOnly => "WriteOnlyShard",
            VirtualKind::Blocked => "BlockedShard",
            VirtualKind::BlackHole => "BlackHoleShard",
        }
    }

    /// Suffix appended to the table prefix of shards of this kind.
    pub fn table_suffix(self) -> &'static str {
        match self {
            VirtualKind::Replicating => "replicating",
            VirtualKind::FailingOver => "failing_over",
            VirtualKind::ReadOnly => "read_only",
            VirtualKind::WriteOnly => "write_only",
            VirtualKind::Blocked => "blocked",
            VirtualKind::BlackHole => "black_hole",
        }
    }

    /// Resolve a (possibly package-qualified) class name.
    pub fn from_class_name(name: &str) -> Option<Self> {
        let short = short_type(name);
        Self::ALL.into_iter().find(|k| k.class_name() == short)
    }

    /// Check if this kind fans writes out to several children.
    pub fn is_replicating(self) -> bool {
        matches!(self, VirtualKind::Replicating | VirtualKind::FailingOver)
    }

    /// Check if data below this kind may be read for a copy.
    pub fn is_valid_copy_source(self) -> bool {
        !matches!(
            self,
            VirtualKind::ReadOnly
                | VirtualKind::WriteOnly
                | VirtualKind::Blocked
                | VirtualKind::BlackHole
        )
    }

    /// Check if writes are refused while this wrapper is in place.
    pub fn blocks_writes(self) -> bool {
        matches!(self, VirtualKind::Blocked)
    }

    /// Kinds that only exist while a migration is in flight.
    pub fn is_transitional(self) -> bool {
        matches!(self, VirtualKind::Blocked | VirtualKind::BlackHole)
    }
}

impl fmt::Display for VirtualKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

impl FromStr for VirtualKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_class_name(s)
            .or_else(|| Self::ALL.into_iter().find(|k| k.table_suffix() == s))
            .ok_or_else(|| Error::InvalidWrapper(s.to_string()))
    }
}

/// Strip any package qualifier from a class name.
pub fn short_type(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// The identity of a single shard inside a template, ignoring links.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub shard_type: String,
    pub host: String,
    pub source_type: String,
    pub dest_type: String,
}

/// Abstract shape of a shard tree.
///
/// Templates are immutable. Children are stored in canonical order (heaviest
/// first, ties by natural order), so two templates built from the same parts in
/// a different order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardTemplate {
    shard_type: String,
    host: String,
    weight: u32,
    source_type: String,
    dest_type: String,
    children: Vec<ShardTemplate>,
}

impl ShardTemplate {
    /// Create a template, validating its invariants.
    ///
    /// The `host` of a virtual template is ignored: it is derived from its children.
    pub fn new(
        shard_type: impl Into<String>,
        host: impl Into<String>,
        weight: u32,
        source_type: impl Into<String>,
        dest_type: impl Into<String>,
        mut children: Vec<ShardTemplate>,
    ) -> Result<Self> {
        let shard_type = shard_type.into();
        if !is_identifier(&shard_type) {
            return Err(Error::MalformedTemplate(format!(
                "unknown shard type {:?}",
                shard_type
            )));
        }

        let host = if VirtualKind::from_class_name(&shard_type).is_some() {
            if children.is_empty() {
                return Err(Error::MalformedTemplate(format!(
                    "{} requires at least one child",
                    shard_type
                )));
            }
            children.sort_by(canonical_child_order);
            if children.len() == 1 {
                children[0].host.clone()
            } else {
                ABSTRACT_HOST.to_string()
            }
        } else {
            let host = host.into();
            if !children.is_empty() {
                return Err(Error::MalformedTemplate(format!(
                    "concrete shard {} cannot have children",
                    shard_type
                )));
            }
            if host.is_empty() {
                return Err(Error::MalformedTemplate(format!(
                    "concrete shard {} requires a host",
                    shard_type
                )));
            }
            host
        };

        Ok(Self {
            shard_type,
            host,
            weight,
            source_type: source_type.into(),
            dest_type: dest_type.into(),
            children,
        })
    }

    /// Create a concrete leaf template with empty source/dest types.
    pub fn concrete(shard_type: impl Into<String>, host: impl Into<String>, weight: u32) -> Result<Self> {
        Self::new(shard_type, host, weight, "", "", Vec::new())
    }

    /// Create a virtual template over the given children.
    pub fn virtual_over(kind: VirtualKind, weight: u32, children: Vec<ShardTemplate>) -> Result<Self> {
        Self::new(kind.class_name(), "", weight, "", "", children)
    }

    /// Wrap a single template in a virtual shard carrying the child's weight.
    pub fn wrapper_for(kind: VirtualKind, child: &ShardTemplate) -> Self {
        Self {
            shard_type: kind.class_name().to_string(),
            host: child.host.clone(),
            weight: child.weight,
            source_type: String::new(),
            dest_type: String::new(),
            children: vec![child.clone()],
        }
    }

    /// Parse the compact textual form.
    pub fn parse(text: &str, options: &TemplateOptions) -> Result<Self> {
        parse::parse(text, options)
    }

    /// Full class name.
    pub fn shard_type(&self) -> &str {
        &self.shard_type
    }

    /// Class name without package qualifier.
    pub fn short_type(&self) -> &str {
        short_type(&self.shard_type)
    }

    /// Effective host: own host when concrete, single child's host, or the abstract host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Weight of the link from this template's parent.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn dest_type(&self) -> &str {
        &self.dest_type
    }

    /// Children in canonical order.
    pub fn children(&self) -> &[ShardTemplate] {
        &self.children
    }

    /// Virtual kind, or `None` when concrete.
    pub fn virtual_kind(&self) -> Option<VirtualKind> {
        VirtualKind::from_class_name(&self.shard_type)
    }

    pub fn is_concrete(&self) -> bool {
        self.virtual_kind().is_none()
    }

    pub fn is_replicating(&self) -> bool {
        self.virtual_kind().map(VirtualKind::is_replicating).unwrap_or(false)
    }

    pub fn is_valid_copy_source(&self) -> bool {
        self.virtual_kind()
            .map(VirtualKind::is_valid_copy_source)
            .unwrap_or(true)
    }

    /// Table name suffix for virtual shards.
    pub fn table_suffix(&self) -> Option<&'static str> {
        self.virtual_kind().map(VirtualKind::table_suffix)
    }

    /// Self followed by every descendant, pre-order.
    pub fn descendants(&self) -> Vec<&ShardTemplate> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.descendants());
        }
        nodes
    }

    /// Concrete descendants, pre-order.
    pub fn concrete_descendants(&self) -> Vec<&ShardTemplate> {
        self.descendants()
            .into_iter()
            .filter(|t| t.is_concrete())
            .collect()
    }

    /// Concrete descendants reachable without crossing an invalid copy source.
    pub fn copy_sources(&self) -> Vec<&ShardTemplate> {
        if !self.is_valid_copy_source() {
            return Vec::new();
        }
        if self.is_concrete() {
            return vec![self];
        }
        self.children.iter().flat_map(|c| c.copy_sources()).collect()
    }

    /// Identity of this node alone.
    pub fn shard_key(&self) -> ShardKey {
        ShardKey {
            shard_type: self.shard_type.clone(),
            host: self.host.clone(),
            source_type: self.source_type.clone(),
            dest_type: self.dest_type.clone(),
        }
    }

    /// Same physical shard: type, host, source and dest match.
    pub fn shard_eq(&self, other: &ShardTemplate) -> bool {
        self.shard_type == other.shard_type
            && self.host == other.host
            && self.source_type == other.source_type
            && self.dest_type == other.dest_type
    }

    /// Same shard reached through a link of the same weight.
    pub fn link_eq(&self, other: &ShardTemplate) -> bool {
        self.shard_eq(other) && self.weight == other.weight
    }

    /// Check whether both trees hold a copy of the same physical shard.
    pub fn shared_host(&self, other: &ShardTemplate) -> bool {
        let theirs = other.concrete_descendants();
        self.concrete_descendants()
            .iter()
            .any(|mine| theirs.iter().any(|t| mine.shard_eq(t)))
    }

    /// Short human identifier, `type/host`.
    pub fn short_id(&self) -> String {
        format!("{}/{}", self.short_type(), self.host)
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$')
}

fn canonical_child_order(a: &ShardTemplate, b: &ShardTemplate) -> Ordering {
    b.weight.cmp(&a.weight).then_with(|| a.cmp(b))
}

impl Ord for ShardTemplate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host
            .cmp(&other.host)
            .then_with(|| self.shard_type.cmp(&other.shard_type))
            .then_with(|| self.source_type.cmp(&other.source_type))
            .then_with(|| self.dest_type.cmp(&other.dest_type))
            .then_with(|| self.weight.cmp(&other.weight))
            .then_with(|| self.children.cmp(&other.children))
    }
}

impl PartialOrd for ShardTemplate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShardTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&parse::format(self))
    }
}
