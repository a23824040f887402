//! Configuration types for planning and executing topology changes.

use crate::error::{Error, Result};
use crate::template::VirtualKind;
use crate::types::{BaseId, TableId};
use std::collections::BTreeSet;
use std::time::Duration;

/// Width of the forwarding key space, in bits.
pub const FORWARDING_SPACE_BITS: u32 = 60;

/// Options used when parsing textual templates.
#[derive(Debug, Clone)]
pub struct TemplateOptions {
    /// In simple mode a bare word that is not a virtual type is a host name.
    pub simple: bool,

    /// Concrete type given to bare hosts in simple mode.
    pub default_concrete_type: String,

    /// Source type given to bare hosts in simple mode.
    pub source_type: String,

    /// Destination type given to bare hosts in simple mode.
    pub dest_type: String,

    /// Accepted concrete types. Empty means any identifier is accepted.
    pub known_concrete_types: BTreeSet<String>,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            simple: false,
            default_concrete_type: "SqlShard".to_string(),
            source_type: String::new(),
            dest_type: String::new(),
            known_concrete_types: BTreeSet::new(),
        }
    }
}

impl TemplateOptions {
    /// Enable or disable simple mode.
    pub fn with_simple(mut self, simple: bool) -> Self {
        self.simple = simple;
        self
    }

    /// Set the concrete type used for bare hosts.
    pub fn with_default_concrete_type(mut self, shard_type: impl Into<String>) -> Self {
        self.default_concrete_type = shard_type.into();
        self
    }

    /// Set source and destination types used for bare hosts.
    pub fn with_types(mut self, source: impl Into<String>, dest: impl Into<String>) -> Self {
        self.source_type = source.into();
        self.dest_type = dest.into();
        self
    }

    /// Add a concrete type to the whitelist.
    pub fn with_known_concrete_type(mut self, shard_type: impl Into<String>) -> Self {
        self.known_concrete_types.insert(shard_type.into());
        self
    }
}

/// How a transformation shields and verifies copy destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    /// Wrapper placed over each copy destination until its data is in place.
    pub copy_wrapper: VirtualKind,

    /// Treat every destination as already populated.
    pub skip_copies: bool,

    /// Defer exposing destinations until every job has copied.
    pub batch_finish: bool,

    /// Repair destinations against each other after copying.
    pub repair: bool,

    /// Diff destinations against each other after copying.
    pub diff: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            copy_wrapper: VirtualKind::Blocked,
            skip_copies: false,
            batch_finish: false,
            repair: false,
            diff: false,
        }
    }
}

impl TransformOptions {
    /// Set the copy destination wrapper.
    pub fn with_copy_wrapper(mut self, kind: VirtualKind) -> Self {
        self.copy_wrapper = kind;
        self
    }

    /// Skip data copies.
    pub fn with_skip_copies(mut self, skip: bool) -> Self {
        self.skip_copies = skip;
        self
    }

    /// Enable or disable batch finish.
    pub fn with_batch_finish(mut self, batch_finish: bool) -> Self {
        self.batch_finish = batch_finish;
        self
    }

    /// Enable post-copy repair.
    pub fn with_repair(mut self, repair: bool) -> Self {
        self.repair = repair;
        self
    }

    /// Enable post-copy diff.
    pub fn with_diff(mut self, diff: bool) -> Self {
        self.diff = diff;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.copy_wrapper.is_replicating() {
            return Err(Error::InvalidWrapper(self.copy_wrapper.to_string()));
        }
        Ok(())
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently busy shards.
    pub max_copies: usize,

    /// Maximum number of copying jobs touching a single host.
    pub copies_per_host: usize,

    /// Sleep between poll iterations.
    pub poll_interval: Duration,

    /// Expose all destinations together once every copy has finished.
    pub batch_finish: bool,

    /// Skip mutations and polling.
    pub dry_run: bool,

    /// Answer every confirmation with yes.
    pub force: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_copies: 30,
            copies_per_host: 8,
            poll_interval: Duration::from_secs(10),
            batch_finish: false,
            dry_run: false,
            force: false,
        }
    }
}

impl SchedulerConfig {
    /// Set the global copy limit.
    pub fn with_max_copies(mut self, max_copies: usize) -> Self {
        self.max_copies = max_copies;
        self
    }

    /// Set the per-host copy limit.
    pub fn with_copies_per_host(mut self, copies_per_host: usize) -> Self {
        self.copies_per_host = copies_per_host;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable batch finish.
    pub fn with_batch_finish(mut self, batch_finish: bool) -> Self {
        self.batch_finish = batch_finish;
        self
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Skip confirmations.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_copies == 0 {
            return Err(Error::Config("max_copies must be at least 1".to_string()));
        }
        if self.copies_per_host == 0 {
            return Err(Error::Config(
                "copies_per_host must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Migrator configuration.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Base name used for canonical table prefixes.
    pub base_name: String,

    /// Table the migrated forwardings belong to.
    pub table_id: TableId,

    /// Size of the forwarding key space.
    pub forwarding_space: BaseId,

    /// Lowest base id of the forwarding key space.
    pub forwarding_space_min: BaseId,

    /// Shard count used when no forwardings exist yet.
    pub default_total_shards: Option<usize>,

    /// Transformation options applied to every emitted transformation.
    pub transform: TransformOptions,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            base_name: "shard".to_string(),
            table_id: 0,
            forwarding_space: 1 << FORWARDING_SPACE_BITS,
            forwarding_space_min: 0,
            default_total_shards: None,
            transform: TransformOptions::default(),
        }
    }
}

impl MigratorConfig {
    /// Create a configuration for the given base name and table.
    pub fn new(base_name: impl Into<String>, table_id: TableId) -> Self {
        Self {
            base_name: base_name.into(),
            table_id,
            ..Default::default()
        }
    }

    /// Set the forwarding key space bounds.
    pub fn with_forwarding_space(mut self, min: BaseId, space: BaseId) -> Self {
        self.forwarding_space_min = min;
        self.forwarding_space = space;
        self
    }

    /// Set the shard count used for an empty table.
    pub fn with_default_total_shards(mut self, total: usize) -> Self {
        self.default_total_shards = Some(total);
        self
    }

    /// Set transformation options.
    pub fn with_transform(mut self, transform: TransformOptions) -> Self {
        self.transform = transform;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.base_name.is_empty() {
            return Err(Error::Config("base_name must not be empty".to_string()));
        }
        if self.forwarding_space <= 0 {
            return Err(Error::Config("forwarding_space must be positive".to_string()));
        }
        if self.default_total_shards == Some(0) {
            return Err(Error::Config(
                "default_total_shards must be at least 1".to_string(),
            ));
        }
        self.transform.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_copies, 30);
        assert_eq!(config.copies_per_host, 8);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());

        let migrator = MigratorConfig::default();
        assert_eq!(migrator.forwarding_space, 1i64 << 60);
        assert_eq!(migrator.transform.copy_wrapper, VirtualKind::Blocked);
        assert!(migrator.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = SchedulerConfig::default()
            .with_max_copies(4)
            .with_copies_per_host(1)
            .with_poll_interval(Duration::from_millis(5))
            .with_dry_run(true);
        assert_eq!(config.max_copies, 4);
        assert_eq!(config.copies_per_host, 1);
        assert!(config.dry_run);

        let migrator = MigratorConfig::new("users", -2)
            .with_default_total_shards(16)
            .with_transform(TransformOptions::default().with_batch_finish(true));
        assert_eq!(migrator.table_id, -2);
        assert_eq!(migrator.default_total_shards, Some(16));
        assert!(migrator.transform.batch_finish);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            SchedulerConfig::default().with_max_copies(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            MigratorConfig::default().with_default_total_shards(0).validate(),
            Err(Error::Config(_))
        ));
        let replicating = TransformOptions::default().with_copy_wrapper(VirtualKind::Replicating);
        assert!(matches!(replicating.validate(), Err(Error::InvalidWrapper(_))));
    }
}
