//! Shard topology planning and migration.
//!
//! This crate plans and executes changes to the physical layout of a sharded
//! storage cluster whose shard graph lives in a remote nameserver:
//! - **Templates** describe the desired shape of each shard tree
//! - **Transformations** compile the difference between two shapes into
//!   phase-ordered topology operations
//! - **Rebalancer** and **Migrator** decide which forwardings move where
//! - **Scheduler** runs the result under per-host and global copy limits
//!
//! # Example
//!
//! ```rust,no_run
//! use shardshift::config::{MigratorConfig, SchedulerConfig, TemplateOptions};
//! use shardshift::migrator::Migrator;
//! use shardshift::nameserver::{InMemoryNameserver, Manifest};
//! use shardshift::scheduler::TransformationScheduler;
//! use shardshift::template::ShardTemplate;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let nameserver = Arc::new(InMemoryNameserver::new());
//!
//!     // Read what is there now
//!     let manifest = Manifest::load(nameserver.as_ref(), &[0]).await?;
//!     manifest.validate_for_write()?;
//!
//!     // Plan the move onto the configured shapes
//!     let opts = TemplateOptions::default().with_simple(true);
//!     let configured = vec![
//!         ShardTemplate::parse("ReplicatingShard -> (db1, db2)", &opts)?,
//!         ShardTemplate::parse("ReplicatingShard -> (db3, db4)", &opts)?,
//!     ];
//!     let config = MigratorConfig::new("users", 0).with_default_total_shards(8);
//!     let migrator = Migrator::new(manifest.templates.clone(), configured, config)?;
//!
//!     // Execute it
//!     let jobs = migrator.bind(&manifest)?;
//!     let mut scheduler =
//!         TransformationScheduler::new(nameserver, jobs, SchedulerConfig::default())?;
//!     let report = scheduler.run().await?;
//!     println!("{} jobs finished", report.finished);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          Configured templates / weights              │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!          ┌───────────────┴───────────────┐
//!          ▼                               ▼
//!    ┌───────────┐                   ┌────────────┐
//!    │ Migrator  │                   │ Rebalancer │
//!    └───────────┘                   └────────────┘
//!          │       Transformation(from, to)  │
//!          └───────────────┬───────────────┘
//!                          ▼
//!              ┌───────────────────────┐
//!              │ BoundTransformation   │  ids resolved per forwarding
//!              └───────────────────────┘
//!                          │
//!                          ▼
//!              ┌───────────────────────┐      ┌──────────────┐
//!              │ TransformationScheduler│ ───▶ │  Nameserver  │
//!              └───────────────────────┘      └──────────────┘
//!                          │
//!                          ▼
//!                    RollbackLog
//! ```
//!
//! # Safety Model
//!
//! - Destinations are wrapped (blocked by default) until their copy finishes
//! - Old shards are removed only in cleanup, after every copy has landed
//! - The nameserver's busy flags are the only record of copy progress

pub mod config;
pub mod error;
pub mod metrics;
pub mod migrator;
pub mod nameserver;
pub mod rebalancer;
pub mod rollback;
pub mod scheduler;
pub mod template;
pub mod transform;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{MigratorConfig, SchedulerConfig, TemplateOptions, TransformOptions};
pub use error::{Error, NameserverError, Result};
pub use types::{BaseId, Forwarding, LinkInfo, ShardId, ShardInfo, TableId};

pub use migrator::{Classification, ConcreteSetMatcher, Migrator, TemplateMatcher};
pub use nameserver::{DryRunNameserver, InMemoryNameserver, Manifest, Nameserver, Shard};
pub use rebalancer::{Bucket, Rebalancer};
pub use rollback::{FileRollbackLog, MemoryRollbackLog, RollbackEntry, RollbackLog};
pub use scheduler::{
    AutoConfirm, ConsoleOperator, Interrupt, InterruptLevel, JobState, Operator,
    SchedulerReport, TransformationScheduler,
};
pub use template::{ShardKey, ShardTemplate, VirtualKind};
pub use transform::{BoundTransformation, Op, Phase, ResolvedOp, Transformation};

pub use metrics::{SchedulerMetrics, SchedulerMetricsSnapshot};
