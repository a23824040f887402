//! Plan a migration, preview it in dry-run mode, then execute it.
//!
//! This example shows how to:
//! - Seed an in-memory nameserver with a single-host table
//! - Plan a move onto replicated templates with the Migrator
//! - Print the calls a dry run would make
//! - Run the real migration and export scheduler metrics
//!
//! Run with:
//!   RUST_LOG=info cargo run --example dry_run

use shardshift::config::{MigratorConfig, SchedulerConfig, TemplateOptions};
use shardshift::migrator::Migrator;
use shardshift::nameserver::{InMemoryNameserver, Manifest};
use shardshift::scheduler::{AutoConfirm, TransformationScheduler};
use shardshift::template::ShardTemplate;
use shardshift::types::{Forwarding, ShardId, ShardInfo};
use std::sync::Arc;
use std::time::Duration;

const TABLE: i32 = 0;
const SHARDS: i64 = 8;

fn seed(nameserver: &InMemoryNameserver) {
    let mut infos = Vec::new();
    let mut forwardings = Vec::new();
    for i in 0..SHARDS {
        let id = ShardId::new("db1", format!("users_0_{:04}", i));
        infos.push(ShardInfo::new(id.clone(), "SqlShard", "", ""));
        forwardings.push(Forwarding::new(TABLE, i << 56, id));
    }
    nameserver.seed(&infos, &[], &forwardings);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("shardshift=info,warn"))
        .init();

    let nameserver = Arc::new(InMemoryNameserver::new().with_copy_ticks(2));
    seed(&nameserver);

    let options = TemplateOptions::default()
        .with_simple(true)
        .with_default_concrete_type("SqlShard");
    let configured = vec![
        ShardTemplate::parse("ReplicatingShard -> (db1, db2)", &options)?,
        ShardTemplate::parse("ReplicatingShard -> (db3, db4)", &options)?,
    ];

    let manifest = Manifest::load(nameserver.as_ref(), &[TABLE]).await?;
    manifest.validate_for_write()?;
    let migrator = Migrator::new(
        manifest.templates.clone(),
        configured,
        MigratorConfig::new("users", TABLE),
    )?;

    println!("--- Plan ---");
    for (transformation, forwardings) in migrator.transformations() {
        println!("{} ({} forwardings)", transformation, forwardings.len());
    }

    // Part 1: preview
    let config = SchedulerConfig::default()
        .with_max_copies(2)
        .with_poll_interval(Duration::from_millis(10));
    let mut preview = TransformationScheduler::new(
        nameserver.clone(),
        migrator.bind(&manifest)?,
        config.clone().with_dry_run(true),
    )?
    .with_operator(Arc::new(AutoConfirm::default()));
    preview.run().await?;

    println!("\n--- Dry run ---");
    for line in preview.planned() {
        println!("  {}", line);
    }

    // Part 2: execute
    let mut scheduler =
        TransformationScheduler::new(nameserver.clone(), migrator.bind(&manifest)?, config)?
            .with_operator(Arc::new(AutoConfirm::default()));
    let report = scheduler.run().await?;

    println!("\n--- Report ---");
    println!("  Finished: {}", report.finished);
    println!("  Polls:    {}", report.polls);
    println!("  Elapsed:  {:?}", report.elapsed);
    println!("  Copies:   {}", nameserver.copies().len());

    println!("\n--- Metrics ---");
    print!("{}", scheduler.metrics().to_prometheus());

    Ok(())
}
