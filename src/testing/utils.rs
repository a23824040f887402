//! Fixtures shared by unit and end-to-end tests.

use crate::config::{SchedulerConfig, TemplateOptions, TransformOptions};
use crate::nameserver::{InMemoryNameserver, Manifest, Nameserver};
use crate::template::ShardTemplate;
use crate::transform::{BoundTransformation, Transformation};
use crate::types::{Forwarding, LinkInfo, ShardId, ShardInfo};
use std::time::Duration;

/// Base name used for every fixture table prefix.
pub(crate) const BASE_NAME: &str = "users";

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call from every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parse a template in the complex form.
pub(crate) fn t(text: &str) -> ShardTemplate {
    ShardTemplate::parse(text, &TemplateOptions::default()).unwrap()
}

/// Scheduler settings that poll every millisecond.
pub(crate) fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default().with_poll_interval(Duration::from_millis(1))
}

/// Seed `count` forwardings of table 0, each pointing at one `SqlShard` on `host`.
///
/// Enumerations (and base ids) start at `start`.
pub(crate) fn seed_single_shards(
    ns: &InMemoryNameserver,
    host: &str,
    start: usize,
    count: usize,
) -> Vec<Forwarding> {
    let mut infos = Vec::with_capacity(count);
    let mut forwardings = Vec::with_capacity(count);
    for i in start..start + count {
        let id = ShardId::new(host, format!("{}_0_{:04}", BASE_NAME, i));
        infos.push(ShardInfo::new(id.clone(), "SqlShard", "", ""));
        forwardings.push(Forwarding::new(0, (i as i64) << 40, id));
    }
    ns.seed(&infos, &[], &forwardings);
    forwardings
}

/// Seed one forwarding of table 0 pointing at a `ReplicatingShard` over one `SqlShard` per host.
pub(crate) fn seed_replicated(ns: &InMemoryNameserver, hosts: &[&str], enumeration: usize) -> Forwarding {
    let prefix = format!("{}_0_{:04}", BASE_NAME, enumeration);
    let root = ShardInfo::new(
        ShardId::new("localhost", format!("{}_replicating", prefix)),
        "ReplicatingShard",
        "",
        "",
    );
    let mut infos = vec![root.clone()];
    let mut links = Vec::new();
    for host in hosts {
        let child = ShardInfo::new(ShardId::new(*host, prefix.clone()), "SqlShard", "", "");
        links.push(LinkInfo::new(root.id.clone(), child.id.clone(), 1));
        infos.push(child);
    }
    let forwarding = Forwarding::new(0, (enumeration as i64) << 40, root.id);
    ns.seed(&infos, &links, &[forwarding.clone()]);
    forwarding
}

/// Bind `from -> to` to every forwarding of table 0 currently shaped like `from`.
pub(crate) async fn bind_all(
    ns: &dyn Nameserver,
    from: &ShardTemplate,
    to: &ShardTemplate,
    options: TransformOptions,
) -> Vec<BoundTransformation> {
    let manifest = Manifest::load(ns, &[0]).await.unwrap();
    let transformation = Transformation::new(Some(from.clone()), Some(to.clone()), options).unwrap();
    manifest
        .templates
        .get(from)
        .into_iter()
        .flatten()
        .map(|forwarding| {
            transformation
                .bind(forwarding, manifest.trees.get(forwarding), Some(BASE_NAME))
                .unwrap()
        })
        .collect()
}
