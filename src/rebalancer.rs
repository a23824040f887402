//! Weighted placement of shard trees into destination templates.
//!
//! Each destination template is a [`Bucket`] with a target size proportional to
//! its weight. Placement runs in two passes:
//!
//! 1. **Home pass**: trees sharing a template move together to the bucket that
//!    needs the fewest fresh copies, preferring the most under-filled bucket.
//! 2. **Rebalance pass**: single trees move from the fullest bucket to the
//!    emptiest until every balance is within one of every other.

use crate::config::TransformOptions;
use crate::error::{Error, Result};
use crate::nameserver::Shard;
use crate::template::ShardTemplate;
use crate::transform::Transformation;
use crate::types::Forwarding;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Destination template and the trees assigned to it.
#[derive(Debug, Clone)]
pub struct Bucket {
    template: ShardTemplate,
    approx_target: f64,
    shards: BTreeMap<Forwarding, Shard>,
}

impl Bucket {
    fn new(template: ShardTemplate, approx_target: f64) -> Self {
        Self {
            template,
            approx_target,
            shards: BTreeMap::new(),
        }
    }

    pub fn template(&self) -> &ShardTemplate {
        &self.template
    }

    /// Target size, `total * weight / sum(weights)`.
    pub fn approx_target(&self) -> f64 {
        self.approx_target
    }

    pub fn shards(&self) -> &BTreeMap<Forwarding, Shard> {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Assigned trees minus target; negative when under-filled.
    pub fn balance(&self) -> f64 {
        self.shards.len() as f64 - self.approx_target
    }

    /// Concrete shards of this bucket's template missing from `template`.
    fn copy_cost(&self, template: &ShardTemplate) -> usize {
        let have = template.concrete_descendants();
        self.template
            .concrete_descendants()
            .into_iter()
            .filter(|want| !have.iter().any(|h| h.shard_eq(want)))
            .count()
    }
}

/// Places existing trees into weighted destination templates.
#[derive(Debug)]
pub struct Rebalancer {
    shards: BTreeMap<Forwarding, Shard>,
    templates: BTreeMap<Forwarding, ShardTemplate>,
    buckets: Vec<Bucket>,
    options: TransformOptions,
}

impl Rebalancer {
    /// Create a rebalancer for `shards` over `destinations`, given in configuration order.
    pub fn new(
        shards: BTreeMap<Forwarding, Shard>,
        destinations: &[(ShardTemplate, u32)],
        options: TransformOptions,
    ) -> Result<Self> {
        options.validate()?;
        if destinations.is_empty() {
            return Err(Error::Config("no destination templates".to_string()));
        }
        let total_weight: u64 = destinations.iter().map(|(_, w)| u64::from(*w)).sum();
        if total_weight == 0 {
            return Err(Error::Config(
                "destination weights sum to zero".to_string(),
            ));
        }
        for (i, (template, _)) in destinations.iter().enumerate() {
            if destinations[..i].iter().any(|(t, _)| t == template) {
                return Err(Error::Config(format!(
                    "duplicate destination template {}",
                    template
                )));
            }
        }

        let templates = shards
            .iter()
            .map(|(f, shard)| Ok((f.clone(), shard.template()?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let total = shards.len() as f64;
        let buckets = destinations
            .iter()
            .map(|(template, weight)| {
                Bucket::new(
                    template.clone(),
                    total * f64::from(*weight) / total_weight as f64,
                )
            })
            .collect();

        Ok(Self {
            shards,
            templates,
            buckets,
            options,
        })
    }

    /// Buckets in configuration order.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Run both placement passes, replacing any earlier placement.
    pub fn rebalance(&mut self) {
        for bucket in &mut self.buckets {
            bucket.shards.clear();
        }
        self.home();
        let moves = self.spread();

        tracing::info!(
            shards = self.shards.len(),
            buckets = self.buckets.len(),
            moves,
            "Rebalanced shard placement"
        );
    }

    fn home(&mut self) {
        let mut groups: BTreeMap<&ShardTemplate, Vec<&Forwarding>> = BTreeMap::new();
        for (forwarding, template) in &self.templates {
            groups.entry(template).or_default().push(forwarding);
        }
        let mut groups: Vec<(&ShardTemplate, Vec<&Forwarding>)> = groups.into_iter().collect();
        groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        for (template, forwardings) in groups {
            let Some(target) = self
                .buckets
                .iter()
                .enumerate()
                .min_by(|(i, a), (j, b)| {
                    a.copy_cost(template)
                        .cmp(&b.copy_cost(template))
                        .then_with(|| a.balance().total_cmp(&b.balance()))
                        .then_with(|| i.cmp(j))
                })
                .map(|(i, _)| i)
            else {
                return;
            };

            tracing::debug!(
                from = %template,
                to = %self.buckets[target].template,
                count = forwardings.len(),
                "Homed shard group"
            );
            for forwarding in forwardings {
                if let Some(shard) = self.shards.get(forwarding) {
                    self.buckets[target]
                        .shards
                        .insert(forwarding.clone(), shard.clone());
                }
            }
        }
    }

    /// Move trees from the fullest bucket to the emptiest until balanced.
    fn spread(&mut self) -> usize {
        let mut moves = 0;
        loop {
            let (Some(over), Some(under)) = (self.extreme(Ordering::Greater), self.extreme(Ordering::Less)) else {
                return moves;
            };
            if self.buckets[over].balance() - self.buckets[under].balance() <= 1.0 {
                return moves;
            }
            let Some((forwarding, shard)) = self.buckets[over].shards.pop_last() else {
                return moves;
            };
            self.buckets[under].shards.insert(forwarding, shard);
            moves += 1;
        }
    }

    /// Index of the bucket with the highest (or lowest) balance; earlier buckets win ties.
    fn extreme(&self, want: Ordering) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, bucket) in self.buckets.iter().enumerate() {
            let better = match best {
                None => true,
                Some(b) => bucket.balance().total_cmp(&self.buckets[b].balance()) == want,
            };
            if better {
                best = Some(i);
            }
        }
        best
    }

    /// One transformation per (current template, bucket template) pair, with its trees.
    pub fn transformations(&self) -> Result<BTreeMap<Transformation, BTreeMap<Forwarding, Shard>>> {
        let mut pairs: BTreeMap<(&ShardTemplate, &ShardTemplate), BTreeMap<Forwarding, Shard>> =
            BTreeMap::new();
        for bucket in &self.buckets {
            for (forwarding, shard) in &bucket.shards {
                let Some(from) = self.templates.get(forwarding) else {
                    continue;
                };
                if from == &bucket.template {
                    continue;
                }
                pairs
                    .entry((from, &bucket.template))
                    .or_default()
                    .insert(forwarding.clone(), shard.clone());
            }
        }

        let mut result = BTreeMap::new();
        for ((from, to), shards) in pairs {
            let transformation =
                Transformation::new(Some(from.clone()), Some(to.clone()), self.options)?;
            if !transformation.is_noop() {
                result.insert(transformation, shards);
            }
        }
        Ok(result)
    }
}
