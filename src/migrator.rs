//! Reconciliation of an observed topology against configured templates.
//!
//! The migrator decides which template every forwarding of a table should end
//! up on, then groups the forwardings whose template changes into
//! [`Transformation`]s. It never talks to the nameserver; pair it with a
//! [`Manifest`] to bind the plan and with the scheduler to run it.

use crate::config::MigratorConfig;
use crate::error::{Error, Result};
use crate::nameserver::Manifest;
use crate::template::{ShardKey, ShardTemplate};
use crate::transform::{canonical_table_prefix, BoundTransformation, Transformation};
use crate::types::{BaseId, Forwarding, ShardId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// Decides whether an observed template is a changed version of a configured one.
pub trait TemplateMatcher: Send + Sync + Debug {
    /// Check whether `observed` should be migrated onto `configured`.
    fn is_similar(&self, observed: &ShardTemplate, configured: &ShardTemplate) -> bool;
}

/// Matches templates serving the same set of concrete shards.
///
/// Weights and virtual wrappers may differ; the physical shards may not.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcreteSetMatcher;

impl TemplateMatcher for ConcreteSetMatcher {
    fn is_similar(&self, observed: &ShardTemplate, configured: &ShardTemplate) -> bool {
        concrete_keys(observed) == concrete_keys(configured)
    }
}

fn concrete_keys(template: &ShardTemplate) -> BTreeSet<ShardKey> {
    template
        .concrete_descendants()
        .into_iter()
        .map(ShardTemplate::shard_key)
        .collect()
}

/// Observed and configured templates sorted into four groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Present on both sides, structurally equal.
    pub unchanged: Vec<ShardTemplate>,
    /// `(observed, configured)` pairs accepted by the matcher.
    pub similar: Vec<(ShardTemplate, ShardTemplate)>,
    /// Configured templates nothing was matched to.
    pub new: Vec<ShardTemplate>,
    /// Observed templates nothing was matched to.
    pub unrecognized: Vec<ShardTemplate>,
}

impl Classification {
    /// Classify `observed` against `configured`.
    ///
    /// Similar pairs are chosen greedily: observed templates in order, each
    /// taking the first configured template still free.
    pub fn new<'a>(
        observed: impl IntoIterator<Item = &'a ShardTemplate>,
        configured: &[ShardTemplate],
        matcher: &dyn TemplateMatcher,
    ) -> Self {
        let mut result = Self::default();
        let mut taken = vec![false; configured.len()];
        let mut rest = Vec::new();

        for template in observed {
            match configured.iter().position(|c| c == template) {
                Some(i) => {
                    taken[i] = true;
                    result.unchanged.push(template.clone());
                }
                None => rest.push(template),
            }
        }

        for template in rest {
            let pick = configured
                .iter()
                .enumerate()
                .position(|(i, c)| !taken[i] && matcher.is_similar(template, c));
            match pick {
                Some(i) => {
                    taken[i] = true;
                    result.similar.push((template.clone(), configured[i].clone()));
                }
                None => result.unrecognized.push(template.clone()),
            }
        }

        result.new = configured
            .iter()
            .zip(&taken)
            .filter(|(_, taken)| !**taken)
            .map(|(c, _)| c.clone())
            .collect();
        result
    }
}

/// Plans the migration of one table onto a list of configured templates.
#[derive(Debug)]
pub struct Migrator {
    config: MigratorConfig,
    configured: Vec<ShardTemplate>,
    classification: Classification,
    original: BTreeMap<Forwarding, Option<ShardTemplate>>,
    assignments: Vec<BTreeSet<Forwarding>>,
    plan: BTreeMap<Transformation, Vec<Forwarding>>,
}

impl Migrator {
    /// Plan with the default [`ConcreteSetMatcher`].
    pub fn new(
        observed: BTreeMap<ShardTemplate, Vec<Forwarding>>,
        configured: Vec<ShardTemplate>,
        config: MigratorConfig,
    ) -> Result<Self> {
        Self::with_matcher(observed, configured, config, &ConcreteSetMatcher)
    }

    /// Plan from a manifest, keeping only forwardings of the configured table.
    pub fn from_manifest(
        manifest: &Manifest,
        configured: Vec<ShardTemplate>,
        config: MigratorConfig,
        matcher: &dyn TemplateMatcher,
    ) -> Result<Self> {
        let observed = manifest
            .templates
            .iter()
            .filter_map(|(template, forwardings)| {
                let forwardings: Vec<Forwarding> = forwardings
                    .iter()
                    .filter(|f| f.table_id == config.table_id)
                    .cloned()
                    .collect();
                (!forwardings.is_empty()).then(|| (template.clone(), forwardings))
            })
            .collect();
        Self::with_matcher(observed, configured, config, matcher)
    }

    /// Plan with an explicit matcher.
    pub fn with_matcher(
        observed: BTreeMap<ShardTemplate, Vec<Forwarding>>,
        configured: Vec<ShardTemplate>,
        config: MigratorConfig,
        matcher: &dyn TemplateMatcher,
    ) -> Result<Self> {
        config.validate()?;
        if configured.is_empty() {
            return Err(Error::Config("no configured templates".to_string()));
        }
        for (i, template) in configured.iter().enumerate() {
            if configured[..i].contains(template) {
                return Err(Error::Config(format!(
                    "template configured twice: {}",
                    template
                )));
            }
        }

        let observed_count: usize = observed.values().map(Vec::len).sum();
        if observed_count == 0 && config.default_total_shards.is_none() {
            return Err(Error::Config(
                "table has no shards and no default shard count is configured".to_string(),
            ));
        }

        let classification = Classification::new(observed.keys(), &configured, matcher);
        let index_of = |template: &ShardTemplate| configured.iter().position(|c| c == template);

        let mut original: BTreeMap<Forwarding, Option<ShardTemplate>> = BTreeMap::new();
        let mut assignments: Vec<BTreeSet<Forwarding>> = vec![BTreeSet::new(); configured.len()];

        if observed_count == 0 {
            for forwarding in synthesize_forwardings(&config, &configured[0]) {
                original.insert(forwarding.clone(), None);
                assignments[0].insert(forwarding);
            }
        } else {
            for (template, forwardings) in &observed {
                for forwarding in forwardings {
                    original.insert(forwarding.clone(), Some(template.clone()));
                }
            }

            let carried = classification
                .unchanged
                .iter()
                .map(|t| (t, t))
                .chain(classification.similar.iter().map(|(o, c)| (o, c)));
            for (from, to) in carried {
                if let (Some(forwardings), Some(i)) = (observed.get(from), index_of(to)) {
                    assignments[i].extend(forwardings.iter().cloned());
                }
            }

            let mut fresh = classification.new.iter();
            for template in &classification.unrecognized {
                let target = fresh.next().and_then(|t| index_of(t)).unwrap_or(0);
                if let Some(forwardings) = observed.get(template) {
                    assignments[target].extend(forwardings.iter().cloned());
                }
            }
        }

        let moves = equalize(&mut assignments);

        let mut grouped: BTreeMap<(Option<&ShardTemplate>, &ShardTemplate), Vec<Forwarding>> =
            BTreeMap::new();
        for (to, forwardings) in configured.iter().zip(&assignments) {
            for forwarding in forwardings {
                let from = original.get(forwarding).and_then(Option::as_ref);
                if from == Some(to) {
                    continue;
                }
                grouped
                    .entry((from, to))
                    .or_default()
                    .push(forwarding.clone());
            }
        }

        let mut plan = BTreeMap::new();
        for ((from, to), forwardings) in grouped {
            let transformation =
                Transformation::new(from.cloned(), Some(to.clone()), config.transform)?;
            plan.insert(transformation, forwardings);
        }

        tracing::info!(
            table_id = config.table_id,
            forwardings = original.len(),
            unchanged = classification.unchanged.len(),
            similar = classification.similar.len(),
            new = classification.new.len(),
            unrecognized = classification.unrecognized.len(),
            moves,
            transformations = plan.len(),
            "Planned migration"
        );

        Ok(Self {
            config,
            configured,
            classification,
            original,
            assignments,
            plan,
        })
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    /// Final forwardings of each configured template, in configuration order.
    pub fn assignments(&self) -> impl Iterator<Item = (&ShardTemplate, &BTreeSet<Forwarding>)> {
        self.configured.iter().zip(&self.assignments)
    }

    /// Template a forwarding was observed on; `None` for synthesized forwardings.
    pub fn original_template(&self, forwarding: &Forwarding) -> Option<&ShardTemplate> {
        self.original.get(forwarding).and_then(Option::as_ref)
    }

    /// Transformations to run and the forwardings each applies to.
    pub fn transformations(&self) -> &BTreeMap<Transformation, Vec<Forwarding>> {
        &self.plan
    }

    /// Check whether the table already matches the configuration.
    pub fn is_noop(&self) -> bool {
        self.plan.is_empty()
    }

    /// Bind every planned transformation against the trees of `manifest`.
    ///
    /// Synthesized forwardings have no tree and bind against nothing.
    pub fn bind(&self, manifest: &Manifest) -> Result<Vec<BoundTransformation>> {
        let mut bound = Vec::new();
        for (transformation, forwardings) in &self.plan {
            for forwarding in forwardings {
                let tree = manifest.trees.get(forwarding);
                bound.push(transformation.bind(
                    forwarding,
                    tree,
                    Some(self.config.base_name.as_str()),
                )?);
            }
        }
        Ok(bound)
    }
}

/// Evenly spaced forwardings for an empty table.
fn synthesize_forwardings(config: &MigratorConfig, first: &ShardTemplate) -> Vec<Forwarding> {
    let total = config.default_total_shards.unwrap_or(0);
    let step = config.forwarding_space / total.max(1) as BaseId;
    (0..total)
        .map(|i| {
            let base_id = config.forwarding_space_min + step * i as BaseId;
            let table_prefix =
                canonical_table_prefix(i as u32, config.table_id, &config.base_name);
            Forwarding::new(
                config.table_id,
                base_id,
                ShardId::new(first.host(), table_prefix),
            )
        })
        .collect()
}

/// Move forwardings from the largest to the smallest group until sizes differ by at most one.
fn equalize(assignments: &mut [BTreeSet<Forwarding>]) -> usize {
    let mut moves = 0;
    loop {
        let Some(largest) = extreme(assignments, |a, b| a > b) else {
            return moves;
        };
        let Some(smallest) = extreme(assignments, |a, b| a < b) else {
            return moves;
        };
        if assignments[largest].len() <= assignments[smallest].len() + 1 {
            return moves;
        }
        let Some(forwarding) = assignments[largest].pop_last() else {
            return moves;
        };
        assignments[smallest].insert(forwarding);
        moves += 1;
    }
}

fn extreme(assignments: &[BTreeSet<Forwarding>], better: impl Fn(usize, usize) -> bool) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, set) in assignments.iter().enumerate() {
        if best.map_or(true, |b| better(set.len(), assignments[b].len())) {
            best = Some(i);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateOptions;
    use crate::transform::Phase;
    use crate::types::{LinkInfo, ShardInfo};

    fn t(text: &str) -> ShardTemplate {
        ShardTemplate::parse(text, &TemplateOptions::default()).unwrap()
    }

    fn forwardings(range: std::ops::Range<i64>) -> Vec<Forwarding> {
        range
            .map(|i| {
                Forwarding::new(0, i, ShardId::new("db1", format!("users_0_{:04}", i)))
            })
            .collect()
    }

    fn config() -> MigratorConfig {
        MigratorConfig::new("users", 0)
    }

    #[test]
    fn test_classification() {
        let observed = vec![
            t("SqlShard(db1)"),
            t("ReplicatingShard -> (SqlShard(db2), SqlShard(db3))"),
            t("SqlShard(db9)"),
        ];
        let configured = vec![
            t("SqlShard(db1)"),
            t("ReplicatingShard -> (SqlShard(db2,3), SqlShard(db3))"),
            t("SqlShard(db4)"),
        ];

        let c = Classification::new(&observed, &configured, &ConcreteSetMatcher);
        assert_eq!(c.unchanged, vec![t("SqlShard(db1)")]);
        assert_eq!(c.similar, vec![(observed[1].clone(), configured[1].clone())]);
        assert_eq!(c.new, vec![t("SqlShard(db4)")]);
        assert_eq!(c.unrecognized, vec![t("SqlShard(db9)")]);
    }

    #[test]
    fn test_configuration_errors() {
        assert!(matches!(
            Migrator::new(BTreeMap::new(), vec![t("SqlShard(db1)")], config()),
            Err(Error::Config(_))
        ));
        let observed = BTreeMap::from([(t("SqlShard(db1)"), forwardings(0..2))]);
        assert!(matches!(
            Migrator::new(observed, vec![], config()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_unchanged_table_is_noop() {
        let observed = BTreeMap::from([(t("SqlShard(db1)"), forwardings(0..4))]);
        let migrator = Migrator::new(observed, vec![t("SqlShard(db1)")], config()).unwrap();
        assert!(migrator.is_noop());
    }

    #[test]
    fn test_synthesizes_empty_table() {
        let config = config()
            .with_forwarding_space(0, 1 << 60)
            .with_default_total_shards(4);
        let configured = vec![t("SqlShard(db1)"), t("SqlShard(db2)")];
        let migrator = Migrator::new(BTreeMap::new(), configured, config).unwrap();

        let sizes: Vec<usize> = migrator.assignments().map(|(_, f)| f.len()).collect();
        assert_eq!(sizes, vec![2, 2]);

        let all: Vec<&Forwarding> = migrator.assignments().flat_map(|(_, f)| f).collect();
        let mut bases: Vec<i64> = all.iter().map(|f| f.base_id).collect();
        bases.sort();
        assert_eq!(bases, vec![0, 1 << 58, 2 << 58, 3 << 58]);
        assert!(all.iter().all(|f| migrator.original_template(f).is_none()));

        for transformation in migrator.transformations().keys() {
            assert!(transformation.from().is_none());
            assert!(!transformation.copies_required());
        }
    }

    #[test]
    fn test_unrecognized_moves_to_new_template() {
        let observed = BTreeMap::from([(t("SqlShard(db1)"), forwardings(0..4))]);
        let migrator = Migrator::new(observed, vec![t("SqlShard(db2)")], config()).unwrap();

        assert_eq!(migrator.classification().unrecognized, vec![t("SqlShard(db1)")]);
        let plan = migrator.transformations();
        assert_eq!(plan.len(), 1);
        let (transformation, moved) = plan.iter().next().unwrap();
        assert_eq!(transformation.from(), Some(&t("SqlShard(db1)")));
        assert_eq!(transformation.to(), Some(&t("SqlShard(db2)")));
        assert_eq!(moved.len(), 4);
    }

    #[test]
    fn test_leftover_unrecognized_goes_to_first_template() {
        let observed = BTreeMap::from([
            (t("SqlShard(db8)"), forwardings(0..2)),
            (t("SqlShard(db9)"), forwardings(2..4)),
        ]);
        let migrator = Migrator::new(observed, vec![t("SqlShard(db1)")], config()).unwrap();

        let (_, assigned) = migrator.assignments().next().unwrap();
        assert_eq!(assigned.len(), 4);
        assert_eq!(migrator.transformations().len(), 2);
    }

    #[test]
    fn test_equalizes_counts() {
        let observed = BTreeMap::from([(t("SqlShard(db1)"), forwardings(0..7))]);
        let configured = vec![t("SqlShard(db1)"), t("SqlShard(db2)"), t("SqlShard(db3)")];
        let migrator = Migrator::new(observed, configured, config()).unwrap();

        let sizes: Vec<usize> = migrator.assignments().map(|(_, f)| f.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);

        // The lowest forwardings stay put.
        let (_, kept) = migrator.assignments().next().unwrap();
        let kept: Vec<i64> = kept.iter().map(|f| f.base_id).collect();
        assert_eq!(kept, vec![0, 1, 2]);
    }

    #[test]
    fn test_bind_against_manifest() {
        let infos: Vec<ShardInfo> = (0..2)
            .map(|i| {
                ShardInfo::new(ShardId::new("db1", format!("users_0_{:04}", i)), "SqlShard", "", "")
            })
            .collect();
        let links: Vec<LinkInfo> = Vec::new();
        let manifest = Manifest::from_parts(forwardings(0..2), links, infos).unwrap();

        let configured = vec![t("ReplicatingShard -> (SqlShard(db1), SqlShard(db2))")];
        let migrator = Migrator::from_manifest(
            &manifest,
            configured,
            config(),
            &ConcreteSetMatcher,
        )
        .unwrap();

        let bound = migrator.bind(&manifest).unwrap();
        assert_eq!(bound.len(), 2);
        for job in &bound {
            assert_eq!(job.copy_count(), 1);
            assert!(job.involved_hosts(Phase::Copy).contains("db2"));
            assert_eq!(
                job.table_prefix(),
                format!("users_0_{:04}", job.forwarding().base_id)
            );
        }
    }
}
