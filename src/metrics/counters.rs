//! Monotonic counters.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by one label, such as the phase an op ran in.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    values: RwLock<BTreeMap<String, u64>>,
}

impl LabeledCounter {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Label key used in exposition output.
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn inc(&self, value: &str) {
        self.inc_by(value, 1);
    }

    pub fn inc_by(&self, value: &str, n: u64) {
        *self.values.write().entry(value.to_string()).or_insert(0) += n;
    }

    /// Count for one label value; 0 when never incremented.
    pub fn get(&self, value: &str) -> u64 {
        self.values.read().get(value).copied().unwrap_or(0)
    }

    /// Every label value with its count, sorted by label.
    pub fn get_all(&self) -> Vec<(String, u64)> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("copies_total", "Copies issued");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.name(), "copies_total");
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("ops_total", "Ops applied", "phase");
        counter.inc("prepare");
        counter.inc("prepare");
        counter.inc_by("cleanup", 3);

        assert_eq!(counter.get("prepare"), 2);
        assert_eq!(counter.get("copy"), 0);
        assert_eq!(
            counter.get_all(),
            vec![("cleanup".to_string(), 3), ("prepare".to_string(), 2)]
        );
    }
}
