//! Runtime metrics reported by exchange clients and sources.

use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregate of one named metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeMetric {
    pub sum: u64,
    pub count: u64,
    pub min: u64,
    pub max: u64,
}

impl RuntimeMetric {
    pub fn new(value: u64) -> Self {
        Self {
            sum: value,
            count: 1,
            min: value,
            max: value,
        }
    }

    pub fn add_value(&mut self, value: u64) {
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Fold another aggregate into this one.
    pub fn merge(&mut self, other: &RuntimeMetric) {
        self.sum += other.sum;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Metric name to aggregate, ordered by name for stable output.
pub type ExchangeStats = BTreeMap<String, RuntimeMetric>;

/// Merge `metrics` into `into`, adding to existing entries.
pub fn merge_stats(into: &mut ExchangeStats, metrics: &ExchangeStats) {
    for (name, metric) in metrics {
        into.entry(name.clone())
            .and_modify(|m| m.merge(metric))
            .or_insert(*metric);
    }
}
