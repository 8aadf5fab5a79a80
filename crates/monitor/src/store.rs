//! Bounded per-(skill, metric) sample histories.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use beamlens_core::{MetricSample, SkillId};

/// Ring buffer of recent samples, keyed by (skill, metric).
///
/// Keys are held in a `BTreeMap` so iteration is stable in (skill, metric)
/// order, which tie-breaks simultaneous anomaly trips. Samples older than
/// the window are pruned on insert; pruning preserves ordering.
pub struct MetricStore {
    window: Duration,
    series: BTreeMap<(SkillId, String), VecDeque<MetricSample>>,
}

impl MetricStore {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            series: BTreeMap::new(),
        }
    }

    /// Append a sample and prune entries that have fallen out of the window.
    pub fn record(&mut self, sample: MetricSample) {
        let key = (sample.skill.clone(), sample.metric.clone());
        let cutoff = sample.timestamp - self.window;
        let series = self.series.entry(key).or_default();
        series.push_back(sample);
        while series.front().is_some_and(|s| s.timestamp < cutoff) {
            series.pop_front();
        }
    }

    /// All buffered values for one (skill, metric), oldest first.
    pub fn values(&self, skill: &SkillId, metric: &str) -> Vec<f64> {
        self.series
            .get(&(skill.clone(), metric.to_string()))
            .map(|s| s.iter().map(|sample| sample.value).collect())
            .unwrap_or_default()
    }

    /// Number of buffered samples for one (skill, metric).
    pub fn sample_count(&self, skill: &SkillId, metric: &str) -> usize {
        self.series
            .get(&(skill.clone(), metric.to_string()))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// All keys in stable (skill, metric) order.
    pub fn keys(&self) -> Vec<(SkillId, String)> {
        self.series.keys().cloned().collect()
    }

    /// Drop samples older than `now - window` across every series.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        for series in self.series.values_mut() {
            while series.front().is_some_and(|s| s.timestamp < cutoff) {
                series.pop_front();
            }
        }
        self.series.retain(|_, s| !s.is_empty());
    }
}
