//! Baseline statistics and metric samples.
//!
//! A baseline is the per-(skill, metric) statistical reference the anomaly
//! detector compares fresh samples against. Baselines with too few samples
//! must never be used to decide anomalies; that gate lives in the detector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::skill::SkillId;

/// One observed value for one metric of one skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub skill: SkillId,
    pub metric: String,
    pub value: f64,
}

impl MetricSample {
    pub fn new(skill: SkillId, metric: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            skill,
            metric: metric.into(),
            value,
        }
    }
}

/// Statistical reference for one (skill, metric) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
    pub percentile_50: f64,
    pub percentile_95: f64,
    pub percentile_99: f64,
    pub sample_count: usize,
    pub last_updated: DateTime<Utc>,
}

impl Baseline {
    /// Compute a baseline from raw sample values.
    ///
    /// Returns `None` for an empty slice. `std_dev` is the population
    /// standard deviation and is always non-negative. Percentiles use the
    /// nearest-rank method on the sorted values.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Some(Self {
            mean,
            std_dev,
            percentile_50: nearest_rank(&sorted, 50.0),
            percentile_95: nearest_rank(&sorted, 95.0),
            percentile_99: nearest_rank(&sorted, 99.0),
            sample_count: values.len(),
            last_updated: Utc::now(),
        })
    }

    /// Fold a fresh value into this baseline as an exponential moving
    /// average with smoothing factor `alpha`.
    ///
    /// Only mean and deviation move; the percentiles stay frozen from the
    /// last full recompute. Callers that detect against a stable reference
    /// must keep the EMA copy separate from the snapshot baseline.
    pub fn ema_update(&mut self, value: f64, alpha: f64) {
        let deviation = (value - self.mean).abs();
        self.mean = alpha * value + (1.0 - alpha) * self.mean;
        self.std_dev = (alpha * deviation + (1.0 - alpha) * self.std_dev).max(0.0);
        self.sample_count += 1;
        self.last_updated = Utc::now();
    }
}

/// Nearest-rank percentile on a pre-sorted slice.
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}
