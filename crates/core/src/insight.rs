//! Insight domain types.
//!
//! An insight is the coordinator's correlated explanation of one or more
//! notifications. Every cited notification id must have existed in the
//! coordinator's inbox when the insight was produced; the coordinator
//! enforces this at creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notification::generate_id;

/// How the correlated notifications relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationType {
    /// One anomaly drives the other
    Causal,
    /// Anomalies coincide in time without an established cause
    Temporal,
    /// Anomalies are symptoms of a common underlying condition
    Symptomatic,
}

/// How confident the coordinator is in the correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// A correlated explanation referencing one or more notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    /// Unique id (16 hex chars)
    pub id: String,

    /// Ids of the correlated notifications
    pub notification_ids: Vec<String>,

    pub correlation_type: CorrelationType,

    /// Human-readable explanation
    pub summary: String,

    /// Speculative root cause, if one is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause_hypothesis: Option<String>,

    /// Observations copied verbatim from the source notifications
    pub matched_observations: Vec<String>,

    /// Whether the hypothesis is supported by the matched observations
    pub hypothesis_grounded: bool,

    pub confidence: Confidence,

    pub created_at: DateTime<Utc>,
}

impl Insight {
    pub fn new(
        notification_ids: Vec<String>,
        correlation_type: CorrelationType,
        summary: impl Into<String>,
        matched_observations: Vec<String>,
        hypothesis_grounded: bool,
        confidence: Confidence,
    ) -> Self {
        Self {
            id: generate_id(),
            notification_ids,
            correlation_type,
            summary: summary.into(),
            root_cause_hypothesis: None,
            matched_observations,
            hypothesis_grounded,
            confidence,
            created_at: Utc::now(),
        }
    }

    pub fn with_root_cause(mut self, hypothesis: impl Into<String>) -> Self {
        self.root_cause_hypothesis = Some(hypothesis.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insight_carries_cited_ids() {
        let insight = Insight::new(
            vec!["a".into(), "b".into()],
            CorrelationType::Causal,
            "GC pressure driven by memory growth",
            vec!["rss=820MB".into(), "gc=45/s".into()],
            true,
            Confidence::High,
        );
        assert_eq!(insight.notification_ids.len(), 2);
        assert_eq!(insight.id.len(), 16);
        assert!(insight.hypothesis_grounded);
    }

    #[test]
    fn correlation_type_serializes_lowercase() {
        let json = serde_json::to_string(&CorrelationType::Symptomatic).unwrap();
        assert_eq!(json, "\"symptomatic\"");
        let back: CorrelationType = serde_json::from_str("\"temporal\"").unwrap();
        assert_eq!(back, CorrelationType::Temporal);
    }
}
