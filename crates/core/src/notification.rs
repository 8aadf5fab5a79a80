//! Notification domain types.
//!
//! A notification is the structured anomaly record flowing from operators
//! and watchers to the coordinator. Notifications are immutable once
//! created; only the coordinator-side entry status changes, and only
//! monotonically toward resolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::skill::{MetricSnapshot, SkillId};

/// How severe a detected anomaly is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Generate a 16-hex-char notification id.
pub fn generate_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Structured findings from a watcher's bounded post-anomaly investigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherFindings {
    /// What the investigation concluded
    pub summary: String,

    /// Supporting observations gathered during the investigation
    pub evidence: Vec<String>,

    /// How many tool-loop iterations the investigation used
    pub iterations: u32,
}

/// An anomaly record produced by an operator or watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Unique id (16 hex chars)
    pub id: String,

    /// The skill whose operator produced this
    pub operator: SkillId,

    /// Machine-readable anomaly tag (e.g., "memory_high")
    pub anomaly_type: String,

    pub severity: Severity,

    /// Factual state at detection time
    pub context: String,

    /// The detected anomaly itself
    pub observation: String,

    /// Speculative cause, if the producer offered one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,

    /// Metric snapshots collected during the producing run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<MetricSnapshot>,

    /// Watcher investigation payload, when one ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<WatcherFindings>,

    pub detected_at: DateTime<Utc>,

    /// Origin node identifier
    pub node: String,
}

impl Notification {
    pub fn new(
        operator: SkillId,
        anomaly_type: impl Into<String>,
        severity: Severity,
        context: impl Into<String>,
        observation: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            operator,
            anomaly_type: anomaly_type.into(),
            severity,
            context: context.into(),
            observation: observation.into(),
            hypothesis: None,
            snapshots: Vec::new(),
            findings: None,
            detected_at: Utc::now(),
            node: node.into(),
        }
    }

    pub fn with_hypothesis(mut self, hypothesis: impl Into<String>) -> Self {
        self.hypothesis = Some(hypothesis.into());
        self
    }

    pub fn with_snapshots(mut self, snapshots: Vec<MetricSnapshot>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_findings(mut self, findings: WatcherFindings) -> Self {
        self.findings = Some(findings);
        self
    }

    /// The anomaly category: the prefix of `anomaly_type` before the first
    /// underscore (`memory_high` -> `memory`). Used for cooldown grouping.
    pub fn category(&self) -> &str {
        self.anomaly_type
            .split('_')
            .next()
            .unwrap_or(&self.anomaly_type)
    }
}

/// Coordinator-side processing status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Unread,
    Acknowledged,
    Resolved,
}

impl NotificationStatus {
    fn rank(self) -> u8 {
        match self {
            NotificationStatus::Unread => 0,
            NotificationStatus::Acknowledged => 1,
            NotificationStatus::Resolved => 2,
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationStatus::Unread => "unread",
            NotificationStatus::Acknowledged => "acknowledged",
            NotificationStatus::Resolved => "resolved",
        };
        write!(f, "{s}")
    }
}

/// A notification as tracked in the coordinator's inbox.
///
/// The status is the only mutable field and moves monotonically toward
/// resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub notification: Notification,
    pub status: NotificationStatus,
}

impl NotificationEntry {
    /// Wrap a freshly ingested notification; status defaults to unread.
    pub fn new(notification: Notification) -> Self {
        Self {
            notification,
            status: NotificationStatus::Unread,
        }
    }

    /// Advance the status. Returns false (and leaves the entry untouched)
    /// if the transition would move backwards.
    pub fn advance_to(&mut self, status: NotificationStatus) -> bool {
        if status.rank() < self.status.rank() {
            return false;
        }
        self.status = status;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Notification {
        Notification::new(
            SkillId::new("beam"),
            "memory_high",
            Severity::Warning,
            "uptime 1h",
            "rss=820MB",
            "node-a",
        )
    }

    #[test]
    fn id_is_16_hex_chars() {
        let n = sample();
        assert_eq!(n.id.len(), 16);
        assert!(n.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn category_is_prefix_before_underscore() {
        assert_eq!(sample().category(), "memory");

        let n = Notification::new(
            SkillId::new("beam"),
            "gc",
            Severity::Info,
            "",
            "",
            "node-a",
        );
        assert_eq!(n.category(), "gc");
    }

    #[test]
    fn status_advances_monotonically() {
        let mut entry = NotificationEntry::new(sample());
        assert_eq!(entry.status, NotificationStatus::Unread);

        assert!(entry.advance_to(NotificationStatus::Acknowledged));
        assert!(entry.advance_to(NotificationStatus::Resolved));

        // Moving backwards is refused
        assert!(!entry.advance_to(NotificationStatus::Unread));
        assert_eq!(entry.status, NotificationStatus::Resolved);
    }

    #[test]
    fn same_status_transition_is_allowed() {
        let mut entry = NotificationEntry::new(sample());
        assert!(entry.advance_to(NotificationStatus::Unread));
        assert_eq!(entry.status, NotificationStatus::Unread);
    }

    #[test]
    fn serialization_skips_empty_optionals() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(!json.contains("hypothesis"));
        assert!(!json.contains("findings"));
        assert!(!json.contains("snapshots"));
    }
}
