//! Skill trait — the abstraction over monitored domains.
//!
//! A skill describes one observable domain of the host application: how to
//! sample its metrics, which read-only callbacks an operator may invoke
//! against it, and the system prompt that frames an investigation.
//!
//! The core treats skills as opaque. It only requires that callbacks are
//! idempotent and read-only, that snapshots are cheap (no I/O), and that
//! the set of skills is fixed at supervisor start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::SkillError;

/// Unique identifier for a skill (monitored domain).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SkillId(pub String);

impl SkillId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SkillId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SkillId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One point-in-time sample of every metric a skill exposes.
///
/// Metrics are keyed in a `BTreeMap` so that (skill, metric) iteration order
/// is stable wherever tie-breaks depend on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Which skill produced this snapshot
    pub skill: SkillId,

    /// When it was taken
    pub taken_at: DateTime<Utc>,

    /// Metric name to numeric value
    pub metrics: BTreeMap<String, f64>,
}

impl MetricSnapshot {
    pub fn new(skill: SkillId, metrics: BTreeMap<String, f64>) -> Self {
        Self {
            skill,
            taken_at: Utc::now(),
            metrics,
        }
    }
}

/// Description of one named read-only callback a skill exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSpec {
    /// The callback name (e.g., "memory_breakdown")
    pub name: String,

    /// What the callback returns (sent to the LLM)
    pub description: String,

    /// JSON Schema describing the callback's arguments
    pub parameters: serde_json::Value,
}

/// The core Skill trait.
///
/// Each monitored domain (process metrics, table metrics, a custom
/// application subsystem) implements this trait and is registered in the
/// [`SkillRegistry`] at supervisor start. Operators are configured with
/// exactly one skill.
#[async_trait]
pub trait Skill: Send + Sync {
    /// The unique id of this skill.
    fn id(&self) -> SkillId;

    /// Human-readable title.
    fn title(&self) -> &str;

    /// One-line description of the domain.
    fn description(&self) -> &str;

    /// System prompt framing an LLM investigation of this domain.
    fn system_prompt(&self) -> &str;

    /// Sample every metric this skill exposes.
    ///
    /// Must be side-effect free and cheap: bounded work over in-process
    /// state, no I/O.
    fn snapshot(&self) -> MetricSnapshot;

    /// The ordered set of read-only callbacks this skill exposes.
    fn callback_specs(&self) -> Vec<CallbackSpec>;

    /// Rendered documentation for all callbacks, injected into the
    /// operator's system prompt.
    fn callback_docs(&self) -> String {
        let mut docs = String::new();
        for spec in self.callback_specs() {
            docs.push_str(&format!(
                "### {}\n{}\nParameters: {}\n\n",
                spec.name, spec.description, spec.parameters
            ));
        }
        docs
    }

    /// Execute one named callback.
    ///
    /// Callbacks must be idempotent, must not mutate observable state, and
    /// must return a JSON-serializable value of bounded size. The operator
    /// loop enforces the execution deadline.
    async fn run_callback(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, SkillError>;
}

/// A registry of available skills.
///
/// The set of skills is fixed at supervisor start; registration order is
/// preserved and used wherever a stable skill ordering is needed.
pub struct SkillRegistry {
    skills: Vec<Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self { skills: Vec::new() }
    }

    /// Register a skill. Replaces any existing skill with the same id.
    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        let id = skill.id();
        self.skills.retain(|s| s.id() != id);
        self.skills.push(skill);
    }

    /// Get a skill by id.
    pub fn get(&self, id: &SkillId) -> Option<Arc<dyn Skill>> {
        self.skills.iter().find(|s| &s.id() == id).cloned()
    }

    /// All registered skill ids, in registration order.
    pub fn ids(&self) -> Vec<SkillId> {
        self.skills.iter().map(|s| s.id()).collect()
    }

    /// Iterate skills in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Skill>> {
        self.skills.iter()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}
