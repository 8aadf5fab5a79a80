//! Baseline persistence — JSONL-backed per-(skill, metric) baselines.
//!
//! Baselines are advisory: a missing or unreadable file simply means a
//! fresh learning cycle. Storage is one JSON object per line so the file is
//! human-inspectable and a corrupted line loses only that entry.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use beamlens_core::{Baseline, Error, SkillId};

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBaseline {
    skill: SkillId,
    metric: String,
    baseline: Baseline,
}

/// In-memory baseline map with optional file persistence.
pub struct BaselineStore {
    baselines: BTreeMap<(SkillId, String), Baseline>,
    path: Option<PathBuf>,
}

impl BaselineStore {
    /// A store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            baselines: BTreeMap::new(),
            path: None,
        }
    }

    /// A store backed by a JSONL file. Existing entries are loaded; a
    /// missing file starts empty.
    pub fn with_persistence(path: PathBuf) -> Self {
        let baselines = Self::load_from_disk(&path);
        debug!(path = %path.display(), count = baselines.len(), "Baseline store loaded");
        Self {
            baselines,
            path: Some(path),
        }
    }

    fn load_from_disk(path: &PathBuf) -> BTreeMap<(SkillId, String), Baseline> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return BTreeMap::new(), // File doesn't exist yet
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<PersistedBaseline>(line) {
                Ok(entry) => Some(((entry.skill, entry.metric), entry.baseline)),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted baseline entry");
                    None
                }
            })
            .collect()
    }

    pub fn insert(&mut self, skill: SkillId, metric: impl Into<String>, baseline: Baseline) {
        self.baselines.insert((skill, metric.into()), baseline);
    }

    pub fn get(&self, skill: &SkillId, metric: &str) -> Option<&Baseline> {
        self.baselines.get(&(skill.clone(), metric.to_string()))
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Write all baselines to disk. A store without a path is a no-op.
    pub fn flush(&self) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Internal(format!("Failed to create baseline directory: {e}"))
            })?;
        }

        let mut content = String::new();
        for ((skill, metric), baseline) in &self.baselines {
            let entry = PersistedBaseline {
                skill: skill.clone(),
                metric: metric.clone(),
                baseline: baseline.clone(),
            };
            content.push_str(&serde_json::to_string(&entry)?);
            content.push('\n');
        }

        std::fs::write(path, &content)
            .map_err(|e| Error::Internal(format!("Failed to write baseline file: {e}")))
    }
}
