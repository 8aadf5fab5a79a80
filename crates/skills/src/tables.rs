//! Table statistics skill.
//!
//! The host application registers one [`TableStatsSource`] per in-process
//! table (cache, index, session map) in a shared [`TableRegistry`]; the
//! skill aggregates their row and byte counts. Sources must be cheap and
//! side-effect free, like everything a skill samples.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use beamlens_core::{CallbackSpec, MetricSnapshot, Skill, SkillError, SkillId};

/// Point-in-time statistics for one table.
#[derive(Debug, Clone)]
pub struct TableStats {
    pub rows: u64,
    pub bytes: u64,
}

/// Supplies stats for one named table.
pub trait TableStatsSource: Send + Sync {
    fn stats(&self) -> TableStats;
}

impl<F> TableStatsSource for F
where
    F: Fn() -> TableStats + Send + Sync,
{
    fn stats(&self) -> TableStats {
        self()
    }
}

/// Named table stat sources, registered by the host application.
pub struct TableRegistry {
    sources: RwLock<HashMap<String, Arc<dyn TableStatsSource>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: impl Into<String>, source: Arc<dyn TableStatsSource>) {
        self.sources.write().unwrap().insert(name.into(), source);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.sources.write().unwrap().remove(name).is_some()
    }

    /// Snapshot of all tables, sorted by name.
    fn collect(&self) -> Vec<(String, TableStats)> {
        let sources = self.sources.read().unwrap();
        let mut entries: Vec<(String, TableStats)> = sources
            .iter()
            .map(|(name, source)| (name.clone(), source.stats()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated table metrics.
pub struct TableSkill {
    registry: Arc<TableRegistry>,
}

impl TableSkill {
    pub fn new(registry: Arc<TableRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Skill for TableSkill {
    fn id(&self) -> SkillId {
        SkillId::new("tables")
    }

    fn title(&self) -> &str {
        "Table statistics"
    }

    fn description(&self) -> &str {
        "Row and byte counts of registered in-process tables"
    }

    fn system_prompt(&self) -> &str {
        "You observe the application's in-process tables. Unbounded row \
         growth in a single table, or total table memory growing faster \
         than the workload, is worth reporting."
    }

    fn snapshot(&self) -> MetricSnapshot {
        let entries = self.registry.collect();
        let mut metrics = BTreeMap::new();
        metrics.insert("table_count".into(), entries.len() as f64);
        metrics.insert(
            "total_rows".into(),
            entries.iter().map(|(_, s)| s.rows as f64).sum(),
        );
        metrics.insert(
            "total_bytes".into(),
            entries.iter().map(|(_, s)| s.bytes as f64).sum(),
        );
        MetricSnapshot::new(self.id(), metrics)
    }

    fn callback_specs(&self) -> Vec<CallbackSpec> {
        vec![
            CallbackSpec {
                name: "list_tables".into(),
                description: "All registered tables with their row and byte counts".into(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            },
            CallbackSpec {
                name: "table_info".into(),
                description: "Stats for one named table".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": { "name": { "type": "string" } },
                    "required": ["name"],
                }),
            },
        ]
    }

    async fn run_callback(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, SkillError> {
        match name {
            "list_tables" => {
                let entries: Vec<serde_json::Value> = self
                    .registry
                    .collect()
                    .into_iter()
                    .map(|(table, stats)| {
                        serde_json::json!({
                            "name": table,
                            "rows": stats.rows,
                            "bytes": stats.bytes,
                        })
                    })
                    .collect();
                Ok(serde_json::json!(entries))
            }
            "table_info" => {
                let table = args
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SkillError::CallbackFailed {
                        name: "table_info".into(),
                        reason: "missing required argument: name".into(),
                    })?;
                let source = self
                    .registry
                    .sources
                    .read()
                    .unwrap()
                    .get(table)
                    .cloned()
                    .ok_or_else(|| SkillError::CallbackFailed {
                        name: "table_info".into(),
                        reason: format!("no such table: {table}"),
                    })?;
                let stats = source.stats();
                Ok(serde_json::json!({
                    "name": table,
                    "rows": stats.rows,
                    "bytes": stats.bytes,
                }))
            }
            other => Err(SkillError::UnknownCallback(other.to_string())),
        }
    }
}
