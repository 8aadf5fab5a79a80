//! Process runtime metrics skill.
//!
//! Samples the observing process itself: resident/virtual memory, thread
//! count, uptime. Reads come from procfs, which is memory-backed; on
//! platforms without /proc the metrics degrade to zero rather than
//! erroring, so the rest of the system keeps working.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;

use beamlens_core::{CallbackSpec, MetricSnapshot, Skill, SkillError, SkillId};

/// Page size assumed for statm arithmetic.
const PAGE_SIZE: u64 = 4096;

/// Metrics for the running process.
pub struct ProcessSkill {
    started: Instant,
}

impl ProcessSkill {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// (virtual_pages, resident_pages) from /proc/self/statm.
    fn read_statm() -> Option<(u64, u64)> {
        let content = std::fs::read_to_string("/proc/self/statm").ok()?;
        let mut fields = content.split_whitespace();
        let size = fields.next()?.parse().ok()?;
        let resident = fields.next()?.parse().ok()?;
        Some((size, resident))
    }

    /// Thread count from /proc/self/status.
    fn read_threads() -> Option<u64> {
        let content = std::fs::read_to_string("/proc/self/status").ok()?;
        content
            .lines()
            .find(|line| line.starts_with("Threads:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|n| n.parse().ok())
    }
}

impl Default for ProcessSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for ProcessSkill {
    fn id(&self) -> SkillId {
        SkillId::new("process")
    }

    fn title(&self) -> &str {
        "Process runtime"
    }

    fn description(&self) -> &str {
        "Memory, thread, and uptime metrics of the observed process"
    }

    fn system_prompt(&self) -> &str {
        "You observe the host process runtime: its memory footprint, thread \
         count, and uptime. Sustained growth of resident memory without a \
         matching workload change, or an unexpected jump in thread count, \
         is worth reporting."
    }

    fn snapshot(&self) -> MetricSnapshot {
        let (vms_pages, rss_pages) = Self::read_statm().unwrap_or((0, 0));
        let mut metrics = BTreeMap::new();
        metrics.insert("memory_rss_bytes".into(), (rss_pages * PAGE_SIZE) as f64);
        metrics.insert("memory_vms_bytes".into(), (vms_pages * PAGE_SIZE) as f64);
        metrics.insert("threads".into(), Self::read_threads().unwrap_or(0) as f64);
        metrics.insert(
            "uptime_seconds".into(),
            self.started.elapsed().as_secs_f64(),
        );
        MetricSnapshot::new(self.id(), metrics)
    }

    fn callback_specs(&self) -> Vec<CallbackSpec> {
        vec![
            CallbackSpec {
                name: "memory_breakdown".into(),
                description: "Resident and virtual memory of the process, in bytes".into(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            },
            CallbackSpec {
                name: "process_info".into(),
                description: "Pid, uptime, and thread count".into(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            },
        ]
    }

    async fn run_callback(
        &self,
        name: &str,
        _args: serde_json::Value,
    ) -> Result<serde_json::Value, SkillError> {
        match name {
            "memory_breakdown" => {
                let (vms_pages, rss_pages) = Self::read_statm().unwrap_or((0, 0));
                Ok(serde_json::json!({
                    "rss_bytes": rss_pages * PAGE_SIZE,
                    "vms_bytes": vms_pages * PAGE_SIZE,
                    "page_size": PAGE_SIZE,
                }))
            }
            "process_info" => Ok(serde_json::json!({
                "pid": std::process::id(),
                "uptime_seconds": self.started.elapsed().as_secs(),
                "threads": Self::read_threads().unwrap_or(0),
            })),
            other => Err(SkillError::UnknownCallback(other.to_string())),
        }
    }
}
