//! Configuration loading, validation, and defaults for BeamLens.
//!
//! Loads from a TOML file with serde defaults for every setting, then
//! validates the whole tree at startup. The supervisor consumes the typed
//! sections directly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Origin node identifier stamped onto notifications.
    #[serde(default = "default_node")]
    pub node: String,

    /// Skills to enable, by id, in order. Empty means the built-in set.
    #[serde(default)]
    pub skills: Vec<String>,

    /// Cron-driven watchers.
    #[serde(default)]
    pub watchers: Vec<WatcherEntry>,

    /// Cron-driven plain schedules.
    #[serde(default)]
    pub schedules: Vec<ScheduleEntryConfig>,

    /// How alerts trigger investigation.
    #[serde(default)]
    pub alert_handler: AlertHandlerConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerSettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    /// Named LLM clients; resolution happens in the LLM transport layer.
    #[serde(default)]
    pub client_registry: ClientRegistryConfig,
}

fn default_node() -> String {
    "local".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: default_node(),
            skills: Vec::new(),
            watchers: Vec::new(),
            schedules: Vec::new(),
            alert_handler: AlertHandlerConfig::default(),
            circuit_breaker: BreakerSettings::default(),
            monitor: MonitorSettings::default(),
            coordinator: CoordinatorSettings::default(),
            client_registry: ClientRegistryConfig::default(),
        }
    }
}

/// One watcher entry: `{name, cron}` shorthand plus optional tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherEntry {
    pub name: String,

    /// 5-field cron expression.
    pub cron: String,

    /// Which skill the watcher observes. Defaults to the entry name.
    #[serde(default)]
    pub skill: Option<String>,

    #[serde(default = "default_min_observations")]
    pub min_required_observations: usize,

    #[serde(default = "default_max_observations")]
    pub max_observations: usize,

    #[serde(default)]
    pub investigate: bool,
}

fn default_min_observations() -> usize {
    3
}
fn default_max_observations() -> usize {
    30
}

impl WatcherEntry {
    pub fn skill_id(&self) -> &str {
        self.skill.as_deref().unwrap_or(&self.name)
    }
}

/// A plain schedule: fires the coordinator with the given reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntryConfig {
    pub name: String,
    pub cron: String,

    /// Reason string handed to the coordinator run.
    #[serde(default)]
    pub reason: Option<String>,
}

/// When investigation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertTrigger {
    /// Every pushed alert invokes the coordinator.
    #[default]
    OnAlert,
    /// Alerts queue until `investigate()` is called.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertHandlerConfig {
    #[serde(default)]
    pub trigger: AlertTrigger,

    /// Cap on the alert queue; oldest entries drop on overflow.
    /// None leaves the queue unbounded.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_reset_timeout_ms() -> u64 {
    60_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_collection_interval_ms")]
    pub collection_interval_ms: u64,

    #[serde(default = "default_learning_duration_ms")]
    pub learning_duration_ms: u64,

    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,

    #[serde(default = "default_consecutive_required")]
    pub consecutive_required: u32,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_history_minutes")]
    pub history_minutes: u64,

    #[serde(default = "default_min_required_samples")]
    pub min_required_samples: usize,

    /// Where baselines persist; none means in-memory only.
    #[serde(default)]
    pub persistence_path: Option<String>,
}

fn default_collection_interval_ms() -> u64 {
    30_000
}
fn default_learning_duration_ms() -> u64 {
    1_800_000
}
fn default_z_threshold() -> f64 {
    3.0
}
fn default_consecutive_required() -> u32 {
    3
}
fn default_cooldown_ms() -> u64 {
    300_000
}
fn default_history_minutes() -> u64 {
    60
}
fn default_min_required_samples() -> usize {
    10
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            collection_interval_ms: default_collection_interval_ms(),
            learning_duration_ms: default_learning_duration_ms(),
            z_threshold: default_z_threshold(),
            consecutive_required: default_consecutive_required(),
            cooldown_ms: default_cooldown_ms(),
            history_minutes: default_history_minutes(),
            min_required_samples: default_min_required_samples(),
            persistence_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    #[serde(default = "default_compaction_max_tokens")]
    pub compaction_max_tokens: usize,

    #[serde(default = "default_compaction_keep_last")]
    pub compaction_keep_last: usize,
}

fn default_max_iterations() -> u32 {
    25
}
fn default_deadline_ms() -> u64 {
    300_000
}
fn default_llm_timeout_ms() -> u64 {
    60_000
}
fn default_compaction_max_tokens() -> usize {
    50_000
}
fn default_compaction_keep_last() -> usize {
    5
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            deadline_ms: default_deadline_ms(),
            llm_timeout_ms: default_llm_timeout_ms(),
            compaction_max_tokens: default_compaction_max_tokens(),
            compaction_keep_last: default_compaction_keep_last(),
        }
    }
}

/// Named LLM client declarations, passed through to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientRegistryConfig {
    #[serde(default)]
    pub primary: Option<String>,

    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    pub provider: String,

    /// Provider-specific options, passed through opaquely.
    #[serde(default)]
    pub options: HashMap<String, toml::Value>,
}

/// Error type for loading and validation.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {e}"),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {e}"),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl AppConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&content)
    }

    /// Parse and validate TOML content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.trim().is_empty() {
            return Err(ConfigError::Invalid("node must not be empty".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.success_threshold must be at least 1".into(),
            ));
        }
        if self.monitor.z_threshold <= 0.0 {
            return Err(ConfigError::Invalid(
                "monitor.z_threshold must be positive".into(),
            ));
        }
        if self.monitor.consecutive_required == 0 {
            return Err(ConfigError::Invalid(
                "monitor.consecutive_required must be at least 1".into(),
            ));
        }
        if self.coordinator.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.max_iterations must be at least 1".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for watcher in &self.watchers {
            if !names.insert(watcher.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate watcher name: {}",
                    watcher.name
                )));
            }
        }
        for schedule in &self.schedules {
            if !names.insert(schedule.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate schedule name: {}",
                    schedule.name
                )));
            }
        }

        if let Some(primary) = &self.client_registry.primary {
            if !self
                .client_registry
                .clients
                .iter()
                .any(|c| &c.name == primary)
            {
                return Err(ConfigError::Invalid(format!(
                    "client_registry.primary '{primary}' is not among the declared clients"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.node, "local");
        assert!(config.circuit_breaker.enabled);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.coordinator.max_iterations, 25);
        assert_eq!(config.coordinator.compaction_max_tokens, 50_000);
        assert_eq!(config.alert_handler.trigger, AlertTrigger::OnAlert);
        assert!(!config.monitor.enabled);
    }

    #[test]
    fn full_config_parses() {
        let config = AppConfig::parse(
            r#"
            node = "web-1"
            skills = ["process", "tables"]

            [alert_handler]
            trigger = "manual"

            [circuit_breaker]
            failure_threshold = 3
            reset_timeout_ms = 30000

            [monitor]
            enabled = true
            z_threshold = 2.5
            consecutive_required = 4
            persistence_path = "/var/lib/beamlens/baselines.jsonl"

            [[watchers]]
            name = "beam_watch"
            cron = "*/5 * * * *"
            skill = "process"
            investigate = true

            [[schedules]]
            name = "hourly_review"
            cron = "0 * * * *"
            reason = "hourly review"

            [client_registry]
            primary = "main"

            [[client_registry.clients]]
            name = "main"
            provider = "anthropic"
            [client_registry.clients.options]
            model = "claude-sonnet-4-5"
            "#,
        )
        .unwrap();

        assert_eq!(config.node, "web-1");
        assert_eq!(config.alert_handler.trigger, AlertTrigger::Manual);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert!(config.monitor.enabled);
        assert_eq!(config.watchers.len(), 1);
        assert_eq!(config.watchers[0].skill_id(), "process");
        assert!(config.watchers[0].investigate);
        assert_eq!(config.schedules[0].reason.as_deref(), Some("hourly review"));
        assert_eq!(config.client_registry.primary.as_deref(), Some("main"));
    }

    #[test]
    fn watcher_skill_defaults_to_name() {
        let config = AppConfig::parse(
            r#"
            [[watchers]]
            name = "process"
            cron = "* * * * *"
            "#,
        )
        .unwrap();
        assert_eq!(config.watchers[0].skill_id(), "process");
        assert_eq!(config.watchers[0].min_required_observations, 3);
    }

    #[test]
    fn duplicate_watcher_names_rejected() {
        let result = AppConfig::parse(
            r#"
            [[watchers]]
            name = "w"
            cron = "* * * * *"
            [[watchers]]
            name = "w"
            cron = "* * * * *"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_thresholds_rejected() {
        let result = AppConfig::parse(
            r#"
            [circuit_breaker]
            failure_threshold = 0
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn primary_must_be_declared() {
        let result = AppConfig::parse(
            r#"
            [client_registry]
            primary = "ghost"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beamlens.toml");
        std::fs::write(&path, "node = \"file-node\"\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.node, "file-node");

        assert!(AppConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
