//! The BeamLens runtime — supervisor tree and public API.
//!
//! `BeamLens::start` wires the configured skills, the circuit breaker, the
//! alert bus, the statistical monitor, cron-driven watchers and schedules,
//! and the coordinator actor into one supervised runtime. All public
//! operations go through the returned handle; `shutdown` cancels the whole
//! tree and flushes persisted state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamlens_agent::coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorStatus, RunOptions, RunOutcome,
};
use beamlens_agent::operator::{Operator, OperatorConfig, OperatorEvent, OperatorHandle};
use beamlens_agent::watcher::{Watcher, WatcherConfig, WatcherHandler, WatcherStatus};
use beamlens_agent::{CompactionPolicy, LlmGate, RunContext};
use beamlens_breaker::{BreakerConfig, CircuitBreaker};
use beamlens_bus::{AlertBus, AlertEvent, ClusterForwarder, ClusterTransport};
use beamlens_config::{AlertTrigger, AppConfig};
use beamlens_core::telemetry::TelemetryBus;
use beamlens_core::{
    BreakerSnapshot, ClientRegistry, Error, RunError, SkillId, SkillRegistry,
};
use beamlens_monitor::{AnomalyDetector, BaselineStore, DetectorConfig};
use beamlens_schedule::{CronExpr, ScheduleEntry, ScheduleHandler, ScheduleSet};

/// Result of `investigate()`.
#[derive(Debug)]
pub enum Investigation {
    /// The alert queue was empty.
    NoAlerts,
    /// The coordinator analyzed the drained alerts.
    Analysis(RunOutcome),
}

/// The assembled runtime.
pub struct BeamLens {
    node: String,
    skills: Arc<SkillRegistry>,
    clients: Arc<ClientRegistry>,
    breaker: Arc<CircuitBreaker>,
    telemetry: Arc<TelemetryBus>,
    bus: Arc<AlertBus>,
    coordinator: CoordinatorHandle,
    watchers: HashMap<String, Arc<Watcher>>,
    schedules: ScheduleSet,
    operator_config: OperatorConfig,
    llm_timeout: Duration,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BeamLens {
    /// Bring up the supervisor tree with the declared skills and clients.
    pub fn start(
        config: AppConfig,
        skills: SkillRegistry,
        clients: ClientRegistry,
    ) -> Result<Self, Error> {
        Self::start_with_transport(config, skills, clients, None)
    }

    /// Like [`BeamLens::start`], with optional cluster fan-out.
    pub fn start_with_transport(
        config: AppConfig,
        skills: SkillRegistry,
        clients: ClientRegistry,
        transport: Option<Arc<dyn ClusterTransport>>,
    ) -> Result<Self, Error> {
        config.validate().map_err(|e| Error::Config {
            message: e.to_string(),
        })?;

        let node = config.node.clone();
        let cancel = CancellationToken::new();
        let telemetry = Arc::new(TelemetryBus::new(1024));
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                enabled: config.circuit_breaker.enabled,
                failure_threshold: config.circuit_breaker.failure_threshold,
                success_threshold: config.circuit_breaker.success_threshold,
                reset_timeout: Duration::from_millis(config.circuit_breaker.reset_timeout_ms),
            },
            telemetry.clone(),
        ));
        let mut alert_bus = AlertBus::new(telemetry.clone());
        if let Some(capacity) = config.alert_handler.queue_capacity {
            alert_bus = alert_bus.with_capacity(capacity);
        }
        let bus = Arc::new(alert_bus);
        let skills = Arc::new(Self::select_skills(skills, &config.skills)?);
        let clients = Arc::new(clients);
        let llm_timeout = Duration::from_millis(config.coordinator.llm_timeout_ms);
        let operator_config = OperatorConfig::default();
        let mut tasks = Vec::new();

        // Coordinator actor
        let coordinator_config = CoordinatorConfig {
            node: node.clone(),
            max_iterations: config.coordinator.max_iterations,
            deadline: Duration::from_millis(config.coordinator.deadline_ms),
            llm_timeout,
            compaction: CompactionPolicy {
                max_tokens: config.coordinator.compaction_max_tokens,
                keep_last: config.coordinator.compaction_keep_last,
            },
            operator: operator_config.clone(),
            ..CoordinatorConfig::default()
        };
        let (coordinator, coordinator_task) = Coordinator::new(
            skills.clone(),
            clients.clone(),
            breaker.clone(),
            telemetry.clone(),
            coordinator_config,
            cancel.child_token(),
        )
        .spawn();
        tasks.push(coordinator_task);

        // Statistical monitor
        if config.monitor.enabled {
            let store = match &config.monitor.persistence_path {
                Some(path) => BaselineStore::with_persistence(path.into()),
                None => BaselineStore::in_memory(),
            };
            let detector = AnomalyDetector::new(
                DetectorConfig {
                    collection_interval: Duration::from_millis(
                        config.monitor.collection_interval_ms,
                    ),
                    learning_duration: chrono::Duration::milliseconds(
                        config.monitor.learning_duration_ms as i64,
                    ),
                    z_threshold: config.monitor.z_threshold,
                    consecutive_required: config.monitor.consecutive_required,
                    cooldown: chrono::Duration::milliseconds(config.monitor.cooldown_ms as i64),
                    min_required_samples: config.monitor.min_required_samples,
                    history_window: chrono::Duration::minutes(
                        config.monitor.history_minutes as i64,
                    ),
                    ..DetectorConfig::default()
                },
                skills.clone(),
                store,
                bus.clone(),
                telemetry.clone(),
                node.clone(),
            );
            tasks.push(detector.spawn(cancel.child_token()));
        }

        // Watchers and plain schedules
        let mut schedules = ScheduleSet::new(telemetry.clone(), cancel.child_token());
        let mut watchers = HashMap::new();
        for entry in &config.watchers {
            let skill_id = SkillId::new(entry.skill_id());
            let skill = skills
                .get(&skill_id)
                .ok_or_else(|| Error::Config {
                    message: format!("watcher {} references unknown skill {skill_id}", entry.name),
                })?;
            let gate = LlmGate::new(
                clients.primary()?,
                breaker.clone(),
                telemetry.clone(),
                llm_timeout,
            );
            let watcher = Arc::new(Watcher::new(
                WatcherConfig {
                    name: entry.name.clone(),
                    min_required_observations: entry.min_required_observations,
                    max_observations: entry.max_observations,
                    investigate: entry.investigate,
                    ..WatcherConfig::default()
                },
                skill,
                gate,
                bus.clone(),
                node.clone(),
            ));
            schedules.add(ScheduleEntry::new(
                entry.name.clone(),
                CronExpr::parse(&entry.cron)?,
                Arc::new(WatcherHandler(watcher.clone())),
            ));
            watchers.insert(entry.name.clone(), watcher);
        }
        for entry in &config.schedules {
            let reason = entry
                .reason
                .clone()
                .unwrap_or_else(|| format!("scheduled run: {}", entry.name));
            schedules.add(ScheduleEntry::new(
                entry.name.clone(),
                CronExpr::parse(&entry.cron)?,
                Arc::new(CoordinatorScheduleHandler {
                    coordinator: coordinator.clone(),
                    reason,
                }),
            ));
        }

        // Alert handler: on_alert auto-invokes investigation on every push
        if config.alert_handler.trigger == AlertTrigger::OnAlert {
            tasks.push(Self::spawn_alert_handler(
                bus.clone(),
                coordinator.clone(),
                cancel.child_token(),
            ));
        }

        // Optional cluster fan-out
        if let Some(transport) = transport {
            let forwarder = ClusterForwarder::new(node.clone(), "beamlens.alerts", transport);
            tasks.push(forwarder.spawn(telemetry.clone(), bus.clone(), cancel.child_token()));
        }

        // Mirror telemetry into the log stream
        tasks.push(Self::spawn_telemetry_logger(
            telemetry.clone(),
            cancel.child_token(),
        ));

        info!(
            node = %node,
            skills = skills.len(),
            watchers = watchers.len(),
            "BeamLens runtime started"
        );
        Ok(Self {
            node,
            skills,
            clients,
            breaker,
            telemetry,
            bus,
            coordinator,
            watchers,
            schedules,
            operator_config,
            llm_timeout,
            cancel,
            tasks,
        })
    }

    /// Restrict a registry to the configured skill ids (in config order).
    /// An empty list keeps the registry as provided.
    fn select_skills(registry: SkillRegistry, ids: &[String]) -> Result<SkillRegistry, Error> {
        if ids.is_empty() {
            return Ok(registry);
        }
        let mut selected = SkillRegistry::new();
        for id in ids {
            let skill_id = SkillId::new(id);
            let skill = registry.get(&skill_id).ok_or_else(|| Error::Config {
                message: format!("configured skill not registered: {id}"),
            })?;
            selected.register(skill);
        }
        Ok(selected)
    }

    /// Debug-log every telemetry event by its hierarchical name.
    fn spawn_telemetry_logger(
        telemetry: Arc<TelemetryBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut events = telemetry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => debug!(event = %event.name(), "telemetry"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "telemetry logger lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn spawn_alert_handler(
        bus: Arc<AlertBus>,
        coordinator: CoordinatorHandle,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut alerts = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = alerts.recv() => match event {
                        Some(AlertEvent::AlertAvailable(_)) => {
                            let drained = bus.take_all();
                            if drained.is_empty() {
                                continue; // another consumer got there first
                            }
                            debug!(count = drained.len(), "Auto-investigating alerts");
                            let opts = RunOptions {
                                notifications: drained,
                                ..RunOptions::default()
                            };
                            let context = RunContext::with_reason("investigate fired alerts");
                            if let Err(e) = coordinator.run(context, opts).await {
                                warn!(error = %e, "Auto-investigation failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        })
    }

    // ── Public operations ─────────────────────────────────────────────

    /// One-shot coordinator invocation.
    pub async fn run(&self, context: RunContext, opts: RunOptions) -> Result<RunOutcome, Error> {
        self.coordinator.run(context, opts).await
    }

    /// Fire-and-forget operator invocation; events arrive on `sender`. The
    /// returned handle can route out-of-band questions into the live run
    /// and may simply be dropped.
    pub fn run_async(
        &self,
        skill: &SkillId,
        context: RunContext,
        sender: tokio::sync::mpsc::UnboundedSender<OperatorEvent>,
    ) -> Result<OperatorHandle, Error> {
        let skill_impl = self
            .skills
            .get(skill)
            .ok_or_else(|| Error::Run(RunError::NotFound(skill.to_string())))?;
        let gate = LlmGate::new(
            self.clients.primary()?,
            self.breaker.clone(),
            self.telemetry.clone(),
            self.llm_timeout,
        );
        let operator = Arc::new(Operator::new(
            skill_impl,
            gate,
            Some(self.bus.clone()),
            self.node.clone(),
            self.operator_config.clone(),
        ));
        Ok(operator.run_async(context, sender, None, self.cancel.child_token()))
    }

    /// Drain the alert bus and invoke the coordinator on the drained set.
    pub async fn investigate(&self) -> Result<Investigation, Error> {
        let drained = self.bus.take_all();
        if drained.is_empty() {
            return Ok(Investigation::NoAlerts);
        }
        let opts = RunOptions {
            notifications: drained,
            ..RunOptions::default()
        };
        let outcome = self
            .coordinator
            .run(RunContext::with_reason("investigate pending alerts"), opts)
            .await?;
        Ok(Investigation::Analysis(outcome))
    }

    /// Whether any alerts are queued.
    pub fn pending_alerts(&self) -> bool {
        self.bus.pending()
    }

    /// Names of all configured watchers.
    pub fn list_watchers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watchers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fire a watcher immediately, unless it is already running.
    pub fn trigger_watcher(&self, name: &str) -> Result<(), Error> {
        if !self.watchers.contains_key(name) {
            return Err(Error::Run(RunError::NotFound(name.to_string())));
        }
        self.schedules.run_now(name)
    }

    pub async fn watcher_status(&self, name: &str) -> Result<WatcherStatus, Error> {
        let watcher = self
            .watchers
            .get(name)
            .ok_or_else(|| Error::Run(RunError::NotFound(name.to_string())))?;
        Ok(watcher.status().await)
    }

    pub async fn coordinator_status(&self) -> Result<CoordinatorStatus, Error> {
        self.coordinator.status().await
    }

    pub fn circuit_breaker_state(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    /// The telemetry bus, for subscribers (forwarders, metric sinks, tests).
    pub fn telemetry(&self) -> Arc<TelemetryBus> {
        self.telemetry.clone()
    }

    /// The alert bus, for producers outside the built-in pathways.
    pub fn alert_bus(&self) -> Arc<AlertBus> {
        self.bus.clone()
    }

    /// Cancel the supervisor tree and wait for workers to wind down.
    pub async fn shutdown(self) {
        info!(node = %self.node, "BeamLens runtime shutting down");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Worker ended abnormally during shutdown");
                }
            }
        }
    }
}

/// Plain-schedule handler: invokes the coordinator with a fixed reason.
struct CoordinatorScheduleHandler {
    coordinator: CoordinatorHandle,
    reason: String,
}

#[async_trait]
impl ScheduleHandler for CoordinatorScheduleHandler {
    async fn run(&self) -> Result<(), Error> {
        self.coordinator
            .run(
                RunContext::with_reason(self.reason.clone()),
                RunOptions::default(),
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamlens_agent::testing::ScriptedClient;

    #[tokio::test]
    async fn select_skills_preserves_config_order() {
        let registry = beamlens_skills::default_registry();
        let selected =
            BeamLens::select_skills(registry, &["tables".into(), "process".into()]).unwrap();
        assert_eq!(
            selected.ids(),
            vec![SkillId::new("tables"), SkillId::new("process")]
        );
    }

    #[tokio::test]
    async fn unknown_configured_skill_fails_startup() {
        let config = AppConfig {
            skills: vec!["ghost".into()],
            ..AppConfig::default()
        };
        let clients = ClientRegistry::single(Arc::new(ScriptedClient::new(vec![])));
        let result = BeamLens::start(config, beamlens_skills::default_registry(), clients);
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
