//! The watcher — LLM-judged baseline observation for one skill.
//!
//! An alternative anomaly pathway for domains where statistical baselining
//! is insufficient. The watcher keeps a sliding window of snapshots and, on
//! each cron-driven tick, asks the LLM to classify the window. Reported
//! anomalies are suppressed per *category* (the `anomaly_type` prefix
//! before the first underscore) until their cooldown expires. On emission
//! the watcher can run a bounded operator investigation and attach the
//! findings to the notification.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamlens_bus::AlertBus;
use beamlens_core::telemetry::{SpanKind, TelemetryEvent};
use beamlens_core::{
    ChatRequest, Error, Message, MetricSnapshot, Notification, Skill, SkillId, WatcherFindings,
};
use beamlens_schedule::ScheduleHandler;

use crate::context::RunContext;
use crate::llm::LlmGate;
use crate::operator::{Operator, OperatorConfig};
use crate::prompts;
use crate::tools::{parse_json_payload, BaselineVerdict};

/// Watcher tuning.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub name: String,

    /// Skip the LLM below this many buffered observations.
    pub min_required_observations: usize,

    /// Window bounds.
    pub max_observations: usize,
    pub max_age: ChronoDuration,

    /// Run a bounded operator investigation on every reported anomaly.
    pub investigate: bool,
    pub investigation_max_iterations: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            name: "watcher".into(),
            min_required_observations: 3,
            max_observations: 30,
            max_age: ChronoDuration::minutes(30),
            investigate: false,
            investigation_max_iterations: 5,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherTick {
    /// Still filling the window; the LLM was not consulted.
    Collecting { observations: usize, required: usize },
    /// The LLM wants more observation.
    Observing,
    /// The LLM judged the window healthy.
    Healthy,
    /// An anomaly notification was pushed onto the bus.
    Reported { notification_id: String },
    /// An anomaly was withheld by a category cooldown.
    Suppressed { category: String },
}

/// Introspection view for `watcher_status`.
#[derive(Debug, Clone)]
pub struct WatcherStatus {
    pub name: String,
    pub skill: SkillId,
    pub observations: usize,
    pub phase: String,
    pub last_verdict: Option<String>,
    pub active_cooldowns: Vec<(String, DateTime<Utc>)>,
}

struct WatcherState {
    window: VecDeque<MetricSnapshot>,
    notes: Vec<String>,
    cooldowns: HashMap<String, DateTime<Utc>>,
    last_verdict: Option<String>,
}

/// A per-skill LLM baseline observer.
pub struct Watcher {
    config: WatcherConfig,
    skill: Arc<dyn Skill>,
    gate: LlmGate,
    bus: Arc<AlertBus>,
    node: String,
    state: Mutex<WatcherState>,
}

impl Watcher {
    pub fn new(
        config: WatcherConfig,
        skill: Arc<dyn Skill>,
        gate: LlmGate,
        bus: Arc<AlertBus>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            config,
            skill,
            gate,
            bus,
            node: node.into(),
            state: Mutex::new(WatcherState {
                window: VecDeque::new(),
                notes: Vec::new(),
                cooldowns: HashMap::new(),
                last_verdict: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// One observation tick at the given instant.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<WatcherTick, Error> {
        let mut snapshot = self.skill.snapshot();
        snapshot.taken_at = now;

        // Buffer the snapshot and copy out what the judgement needs, so the
        // state lock is not held across the LLM call.
        let (window, notes) = {
            let mut state = self.state.lock().await;
            state.window.push_back(snapshot);
            let cutoff = now - self.config.max_age;
            while state.window.front().is_some_and(|s| s.taken_at < cutoff) {
                state.window.pop_front();
            }
            while state.window.len() > self.config.max_observations {
                state.window.pop_front();
            }

            if state.window.len() < self.config.min_required_observations {
                self.gate.telemetry.publish(TelemetryEvent::WatcherCollecting {
                    name: self.config.name.clone(),
                    observations: state.window.len(),
                    required: self.config.min_required_observations,
                });
                return Ok(WatcherTick::Collecting {
                    observations: state.window.len(),
                    required: self.config.min_required_observations,
                });
            }
            (
                state.window.iter().cloned().collect::<Vec<_>>(),
                state.notes.clone(),
            )
        };

        let verdict = self.judge(&window, &notes).await?;
        let mut state = self.state.lock().await;
        match verdict {
            BaselineVerdict::ContinueObserving { notes, confidence } => {
                debug!(watcher = %self.config.name, ?confidence, "Continuing observation");
                if !notes.is_empty() {
                    state.notes.push(notes);
                }
                state.last_verdict = Some("continue_observing".into());
                Ok(WatcherTick::Observing)
            }

            BaselineVerdict::ReportHealthy { summary, .. } => {
                debug!(watcher = %self.config.name, summary = %summary, "Window healthy");
                state.notes.clear();
                state.last_verdict = Some("report_healthy".into());
                Ok(WatcherTick::Healthy)
            }

            BaselineVerdict::ReportAnomaly {
                anomaly_type,
                severity,
                summary,
                evidence,
                confidence: _,
                cooldown_minutes,
            } => {
                state.last_verdict = Some("report_anomaly".into());
                let category = anomaly_type
                    .split('_')
                    .next()
                    .unwrap_or(&anomaly_type)
                    .to_string();

                if let Some(&until) = state.cooldowns.get(&category) {
                    if until > now {
                        info!(
                            watcher = %self.config.name,
                            category = %category,
                            "Anomaly suppressed by category cooldown"
                        );
                        self.gate.telemetry.publish(TelemetryEvent::WatcherSuppressed {
                            name: self.config.name.clone(),
                            anomaly_type,
                            category: category.clone(),
                            until,
                        });
                        return Ok(WatcherTick::Suppressed { category });
                    }
                }

                let recent: Vec<MetricSnapshot> =
                    window.iter().rev().take(5).rev().cloned().collect();
                let mut notification = Notification::new(
                    self.skill.id(),
                    anomaly_type,
                    severity,
                    evidence.join("; "),
                    summary.clone(),
                    self.node.clone(),
                )
                .with_snapshots(recent);

                if self.config.investigate {
                    match self.investigate(&summary).await {
                        Ok(findings) => notification = notification.with_findings(findings),
                        Err(e) => {
                            warn!(watcher = %self.config.name, error = %e, "Investigation failed")
                        }
                    }
                }

                let id = notification.id.clone();
                self.bus.push(notification);
                state
                    .cooldowns
                    .insert(category, now + ChronoDuration::minutes(cooldown_minutes as i64));
                Ok(WatcherTick::Reported { notification_id: id })
            }
        }
    }

    /// Ask the LLM to classify the window.
    async fn judge(
        &self,
        window: &[MetricSnapshot],
        notes: &[String],
    ) -> Result<BaselineVerdict, Error> {
        let mut user = format!(
            "Domain: {} ({})\n\nObservation window ({} snapshots):\n{}",
            self.skill.title(),
            self.skill.id(),
            window.len(),
            serde_json::to_string(window)?
        );
        if !notes.is_empty() {
            user.push_str(&format!("\n\nNotes from earlier ticks:\n{}", notes.join("\n")));
        }

        let request = ChatRequest::new(prompts::ANALYZE_BASELINE, vec![Message::user(user)]);
        let response = self
            .gate
            .complete(
                SpanKind::Judge,
                &self.config.name,
                request,
                None,
                &CancellationToken::new(),
            )
            .await?;
        parse_json_payload(&response.message.content)
    }

    /// Bounded operator run after a reported anomaly.
    async fn investigate(&self, summary: &str) -> Result<WatcherFindings, Error> {
        let operator = Operator::new(
            self.skill.clone(),
            self.gate.clone(),
            None,
            self.node.clone(),
            OperatorConfig {
                max_iterations: self.config.investigation_max_iterations,
                ..OperatorConfig::default()
            },
        );
        let run = operator
            .run(
                RunContext::with_reason(format!("Investigate reported anomaly: {summary}")),
                CancellationToken::new(),
            )
            .await?;

        let evidence: Vec<String> = run
            .notifications
            .iter()
            .map(|n| n.observation.clone())
            .collect();
        let findings_summary = if evidence.is_empty() {
            "investigation found no additional anomalies".to_string()
        } else {
            evidence.join("; ")
        };
        Ok(WatcherFindings {
            summary: findings_summary,
            evidence,
            iterations: run.iterations,
        })
    }

    pub async fn status(&self) -> WatcherStatus {
        let state = self.state.lock().await;
        let phase = if state.window.len() < self.config.min_required_observations {
            "collecting"
        } else {
            "observing"
        };
        let mut cooldowns: Vec<(String, DateTime<Utc>)> = state
            .cooldowns
            .iter()
            .filter(|(_, until)| **until > Utc::now())
            .map(|(category, until)| (category.clone(), *until))
            .collect();
        cooldowns.sort();
        WatcherStatus {
            name: self.config.name.clone(),
            skill: self.skill.id(),
            observations: state.window.len(),
            phase: phase.into(),
            last_verdict: state.last_verdict.clone(),
            active_cooldowns: cooldowns,
        }
    }
}

/// Adapter so a watcher can sit behind a cron schedule.
pub struct WatcherHandler(pub Arc<Watcher>);

#[async_trait]
impl ScheduleHandler for WatcherHandler {
    async fn run(&self) -> Result<(), Error> {
        self.0.tick(Utc::now()).await.map(|_| ())
    }
}
