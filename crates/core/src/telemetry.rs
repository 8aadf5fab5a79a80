//! Telemetry event system — the fixed event catalogue and its bus.
//!
//! Every span-shaped activity (agent run, LLM call, tool execution, baseline
//! judgement, context compaction) emits a `start`/`stop`/`exception` triple
//! with a shared measurement contract: `start` carries `system_time`, `stop`
//! carries `duration_ms`, `exception` carries `duration_ms` plus the failure
//! kind and reason. Every event carries `trace_id` when one is in scope.
//!
//! Telemetry is not logging: subscribers (forwarders, test probes, metric
//! sinks) consume typed events from a broadcast bus and filter for what they
//! care about. Publishing never blocks and never fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::breaker::CircuitState;
use crate::notification::Notification;
use crate::skill::SkillId;

/// The span families in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// One operator run
    Agent,
    /// One LLM call
    Llm,
    /// One tool / callback execution
    Tool,
    /// One watcher baseline judgement
    Judge,
    /// One context compaction pass
    Compaction,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Agent => "agent",
            SpanKind::Llm => "llm",
            SpanKind::Tool => "tool",
            SpanKind::Judge => "judge",
            SpanKind::Compaction => "compaction",
        }
    }
}

/// All telemetry events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEvent {
    SpanStart {
        span: SpanKind,
        label: String,
        trace_id: Option<String>,
        system_time: DateTime<Utc>,
    },

    SpanStop {
        span: SpanKind,
        label: String,
        trace_id: Option<String>,
        duration_ms: u64,
    },

    SpanException {
        span: SpanKind,
        label: String,
        trace_id: Option<String>,
        duration_ms: u64,
        kind: String,
        reason: String,
    },

    /// The breaker transitioned between states
    CircuitStateChange {
        from: CircuitState,
        to: CircuitState,
        failure_count: u32,
        reason: Option<String>,
    },

    /// The breaker refused a call
    CircuitRejected {
        state: CircuitState,
        failure_count: u32,
    },

    /// A notification was pushed onto the alert bus
    AlertFired { notification: Notification },

    ScheduleTriggered { name: String },

    ScheduleSkipped { name: String, reason: String },

    ScheduleCompleted { name: String, duration_ms: u64 },

    ScheduleFailed { name: String, reason: String },

    /// A watcher skipped its LLM call while still filling its window
    WatcherCollecting {
        name: String,
        observations: usize,
        required: usize,
    },

    /// A watcher anomaly was suppressed by a category cooldown
    WatcherSuppressed {
        name: String,
        anomaly_type: String,
        category: String,
        until: DateTime<Utc>,
    },

    /// The anomaly detector moved between learning/active/cooldown
    MonitorPhaseChange { from: String, to: String },

    CoordinatorIterationStart {
        iteration: u32,
        trace_id: Option<String>,
    },

    InsightProduced {
        insight_id: String,
        notification_ids: Vec<String>,
        trace_id: Option<String>,
    },

    CoordinatorDone {
        iterations: u32,
        insights: usize,
        trace_id: Option<String>,
    },

    CoordinatorLlmError {
        reason: String,
        trace_id: Option<String>,
    },

    /// `Done` refused while operators were still running
    DoneRejected {
        running: usize,
        trace_id: Option<String>,
    },

    /// `Schedule` refused while operators were still running
    ScheduleRejected {
        running: usize,
        trace_id: Option<String>,
    },

    OperatorComplete {
        skill: SkillId,
        notifications: usize,
        trace_id: Option<String>,
    },

    OperatorCrashed {
        skill: SkillId,
        reason: String,
        trace_id: Option<String>,
    },

    /// A loop hit its hard iteration bound (not an error)
    MaxIterationsReached {
        scope: String,
        iterations: u32,
        trace_id: Option<String>,
    },
}

impl TelemetryEvent {
    /// The hierarchical event name (e.g., "llm.stop",
    /// "circuit_breaker.state_change").
    pub fn name(&self) -> String {
        match self {
            TelemetryEvent::SpanStart { span, .. } => format!("{}.start", span.as_str()),
            TelemetryEvent::SpanStop { span, .. } => format!("{}.stop", span.as_str()),
            TelemetryEvent::SpanException { span, .. } => format!("{}.exception", span.as_str()),
            TelemetryEvent::CircuitStateChange { .. } => "circuit_breaker.state_change".into(),
            TelemetryEvent::CircuitRejected { .. } => "circuit_breaker.rejected".into(),
            TelemetryEvent::AlertFired { .. } => "alert_handler.alert_fired".into(),
            TelemetryEvent::ScheduleTriggered { .. } => "schedule.triggered".into(),
            TelemetryEvent::ScheduleSkipped { .. } => "schedule.skipped".into(),
            TelemetryEvent::ScheduleCompleted { .. } => "schedule.completed".into(),
            TelemetryEvent::ScheduleFailed { .. } => "schedule.failed".into(),
            TelemetryEvent::WatcherCollecting { .. } => "watcher.baseline_collecting".into(),
            TelemetryEvent::WatcherSuppressed { .. } => "watcher.suppressed".into(),
            TelemetryEvent::MonitorPhaseChange { .. } => "monitor.phase_change".into(),
            TelemetryEvent::CoordinatorIterationStart { .. } => {
                "coordinator.iteration_start".into()
            }
            TelemetryEvent::InsightProduced { .. } => "coordinator.insight_produced".into(),
            TelemetryEvent::CoordinatorDone { .. } => "coordinator.done".into(),
            TelemetryEvent::CoordinatorLlmError { .. } => "coordinator.llm_error".into(),
            TelemetryEvent::DoneRejected { .. } => "coordinator.done_rejected".into(),
            TelemetryEvent::ScheduleRejected { .. } => "coordinator.schedule_rejected".into(),
            TelemetryEvent::OperatorComplete { .. } => "coordinator.operator_complete".into(),
            TelemetryEvent::OperatorCrashed { .. } => "coordinator.operator_crashed".into(),
            TelemetryEvent::MaxIterationsReached { .. } => "coordinator.max_iterations".into(),
        }
    }
}

/// A broadcast-based bus for telemetry events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Components
/// subscribe to receive all events and filter for what they care about.
pub struct TelemetryBus {
    sender: broadcast::Sender<Arc<TelemetryEvent>>,
}

impl TelemetryBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: TelemetryEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetryEvent>> {
        self.sender.subscribe()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new(256)
    }
}
