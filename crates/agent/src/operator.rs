//! The operator loop — a per-skill LLM tool-calling agent.
//!
//! One operator investigates one skill. Each iteration asks the LLM to pick
//! exactly one tool from the closed set, executes it, and appends the
//! result to the context. The loop ends on `finish`, on cancellation, or at
//! the iteration cap (which is a bounded outcome, not an error).
//!
//! Schema failures and tool failures are recoverable: they are fed back to
//! the LLM as error results and count against the iteration cap. Transport
//! failures and an open breaker terminate the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamlens_bus::AlertBus;
use beamlens_core::telemetry::{SpanKind, TelemetryEvent};
use beamlens_core::{
    ChatRequest, Error, Message, MetricSnapshot, Notification, RunError, Skill, SkillId,
};

use crate::context::RunContext;
use crate::llm::LlmGate;
use crate::prompts;
use crate::tools::{self, OperatorTool};

/// Operator tuning.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Hard upper bound on LLM iterations per run.
    pub max_iterations: u32,

    /// Deadline for a single skill callback.
    pub callback_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            callback_timeout: Duration::from_secs(5),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The LLM called `finish`.
    Finished,
    /// The iteration cap was reached.
    MaxIterations,
}

/// The result of one operator run.
#[derive(Debug, Clone)]
pub struct OperatorRun {
    pub skill: SkillId,
    pub notifications: Vec<Notification>,
    pub iterations: u32,
    pub finish: FinishReason,
}

/// An out-of-band question routed into a running operator's loop.
///
/// Answered against the run's accumulated context by one short LLM call
/// (no tool loop) at the operator's next suspension point.
pub struct OperatorAsk {
    pub question: String,
    pub reply: oneshot::Sender<Result<String, Error>>,
}

/// Caller-side handle to a live async operator run.
#[derive(Debug)]
pub struct OperatorHandle {
    skill: SkillId,
    asks: mpsc::UnboundedSender<OperatorAsk>,
    task: JoinHandle<()>,
}

impl OperatorHandle {
    pub fn skill(&self) -> &SkillId {
        &self.skill
    }

    /// Ask the running operator a question. The answer reflects whatever
    /// the run has observed so far; a finished run refuses the question.
    pub async fn message(&self, text: &str) -> Result<String, Error> {
        let (reply, rx) = oneshot::channel();
        self.asks
            .send(OperatorAsk {
                question: text.to_string(),
                reply,
            })
            .map_err(|_| Error::Run(RunError::NotFound("operator run already finished".into())))?;
        rx.await
            .map_err(|_| Error::Run(RunError::WorkerCrashed("operator dropped the question".into())))?
    }

    /// The underlying task. Dropping the handle detaches the run.
    pub fn task(&self) -> &JoinHandle<()> {
        &self.task
    }
}

/// Messages an async operator run sends to its caller.
#[derive(Debug)]
pub enum OperatorEvent {
    /// A notification was produced mid-run (immediate delivery).
    NotificationProduced {
        skill: SkillId,
        notification: Notification,
    },
    /// The run ended.
    Complete {
        skill: SkillId,
        result: Result<OperatorRun, Error>,
    },
}

/// A per-skill LLM agent.
pub struct Operator {
    skill: Arc<dyn Skill>,
    gate: LlmGate,
    /// When set, produced notifications are also pushed onto the bus.
    bus: Option<Arc<AlertBus>>,
    node: String,
    config: OperatorConfig,
}

impl Operator {
    pub fn new(
        skill: Arc<dyn Skill>,
        gate: LlmGate,
        bus: Option<Arc<AlertBus>>,
        node: impl Into<String>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            skill,
            gate,
            bus,
            node: node.into(),
            config,
        }
    }

    pub fn skill_id(&self) -> SkillId {
        self.skill.id()
    }

    /// Blocking one-shot investigation.
    pub async fn run(
        &self,
        context: RunContext,
        cancel: CancellationToken,
    ) -> Result<OperatorRun, Error> {
        self.run_with_events(context, None, None, None, cancel).await
    }

    /// Fire-and-forget investigation. Notifications and the final result
    /// arrive as [`OperatorEvent`]s; a panicking run surfaces as
    /// `RunError::WorkerCrashed` instead of taking the caller down. The
    /// returned handle routes out-of-band questions into the live run.
    pub fn run_async(
        self: Arc<Self>,
        context: RunContext,
        events: mpsc::UnboundedSender<OperatorEvent>,
        trace_id: Option<String>,
        cancel: CancellationToken,
    ) -> OperatorHandle {
        let (ask_tx, ask_rx) = mpsc::unbounded_channel();
        let skill = self.skill.id();
        let task = tokio::spawn(async move {
            let skill = self.skill.id();
            let result = std::panic::AssertUnwindSafe(self.run_with_events(
                context,
                Some(events.clone()),
                Some(ask_rx),
                trace_id,
                cancel,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(Error::Run(RunError::WorkerCrashed(format!(
                    "operator {skill} panicked"
                ))))
            });
            let _ = events.send(OperatorEvent::Complete { skill, result });
        });
        OperatorHandle {
            skill,
            asks: ask_tx,
            task,
        }
    }

    async fn run_with_events(
        &self,
        context: RunContext,
        events: Option<mpsc::UnboundedSender<OperatorEvent>>,
        asks: Option<mpsc::UnboundedReceiver<OperatorAsk>>,
        trace_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<OperatorRun, Error> {
        let skill_id = self.skill.id();
        let label = format!("operator:{skill_id}");
        let trace = trace_id.as_deref();
        let started = tokio::time::Instant::now();

        self.gate.telemetry.publish(TelemetryEvent::SpanStart {
            span: SpanKind::Agent,
            label: label.clone(),
            trace_id: trace_id.clone(),
            system_time: Utc::now(),
        });

        let result = self
            .tool_loop(&context, events.as_ref(), asks, trace, &cancel)
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(run) => {
                info!(
                    skill = %skill_id,
                    iterations = run.iterations,
                    notifications = run.notifications.len(),
                    "Operator run complete"
                );
                self.gate.telemetry.publish(TelemetryEvent::SpanStop {
                    span: SpanKind::Agent,
                    label,
                    trace_id,
                    duration_ms,
                });
            }
            Err(e) => {
                self.gate.telemetry.publish(TelemetryEvent::SpanException {
                    span: SpanKind::Agent,
                    label,
                    trace_id,
                    duration_ms,
                    kind: "error".into(),
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn tool_loop(
        &self,
        context: &RunContext,
        events: Option<&mpsc::UnboundedSender<OperatorEvent>>,
        mut asks: Option<mpsc::UnboundedReceiver<OperatorAsk>>,
        trace: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<OperatorRun, Error> {
        let skill_id = self.skill.id();
        let label = format!("operator:{skill_id}");
        let system = format!(
            "{}\n\n{}\n\n## Available callbacks\n\n{}",
            self.skill.system_prompt(),
            prompts::OPERATOR_RULES,
            self.skill.callback_docs()
        );

        let mut messages = vec![Message::user(context.render())];
        let mut notifications: Vec<Notification> = Vec::new();
        let mut snapshots: Vec<MetricSnapshot> = Vec::new();
        let mut iteration = 0u32;
        let finish;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Run(RunError::Cancelled));
            }
            if iteration >= self.config.max_iterations {
                self.gate
                    .telemetry
                    .publish(TelemetryEvent::MaxIterationsReached {
                        scope: label.clone(),
                        iterations: iteration,
                        trace_id: trace.map(String::from),
                    });
                warn!(skill = %skill_id, iterations = iteration, "Operator hit iteration cap");
                finish = FinishReason::MaxIterations;
                break;
            }
            iteration += 1;

            // Tool boundary: answer any questions that queued up
            if let Some(rx) = asks.as_mut() {
                while let Ok(ask) = rx.try_recv() {
                    self.answer_ask(ask, &system, &messages, trace, cancel).await;
                }
            }

            let request = ChatRequest::new(&system, messages.clone())
                .with_tools(OperatorTool::definitions());
            let llm = self
                .gate
                .complete(SpanKind::Llm, &label, request, trace, cancel);
            tokio::pin!(llm);
            // Stay responsive to questions while the call is in flight
            let response = loop {
                tokio::select! {
                    result = &mut llm => break result?,
                    ask = next_ask(&mut asks) => {
                        self.answer_ask(ask, &system, &messages, trace, cancel).await;
                    }
                }
            };

            let parsed = tools::single_call(&response)
                .map(|call| (call.id.clone(), OperatorTool::parse(call)));
            messages.push(response.message.clone());

            let (call_id, tool) = match parsed {
                Ok((id, Ok(tool))) => (id, tool),
                Ok((id, Err(e))) => {
                    // Recoverable: the parse error becomes the observation
                    debug!(skill = %skill_id, error = %e, "Unparseable tool choice");
                    messages.push(Message::tool_result(id, error_payload(&e)));
                    continue;
                }
                Err(e) => {
                    debug!(skill = %skill_id, error = %e, "Malformed tool response");
                    messages.push(Message::user(error_payload(&e)));
                    continue;
                }
            };

            match tool {
                OperatorTool::TakeSnapshot => {
                    let snapshot = self.skill.snapshot();
                    snapshots.push(snapshot.clone());
                    let payload = serde_json::to_string(&snapshot)
                        .unwrap_or_else(|e| error_string(&e.to_string()));
                    messages.push(Message::tool_result(call_id, payload));
                }

                OperatorTool::RunCallback { name, args } => {
                    let payload = self.execute_callback(&name, args, trace).await;
                    messages.push(Message::tool_result(call_id, payload));
                }

                OperatorTool::SendNotification(args) => {
                    let mut notification = Notification::new(
                        skill_id.clone(),
                        args.anomaly_type,
                        args.severity,
                        args.context,
                        args.observation,
                        self.node.clone(),
                    )
                    .with_snapshots(snapshots.clone());
                    if let Some(hypothesis) = args.hypothesis {
                        notification = notification.with_hypothesis(hypothesis);
                    }

                    if let Some(events) = events {
                        let _ = events.send(OperatorEvent::NotificationProduced {
                            skill: skill_id.clone(),
                            notification: notification.clone(),
                        });
                    }
                    if let Some(bus) = &self.bus {
                        bus.push(notification.clone());
                    }
                    let payload = format!("{{\"ok\": true, \"id\": \"{}\"}}", notification.id);
                    notifications.push(notification);
                    messages.push(Message::tool_result(call_id, payload));
                }

                OperatorTool::Think { thought } => {
                    debug!(skill = %skill_id, thought = %thought, "Operator thinking");
                    messages.push(Message::tool_result(call_id, "{\"ok\": true}"));
                }

                OperatorTool::Wait { ms } => {
                    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(Error::Run(RunError::Cancelled)),
                            _ = tokio::time::sleep_until(deadline) => break,
                            ask = next_ask(&mut asks) => {
                                self.answer_ask(ask, &system, &messages, trace, cancel).await;
                            }
                        }
                    }
                    messages.push(Message::tool_result(
                        call_id,
                        format!("{{\"waited_ms\": {ms}}}"),
                    ));
                }

                OperatorTool::Finish => {
                    finish = FinishReason::Finished;
                    break;
                }
            }
        }

        Ok(OperatorRun {
            skill: skill_id,
            notifications,
            iterations: iteration,
            finish,
        })
    }

    /// Answer one out-of-band question with a single LLM call over the
    /// run's accumulated context. No tool loop; the reply goes straight
    /// back to the asker, and an asker that stopped waiting is fine.
    async fn answer_ask(
        &self,
        ask: OperatorAsk,
        system: &str,
        messages: &[Message],
        trace: Option<&str>,
        cancel: &CancellationToken,
    ) {
        debug!(skill = %self.skill.id(), "Answering out-of-band question");
        let mut context = messages.to_vec();
        context.push(Message::user(ask.question));

        let label = format!("operator:{}", self.skill.id());
        let result = self
            .gate
            .complete(SpanKind::Llm, &label, ChatRequest::new(system, context), trace, cancel)
            .await
            .map(|response| response.message.content);
        let _ = ask.reply.send(result);
    }

    /// Run one callback under the per-callback deadline, with tool span
    /// telemetry. Failures are encoded as `{error: …}` results so the loop
    /// continues.
    async fn execute_callback(
        &self,
        name: &str,
        args: serde_json::Value,
        trace: Option<&str>,
    ) -> String {
        let started = tokio::time::Instant::now();
        self.gate.telemetry.publish(TelemetryEvent::SpanStart {
            span: SpanKind::Tool,
            label: name.to_string(),
            trace_id: trace.map(String::from),
            system_time: Utc::now(),
        });

        let outcome = tokio::time::timeout(
            self.config.callback_timeout,
            self.skill.run_callback(name, args),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                self.gate.telemetry.publish(TelemetryEvent::SpanStop {
                    span: SpanKind::Tool,
                    label: name.to_string(),
                    trace_id: trace.map(String::from),
                    duration_ms,
                });
                serde_json::to_string(&value).unwrap_or_else(|e| {
                    error_string(&format!("callback result not encodable: {e}"))
                })
            }
            Ok(Err(e)) => {
                self.gate.telemetry.publish(TelemetryEvent::SpanException {
                    span: SpanKind::Tool,
                    label: name.to_string(),
                    trace_id: trace.map(String::from),
                    duration_ms,
                    kind: "callback_error".into(),
                    reason: e.to_string(),
                });
                error_string(&e.to_string())
            }
            Err(_elapsed) => {
                self.gate.telemetry.publish(TelemetryEvent::SpanException {
                    span: SpanKind::Tool,
                    label: name.to_string(),
                    trace_id: trace.map(String::from),
                    duration_ms,
                    kind: "timeout".into(),
                    reason: format!("callback exceeded {:?}", self.config.callback_timeout),
                });
                error_string(&format!(
                    "callback {name} timed out after {:?}",
                    self.config.callback_timeout
                ))
            }
        }
    }
}

/// The next queued question, or pending forever when no ask channel exists
/// (or the asker is gone).
async fn next_ask(asks: &mut Option<mpsc::UnboundedReceiver<OperatorAsk>>) -> OperatorAsk {
    match asks {
        Some(rx) => match rx.recv().await {
            Some(ask) => ask,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn error_payload(e: &Error) -> String {
    error_string(&e.to_string())
}

fn error_string(reason: &str) -> String {
    serde_json::json!({ "error": reason }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use async_trait::async_trait;
    use beamlens_breaker::{BreakerConfig, CircuitBreaker};
    use beamlens_core::telemetry::TelemetryBus;
    use beamlens_core::{CallbackSpec, Severity, SkillError};
    use std::collections::BTreeMap;

    struct BeamSkill;

    #[async_trait]
    impl Skill for BeamSkill {
        fn id(&self) -> SkillId {
            SkillId::new("beam")
        }
        fn title(&self) -> &str {
            "BEAM runtime"
        }
        fn description(&self) -> &str {
            "Runtime memory and scheduler metrics"
        }
        fn system_prompt(&self) -> &str {
            "You observe the beam runtime domain."
        }
        fn snapshot(&self) -> MetricSnapshot {
            let mut metrics = BTreeMap::new();
            metrics.insert("memory_total".into(), 820.0);
            MetricSnapshot::new(self.id(), metrics)
        }
        fn callback_specs(&self) -> Vec<CallbackSpec> {
            vec![CallbackSpec {
                name: "get_memory".into(),
                description: "Memory breakdown".into(),
                parameters: serde_json::json!({ "type": "object", "properties": {} }),
            }]
        }
        async fn run_callback(
            &self,
            name: &str,
            _args: serde_json::Value,
        ) -> Result<serde_json::Value, SkillError> {
            match name {
                "get_memory" => Ok(serde_json::json!({ "rss_mb": 820 })),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(serde_json::json!(null))
                }
                other => Err(SkillError::UnknownCallback(other.to_string())),
            }
        }
    }

    fn operator(client: Arc<ScriptedClient>) -> Operator {
        let telemetry = Arc::new(TelemetryBus::new(256));
        let gate = LlmGate::new(
            client,
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), telemetry.clone())),
            telemetry,
            Duration::from_secs(60),
        );
        Operator::new(
            Arc::new(BeamSkill),
            gate,
            None,
            "node-a",
            OperatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn happy_path_produces_structured_notification() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call("take_snapshot", serde_json::json!({})),
            ScriptedClient::tool_call("run_callback", serde_json::json!({ "name": "get_memory" })),
            ScriptedClient::tool_call(
                "send_notification",
                serde_json::json!({
                    "anomaly_type": "memory_high",
                    "severity": "warning",
                    "context": "uptime 1h",
                    "observation": "rss=820MB",
                    "hypothesis": "cache growth"
                }),
            ),
            ScriptedClient::tool_call("finish", serde_json::json!({})),
        ]));

        let op = operator(client.clone());
        let run = op
            .run(
                RunContext::with_reason("check"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.finish, FinishReason::Finished);
        assert_eq!(run.iterations, 4);
        assert_eq!(run.notifications.len(), 1);

        let n = &run.notifications[0];
        assert_eq!(n.operator, SkillId::new("beam"));
        assert_eq!(n.anomaly_type, "memory_high");
        assert_eq!(n.severity, Severity::Warning);
        assert_eq!(n.context, "uptime 1h");
        assert_eq!(n.observation, "rss=820MB");
        assert_eq!(n.hypothesis.as_deref(), Some("cache growth"));
        assert_eq!(n.node, "node-a");
        // The snapshot taken earlier in the run rides along
        assert_eq!(n.snapshots.len(), 1);
        assert_eq!(client.call_count(), 4);
    }

    #[tokio::test]
    async fn max_iterations_is_a_bounded_outcome() {
        let responses: Vec<_> = (0..3)
            .map(|_| ScriptedClient::tool_call("take_snapshot", serde_json::json!({})))
            .collect();
        let client = Arc::new(ScriptedClient::new(responses));

        let telemetry = Arc::new(TelemetryBus::new(256));
        let mut events = telemetry.subscribe();
        let gate = LlmGate::new(
            client,
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), telemetry.clone())),
            telemetry,
            Duration::from_secs(60),
        );
        let op = Operator::new(
            Arc::new(BeamSkill),
            gate,
            None,
            "node-a",
            OperatorConfig {
                max_iterations: 3,
                ..OperatorConfig::default()
            },
        );

        let run = op
            .run(RunContext::with_reason("probe"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.finish, FinishReason::MaxIterations);
        assert_eq!(run.iterations, 3);

        let mut saw_cap = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event.as_ref(), TelemetryEvent::MaxIterationsReached { .. }) {
                saw_cap = true;
            }
        }
        assert!(saw_cap);
    }

    #[tokio::test]
    async fn schema_failure_is_retriable() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call("not_a_tool", serde_json::json!({})),
            ScriptedClient::tool_call("finish", serde_json::json!({})),
        ]));

        let run = operator(client.clone())
            .run(RunContext::with_reason("probe"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.finish, FinishReason::Finished);
        assert_eq!(run.iterations, 2);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn callback_failure_feeds_back_and_continues() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call("run_callback", serde_json::json!({ "name": "missing" })),
            ScriptedClient::tool_call("finish", serde_json::json!({})),
        ]));

        let run = operator(client)
            .run(RunContext::with_reason("probe"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.finish, FinishReason::Finished);
        assert!(run.notifications.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_callback_hits_the_deadline() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call("run_callback", serde_json::json!({ "name": "slow" })),
            ScriptedClient::tool_call("finish", serde_json::json!({})),
        ]));

        let run = operator(client)
            .run(RunContext::with_reason("probe"), CancellationToken::new())
            .await
            .unwrap();
        // The timeout became an error tool result; the loop carried on
        assert_eq!(run.finish, FinishReason::Finished);
    }

    #[tokio::test]
    async fn cancellation_observed_at_wait() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::tool_call(
            "wait",
            serde_json::json!({ "ms": 60_000 }),
        )]));

        let op = Arc::new(operator(client));
        let cancel = CancellationToken::new();
        let handle = {
            let op = op.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { op.run(RunContext::with_reason("probe"), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Run(RunError::Cancelled))));
    }

    #[tokio::test]
    async fn run_async_delivers_events() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call(
                "send_notification",
                serde_json::json!({
                    "anomaly_type": "gc_pressure",
                    "severity": "info",
                    "context": "ctx",
                    "observation": "gc=45/s"
                }),
            ),
            ScriptedClient::tool_call("finish", serde_json::json!({})),
        ]));

        let op = Arc::new(operator(client));
        let (tx, mut rx) = mpsc::unbounded_channel();
        op.run_async(
            RunContext::with_reason("probe"),
            tx,
            None,
            CancellationToken::new(),
        );

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            OperatorEvent::NotificationProduced { .. }
        ));
        let second = rx.recv().await.unwrap();
        match second {
            OperatorEvent::Complete { skill, result } => {
                assert_eq!(skill, SkillId::new("beam"));
                let run = result.unwrap();
                assert_eq!(run.notifications.len(), 1);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notifications_keep_production_order() {
        let report = |observation: &str| {
            ScriptedClient::tool_call(
                "send_notification",
                serde_json::json!({
                    "anomaly_type": "memory_high",
                    "severity": "warning",
                    "context": "ctx",
                    "observation": observation
                }),
            )
        };
        let client = Arc::new(ScriptedClient::new(vec![
            report("first"),
            report("second"),
            report("third"),
            ScriptedClient::tool_call("finish", serde_json::json!({})),
        ]));

        let run = operator(client)
            .run(RunContext::with_reason("probe"), CancellationToken::new())
            .await
            .unwrap();
        let observations: Vec<&str> = run
            .notifications
            .iter()
            .map(|n| n.observation.as_str())
            .collect();
        assert_eq!(observations, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn handle_message_answers_from_the_live_run() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call("take_snapshot", serde_json::json!({})),
            ScriptedClient::gated_tool_call(gate.clone(), "finish", serde_json::json!({})),
            ScriptedClient::text("rss is steady at 820MB"),
        ]));

        let op = Arc::new(operator(client.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = op.run_async(
            RunContext::with_reason("probe"),
            tx,
            None,
            CancellationToken::new(),
        );

        // Wait until the run is inside its gated second LLM call
        while client.call_count() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let reply = handle.message("how is memory?").await.unwrap();
        assert_eq!(reply, "rss is steady at 820MB");

        // The question was answered against the run's accumulated context:
        // the ask request carries the earlier snapshot tool result.
        let recorded = client.requests();
        let ask = &recorded[2];
        assert_eq!(ask.messages.last().unwrap().content, "how is memory?");
        assert!(ask
            .messages
            .iter()
            .any(|m| m.role == beamlens_core::Role::Tool));

        gate.notify_one();
        loop {
            if let OperatorEvent::Complete { result, .. } = rx.recv().await.unwrap() {
                assert!(result.is_ok());
                break;
            }
        }
    }

    #[tokio::test]
    async fn handle_message_after_finish_is_refused() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::tool_call(
            "finish",
            serde_json::json!({}),
        )]));
        let op = Arc::new(operator(client));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = op.run_async(
            RunContext::with_reason("probe"),
            tx,
            None,
            CancellationToken::new(),
        );

        loop {
            if let OperatorEvent::Complete { .. } = rx.recv().await.unwrap() {
                break;
            }
        }

        let err = handle.message("anyone home?").await.unwrap_err();
        assert!(matches!(err, Error::Run(RunError::NotFound(_))));
    }
}
