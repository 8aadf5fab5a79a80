//! The coordinator — a singleton actor correlating notifications into
//! insights.
//!
//! The coordinator owns its inbox, context, insights, and running-operator
//! table outright; callers interact only through its command mailbox. `run`
//! invocations that arrive while a run is in progress queue FIFO. Every run
//! has a deadline, a cancellation token that propagates to child operators
//! and the pending LLM call, and a monitored caller: if the reply channel
//! closes mid-run, the run is cancelled without a reply.
//!
//! Child operators run as detached tasks wrapped in `catch_unwind`; a
//! crashing operator surfaces as `coordinator.operator_crashed` telemetry
//! and a context note, never as a coordinator crash.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamlens_breaker::CircuitBreaker;
use beamlens_core::notification::generate_id;
use beamlens_core::telemetry::{SpanKind, TelemetryBus, TelemetryEvent};
use beamlens_core::{
    ChatRequest, ClientRegistry, Error, Insight, LlmClient, Message, Notification,
    NotificationEntry, NotificationStatus, RunError, SkillId, SkillRegistry,
};

use crate::context::{maybe_compact, CompactionPolicy, RunContext};
use crate::llm::LlmGate;
use crate::operator::{Operator, OperatorConfig, OperatorEvent, OperatorHandle, OperatorRun};
use crate::prompts;
use crate::tools::{self, CoordinatorTool};

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Origin node identifier stamped onto produced notifications.
    pub node: String,

    /// Default LLM iteration cap per run.
    pub max_iterations: u32,

    /// Default server-side deadline per run.
    pub deadline: Duration,

    /// Per-LLM-call timeout.
    pub llm_timeout: Duration,

    /// Pipeline gather poll interval.
    pub poll_interval: Duration,

    /// Default context compaction policy.
    pub compaction: CompactionPolicy,

    /// Configuration for child operators.
    pub operator: OperatorConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node: "local".into(),
            max_iterations: 25,
            deadline: Duration::from_secs(300),
            llm_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            compaction: CompactionPolicy::default(),
            operator: OperatorConfig::default(),
        }
    }
}

/// Which correlation strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Iterative tool-calling loop (can correct course mid-run).
    #[default]
    AgentLoop,
    /// Fixed classify/gather/synthesize pipeline (fewer LLM calls).
    Pipeline,
}

/// Per-invocation options.
#[derive(Default)]
pub struct RunOptions {
    /// Notifications seeded into the inbox.
    pub notifications: Vec<Notification>,

    /// Restrict which operators this run may invoke.
    pub skills: Option<Vec<SkillId>>,

    pub strategy: Strategy,

    /// Override the configured iteration cap.
    pub max_iterations: Option<u32>,

    /// Override the configured deadline.
    pub deadline: Option<Duration>,

    /// Override the LLM client for this run.
    pub client: Option<Arc<dyn LlmClient>>,

    pub compaction_max_tokens: Option<usize>,
    pub compaction_keep_last: Option<usize>,

    /// Caller-supplied correlation id; generated when absent.
    pub trace_id: Option<String>,
}

/// What one coordinator run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Insights in creation order.
    pub insights: Vec<Insight>,

    /// Results of every operator that completed during the run.
    pub operator_results: Vec<OperatorRun>,

    /// Final state of the inbox.
    pub notifications: Vec<NotificationEntry>,

    /// The accumulated context messages.
    pub context: Vec<Message>,

    /// Pipeline strategy's synthesized answer.
    pub answer: Option<String>,

    pub iterations: u32,
}

/// Whether the coordinator is between runs or inside one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    Idle,
    Running,
}

type ReplySender = oneshot::Sender<Result<RunOutcome, Error>>;

pub(crate) enum Command {
    Run {
        context: RunContext,
        opts: RunOptions,
        reply: ReplySender,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    ScheduledWake {
        reason: String,
    },
}

struct Invocation {
    context: RunContext,
    opts: RunOptions,
    reply: Option<ReplySender>,
}

/// A child operator the coordinator is monitoring: when it started, plus
/// the handle that routes out-of-band questions into its live run.
struct RunningOperator {
    started_at: DateTime<Utc>,
    handle: OperatorHandle,
}

/// Caller-side handle to the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// One-shot coordinator invocation. Queues FIFO when a run is already
    /// in progress.
    pub async fn run(&self, context: RunContext, opts: RunOptions) -> Result<RunOutcome, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Run {
                context,
                opts,
                reply,
            })
            .await
            .map_err(|_| Error::Run(RunError::WorkerCrashed("coordinator mailbox closed".into())))?;
        rx.await
            .map_err(|_| Error::Run(RunError::WorkerCrashed("coordinator reply dropped".into())))?
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| Error::Run(RunError::WorkerCrashed("coordinator mailbox closed".into())))?;
        rx.await
            .map_err(|_| Error::Run(RunError::WorkerCrashed("coordinator reply dropped".into())))
    }

    /// Cancel the in-progress run, if any. Returns whether one was running.
    pub async fn cancel(&self) -> Result<bool, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Cancel { reply })
            .await
            .map_err(|_| Error::Run(RunError::WorkerCrashed("coordinator mailbox closed".into())))?;
        rx.await
            .map_err(|_| Error::Run(RunError::WorkerCrashed("coordinator reply dropped".into())))
    }
}

/// The coordinator actor. Construct with [`Coordinator::new`], then call
/// [`Coordinator::spawn`].
pub struct Coordinator {
    pub(crate) skills: Arc<SkillRegistry>,
    pub(crate) clients: Arc<ClientRegistry>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) telemetry: Arc<TelemetryBus>,
    pub(crate) config: CoordinatorConfig,
    pub(crate) shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        skills: Arc<SkillRegistry>,
        clients: Arc<ClientRegistry>,
        breaker: Arc<CircuitBreaker>,
        telemetry: Arc<TelemetryBus>,
        config: CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            skills,
            clients,
            breaker,
            telemetry,
            config,
            shutdown,
        }
    }

    /// Start the actor; returns the handle and the worker's join handle.
    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = CoordinatorHandle { tx: tx.clone() };
        let join = tokio::spawn(self.worker(rx, tx));
        (handle, join)
    }

    async fn worker(self, mut rx: mpsc::Receiver<Command>, self_tx: mpsc::Sender<Command>) {
        let mut queue: VecDeque<Invocation> = VecDeque::new();
        loop {
            if queue.is_empty() {
                let cmd = tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => return,
                    },
                };
                self.handle_idle_command(cmd, &mut queue);
            }

            while let Some(invocation) = queue.pop_front() {
                if self.shutdown.is_cancelled() {
                    if let Some(reply) = invocation.reply {
                        let _ = reply.send(Err(Error::Run(RunError::Cancelled)));
                    }
                    continue;
                }
                self.execute(invocation, &mut rx, &mut queue, &self_tx).await;
            }
        }
    }

    fn handle_idle_command(&self, cmd: Command, queue: &mut VecDeque<Invocation>) {
        match cmd {
            Command::Run {
                context,
                opts,
                reply,
            } => queue.push_back(Invocation {
                context,
                opts,
                reply: Some(reply),
            }),
            Command::ScheduledWake { reason } => {
                debug!(reason = %reason, "Scheduled reinvocation");
                queue.push_back(Invocation {
                    context: RunContext::with_reason(reason),
                    opts: RunOptions::default(),
                    reply: None,
                });
            }
            Command::Status { reply } => {
                let _ = reply.send(CoordinatorStatus::Idle);
            }
            Command::Cancel { reply } => {
                let _ = reply.send(false);
            }
        }
    }

    /// Drive one run while staying responsive to the mailbox, the deadline,
    /// and the caller going away.
    async fn execute(
        &self,
        invocation: Invocation,
        rx: &mut mpsc::Receiver<Command>,
        queue: &mut VecDeque<Invocation>,
        self_tx: &mpsc::Sender<Command>,
    ) {
        let Invocation {
            context,
            opts,
            mut reply,
        } = invocation;
        let deadline = opts.deadline.unwrap_or(self.config.deadline);
        let run_cancel = self.shutdown.child_token();

        let mut run_fut: Pin<Box<dyn Future<Output = Result<RunOutcome, Error>> + Send + '_>> =
            match opts.strategy {
                Strategy::AgentLoop => Box::pin(self.run_agent_loop(
                    context,
                    &opts,
                    run_cancel.clone(),
                    self_tx.clone(),
                )),
                Strategy::Pipeline => {
                    Box::pin(self.run_pipeline(context, &opts, run_cancel.clone()))
                }
            };
        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                result = &mut run_fut => {
                    if let Some(r) = reply.take() {
                        let _ = r.send(result);
                    }
                    return;
                }

                _ = &mut timer => {
                    warn!("Coordinator run deadline expired, cancelling");
                    run_cancel.cancel();
                    let _ = (&mut run_fut).await;
                    if let Some(r) = reply.take() {
                        let _ = r.send(Err(Error::Run(RunError::DeadlineExceeded)));
                    }
                    return;
                }

                _ = caller_closed(reply.as_mut()) => {
                    debug!("Caller went away mid-run, cancelling");
                    run_cancel.cancel();
                    let _ = (&mut run_fut).await;
                    return;
                }

                cmd = rx.recv() => match cmd {
                    Some(Command::Status { reply }) => {
                        let _ = reply.send(CoordinatorStatus::Running);
                    }
                    Some(Command::Cancel { reply: confirm }) => {
                        run_cancel.cancel();
                        let _ = (&mut run_fut).await;
                        if let Some(r) = reply.take() {
                            let _ = r.send(Err(Error::Run(RunError::Cancelled)));
                        }
                        let _ = confirm.send(true);
                        return;
                    }
                    Some(Command::Run { context, opts, reply }) => queue.push_back(Invocation {
                        context,
                        opts,
                        reply: Some(reply),
                    }),
                    Some(Command::ScheduledWake { reason }) => queue.push_back(Invocation {
                        context: RunContext::with_reason(reason),
                        opts: RunOptions::default(),
                        reply: None,
                    }),
                    None => {
                        run_cancel.cancel();
                        let _ = (&mut run_fut).await;
                        return;
                    }
                }
            }
        }
    }

    pub(crate) fn gate_for(&self, opts: &RunOptions) -> Result<LlmGate, Error> {
        let client = match &opts.client {
            Some(client) => client.clone(),
            None => self.clients.primary()?,
        };
        Ok(LlmGate::new(
            client,
            self.breaker.clone(),
            self.telemetry.clone(),
            self.config.llm_timeout,
        ))
    }

    async fn run_agent_loop(
        &self,
        context: RunContext,
        opts: &RunOptions,
        cancel: CancellationToken,
        self_tx: mpsc::Sender<Command>,
    ) -> Result<RunOutcome, Error> {
        let trace_id = opts.trace_id.clone().unwrap_or_else(generate_id);
        let gate = self.gate_for(opts)?;
        let policy = CompactionPolicy {
            max_tokens: opts
                .compaction_max_tokens
                .unwrap_or(self.config.compaction.max_tokens),
            keep_last: opts
                .compaction_keep_last
                .unwrap_or(self.config.compaction.keep_last),
        };
        let max_iterations = opts.max_iterations.unwrap_or(self.config.max_iterations);
        let children = cancel.child_token();

        let mut inbox: Vec<NotificationEntry> = opts
            .notifications
            .iter()
            .cloned()
            .map(NotificationEntry::new)
            .collect();
        let mut insights: Vec<Insight> = Vec::new();
        let mut operator_results: Vec<OperatorRun> = Vec::new();
        let mut running: BTreeMap<SkillId, RunningOperator> = BTreeMap::new();
        let (op_tx, mut op_rx) = mpsc::unbounded_channel::<OperatorEvent>();
        let mut messages = vec![Message::user(initial_message(&context, &inbox))];
        let mut iteration = 0u32;
        let mut scheduled: Option<(u64, String)> = None;

        info!(trace_id = %trace_id, seeded = inbox.len(), "Coordinator run starting");

        'run: loop {
            // Merge any operator events that arrived since the last turn
            while let Ok(event) = op_rx.try_recv() {
                self.absorb(event, &mut running, &mut operator_results, &mut inbox, &mut messages, &trace_id);
            }

            if cancel.is_cancelled() {
                children.cancel();
                return Err(Error::Run(RunError::Cancelled));
            }

            if iteration >= max_iterations {
                self.telemetry.publish(TelemetryEvent::MaxIterationsReached {
                    scope: "coordinator".into(),
                    iterations: iteration,
                    trace_id: Some(trace_id.clone()),
                });
                // Keep waiting for stragglers, but stop calling the LLM
                while !running.is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            children.cancel();
                            return Err(Error::Run(RunError::Cancelled));
                        }
                        event = op_rx.recv() => match event {
                            Some(event) => self.absorb(event, &mut running, &mut operator_results, &mut inbox, &mut messages, &trace_id),
                            None => break,
                        }
                    }
                }
                if inbox
                    .iter()
                    .any(|e| e.status == NotificationStatus::Unread)
                {
                    messages.push(Message::system(
                        "Warning: iteration cap reached with unread notifications remaining",
                    ));
                }
                break 'run;
            }
            iteration += 1;
            self.telemetry
                .publish(TelemetryEvent::CoordinatorIterationStart {
                    iteration,
                    trace_id: Some(trace_id.clone()),
                });

            match maybe_compact(&mut messages, &policy, &gate, Some(&trace_id), &cancel).await {
                Ok(_) => {}
                Err(Error::Run(RunError::Cancelled)) => {
                    children.cancel();
                    return Err(Error::Run(RunError::Cancelled));
                }
                Err(e) => warn!(error = %e, "Compaction failed, continuing uncompacted"),
            }

            let request = ChatRequest::new(prompts::COORDINATOR_SYSTEM, messages.clone())
                .with_tools(CoordinatorTool::definitions());
            let response = match gate
                .complete(SpanKind::Llm, "coordinator", request, Some(&trace_id), &cancel)
                .await
            {
                Ok(response) => response,
                Err(Error::Run(RunError::Cancelled)) => {
                    children.cancel();
                    return Err(Error::Run(RunError::Cancelled));
                }
                Err(e) => {
                    self.telemetry.publish(TelemetryEvent::CoordinatorLlmError {
                        reason: e.to_string(),
                        trace_id: Some(trace_id.clone()),
                    });
                    children.cancel();
                    return Err(e);
                }
            };

            let parsed = tools::single_call(&response)
                .map(|call| (call.id.clone(), CoordinatorTool::parse(call)));
            messages.push(response.message.clone());
            let (call_id, tool) = match parsed {
                Ok((id, Ok(tool))) => (id, tool),
                Ok((id, Err(e))) => {
                    messages.push(Message::tool_result(id, error_string(&e.to_string())));
                    continue;
                }
                Err(e) => {
                    messages.push(Message::user(error_string(&e.to_string())));
                    continue;
                }
            };

            // Completions that raced the LLM call count before tool policy
            // (done/schedule must see the true running set)
            while let Ok(event) = op_rx.try_recv() {
                self.absorb(event, &mut running, &mut operator_results, &mut inbox, &mut messages, &trace_id);
            }

            let step = match tool {
                CoordinatorTool::GetNotifications { status } => {
                    let view: Vec<serde_json::Value> = inbox
                        .iter()
                        .filter(|e| status.map_or(true, |s| e.status == s))
                        .map(|e| {
                            serde_json::json!({
                                "id": e.notification.id,
                                "operator": e.notification.operator,
                                "anomaly_type": e.notification.anomaly_type,
                                "severity": e.notification.severity,
                                "status": e.status,
                                "observation": e.notification.observation,
                                "hypothesis": e.notification.hypothesis,
                            })
                        })
                        .collect();
                    Step::Continue(serde_json::json!(view).to_string())
                }

                CoordinatorTool::UpdateNotificationStatuses { ids, status, reason } => {
                    let mut updated = 0usize;
                    for id in &ids {
                        // Missing ids are silently skipped
                        if let Some(entry) =
                            inbox.iter_mut().find(|e| &e.notification.id == id)
                        {
                            if entry.advance_to(status) {
                                updated += 1;
                            }
                        }
                    }
                    if let Some(reason) = reason {
                        debug!(reason = %reason, updated, "Notification statuses updated");
                    }
                    Step::Continue(format!("{{\"updated\": {updated}}}"))
                }

                CoordinatorTool::ProduceInsight(args) => {
                    let known: HashSet<&str> =
                        inbox.iter().map(|e| e.notification.id.as_str()).collect();
                    let missing: Vec<&String> = args
                        .notification_ids
                        .iter()
                        .filter(|id| !known.contains(id.as_str()))
                        .collect();
                    if !missing.is_empty() {
                        Step::Continue(error_string(&format!(
                            "unknown notification ids: {missing:?}"
                        )))
                    } else {
                        let mut insight = Insight::new(
                            args.notification_ids.clone(),
                            args.correlation_type,
                            args.summary,
                            args.matched_observations,
                            args.hypothesis_grounded,
                            args.confidence,
                        );
                        if let Some(rc) = args.root_cause_hypothesis {
                            insight = insight.with_root_cause(rc);
                        }
                        for entry in inbox.iter_mut() {
                            if args.notification_ids.contains(&entry.notification.id) {
                                entry.advance_to(NotificationStatus::Resolved);
                            }
                        }
                        self.telemetry.publish(TelemetryEvent::InsightProduced {
                            insight_id: insight.id.clone(),
                            notification_ids: insight.notification_ids.clone(),
                            trace_id: Some(trace_id.clone()),
                        });
                        let payload =
                            format!("{{\"ok\": true, \"insight_id\": \"{}\"}}", insight.id);
                        insights.push(insight);
                        Step::Continue(payload)
                    }
                }

                CoordinatorTool::Think { thought } => {
                    debug!(thought = %thought, "Coordinator thinking");
                    Step::Continue("{\"ok\": true}".into())
                }

                CoordinatorTool::InvokeOperators { skills, context: op_context } => {
                    let mut started: Vec<String> = Vec::new();
                    let mut errors: Vec<String> = Vec::new();
                    let mut seen: HashSet<String> = HashSet::new();

                    for name in skills {
                        if !seen.insert(name.clone()) {
                            continue;
                        }
                        let skill_id = SkillId::new(&name);
                        if running.contains_key(&skill_id) {
                            errors.push(format!("operator {name} already running"));
                            continue;
                        }
                        if let Some(allowed) = &opts.skills {
                            if !allowed.contains(&skill_id) {
                                errors.push(format!("skill {name} not available for this run"));
                                continue;
                            }
                        }
                        match self.skills.get(&skill_id) {
                            Some(skill) => {
                                let operator = Arc::new(Operator::new(
                                    skill,
                                    gate.clone(),
                                    None,
                                    self.config.node.clone(),
                                    self.config.operator.clone(),
                                ));
                                let handle = operator.run_async(
                                    RunContext::with_reason(op_context.clone()),
                                    op_tx.clone(),
                                    Some(trace_id.clone()),
                                    children.child_token(),
                                );
                                running.insert(
                                    skill_id,
                                    RunningOperator {
                                        started_at: Utc::now(),
                                        handle,
                                    },
                                );
                                started.push(name);
                            }
                            None => errors.push(format!("unknown skill: {name}")),
                        }
                    }
                    Step::Continue(
                        serde_json::json!({ "started": started, "errors": errors }).to_string(),
                    )
                }

                CoordinatorTool::MessageOperator { skill, message } => {
                    let skill_id = SkillId::new(&skill);
                    match running.get(&skill_id) {
                        None => Step::Continue(error_string(&format!(
                            "operator {skill} is not running"
                        ))),
                        Some(entry) => {
                            // The question goes into the live run and is
                            // answered against its accumulated context.
                            // Errors (including timeout) surface as tool
                            // results, not tool failures.
                            let payload = match tokio::time::timeout(
                                Duration::from_secs(30),
                                entry.handle.message(&message),
                            )
                            .await
                            {
                                Ok(Ok(reply)) => {
                                    serde_json::json!({ "reply": reply }).to_string()
                                }
                                Ok(Err(e)) => error_string(&e.to_string()),
                                Err(_) => error_string("operator message timed out"),
                            };
                            Step::Continue(payload)
                        }
                    }
                }

                CoordinatorTool::GetOperatorStatuses => {
                    let view: Vec<serde_json::Value> = running
                        .iter()
                        .map(|(skill, entry)| {
                            serde_json::json!({
                                "skill": skill,
                                "status": "running",
                                "started_at": entry.started_at,
                            })
                        })
                        .collect();
                    Step::Continue(serde_json::json!(view).to_string())
                }

                CoordinatorTool::Schedule { ms, reason } => {
                    if !running.is_empty() {
                        self.telemetry.publish(TelemetryEvent::ScheduleRejected {
                            running: running.len(),
                            trace_id: Some(trace_id.clone()),
                        });
                        Step::Continue(error_string(&format!(
                            "{} operators still running",
                            running.len()
                        )))
                    } else {
                        scheduled = Some((ms, reason));
                        Step::Finish(format!("{{\"scheduled_ms\": {ms}}}"))
                    }
                }

                CoordinatorTool::Wait { ms } => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            children.cancel();
                            return Err(Error::Run(RunError::Cancelled));
                        }
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    }
                    Step::Continue(format!("{{\"waited_ms\": {ms}}}"))
                }

                CoordinatorTool::Done => {
                    if !running.is_empty() {
                        self.telemetry.publish(TelemetryEvent::DoneRejected {
                            running: running.len(),
                            trace_id: Some(trace_id.clone()),
                        });
                        Step::Continue(error_string(&format!(
                            "{} operators still running",
                            running.len()
                        )))
                    } else {
                        self.telemetry.publish(TelemetryEvent::CoordinatorDone {
                            iterations: iteration,
                            insights: insights.len(),
                            trace_id: Some(trace_id.clone()),
                        });
                        Step::Finish("{\"ok\": true}".into())
                    }
                }
            };

            match step {
                Step::Continue(payload) => messages.push(Message::tool_result(call_id, payload)),
                Step::Finish(payload) => {
                    messages.push(Message::tool_result(call_id, payload));
                    break 'run;
                }
            }
        }

        if let Some((ms, reason)) = scheduled {
            let tx = self_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = tx.send(Command::ScheduledWake { reason }).await;
            });
        }

        info!(
            trace_id = %trace_id,
            iterations = iteration,
            insights = insights.len(),
            "Coordinator run finished"
        );
        Ok(RunOutcome {
            insights,
            operator_results,
            notifications: inbox,
            context: messages,
            answer: None,
            iterations: iteration,
        })
    }

    /// Fold one operator event into the run state.
    fn absorb(
        &self,
        event: OperatorEvent,
        running: &mut BTreeMap<SkillId, RunningOperator>,
        operator_results: &mut Vec<OperatorRun>,
        inbox: &mut Vec<NotificationEntry>,
        messages: &mut Vec<Message>,
        trace_id: &str,
    ) {
        match event {
            OperatorEvent::NotificationProduced { skill, notification } => {
                messages.push(Message::user(format!(
                    "Operator {skill} reported {} ({}): {}",
                    notification.anomaly_type, notification.id, notification.observation
                )));
                inbox.push(NotificationEntry::new(notification));
            }
            OperatorEvent::Complete { skill, result } => {
                running.remove(&skill);
                match result {
                    Ok(run) => {
                        self.telemetry.publish(TelemetryEvent::OperatorComplete {
                            skill: skill.clone(),
                            notifications: run.notifications.len(),
                            trace_id: Some(trace_id.to_string()),
                        });
                        messages.push(Message::user(format!(
                            "Operator {skill} completed with {} notifications after {} iterations",
                            run.notifications.len(),
                            run.iterations
                        )));
                        operator_results.push(run);
                    }
                    Err(e) => {
                        self.telemetry.publish(TelemetryEvent::OperatorCrashed {
                            skill: skill.clone(),
                            reason: e.to_string(),
                            trace_id: Some(trace_id.to_string()),
                        });
                        messages.push(Message::user(format!("Operator {skill} failed: {e}")));
                    }
                }
            }
        }
    }
}

enum Step {
    Continue(String),
    Finish(String),
}

fn initial_message(context: &RunContext, inbox: &[NotificationEntry]) -> String {
    let mut text = context.render();
    if !inbox.is_empty() {
        text.push_str(&format!(
            "\n{} notifications are pending review.",
            inbox.len()
        ));
    }
    text
}

fn error_string(reason: &str) -> String {
    serde_json::json!({ "error": reason }).to_string()
}

async fn caller_closed(reply: Option<&mut ReplySender>) {
    match reply {
        Some(reply) => reply.closed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RoutedClient, ScriptedClient};
    use async_trait::async_trait;
    use beamlens_breaker::BreakerConfig;
    use beamlens_core::{CallbackSpec, MetricSnapshot, Severity, Skill, SkillError};
    use std::collections::BTreeMap as StdBTreeMap;

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
            "Runtime metrics"
        }
        fn system_prompt(&self) -> &str {
            "You observe the beam runtime domain."
        }
        fn snapshot(&self) -> MetricSnapshot {
            MetricSnapshot::new(self.id(), StdBTreeMap::new())
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
                other => Err(SkillError::UnknownCallback(other.to_string())),
            }
        }
    }

    fn spawn_coordinator(
        client: Arc<dyn LlmClient>,
    ) -> (CoordinatorHandle, Arc<TelemetryBus>) {
        let telemetry = Arc::new(TelemetryBus::new(1024));
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default(),
            telemetry.clone(),
        ));
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(BeamSkill));

        let coordinator = Coordinator::new(
            Arc::new(registry),
            Arc::new(ClientRegistry::single(client)),
            breaker,
            telemetry.clone(),
            CoordinatorConfig {
                node: "node-a".into(),
                ..CoordinatorConfig::default()
            },
            CancellationToken::new(),
        );
        let (handle, _join) = coordinator.spawn();
        (handle, telemetry)
    }

    fn seeded(id: &str, anomaly_type: &str, observation: &str) -> Notification {
        let mut n = Notification::new(
            SkillId::new("beam"),
            anomaly_type,
            Severity::Warning,
            "ctx",
            observation,
            "node-a",
        );
        n.id = id.to_string();
        n
    }

    #[tokio::test]
    async fn resolves_correlated_notifications_into_an_insight() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call("get_notifications", serde_json::json!({})),
            ScriptedClient::tool_call(
                "produce_insight",
                serde_json::json!({
                    "notification_ids": ["n1", "n2"],
                    "correlation_type": "causal",
                    "summary": "GC pressure driven by memory growth",
                    "matched_observations": ["rss=820MB", "gc=45/s"],
                    "hypothesis_grounded": true,
                    "confidence": "high"
                }),
            ),
            ScriptedClient::tool_call("done", serde_json::json!({})),
        ]));
        let (handle, _telemetry) = spawn_coordinator(client);

        let opts = RunOptions {
            notifications: vec![
                seeded("n1", "memory_high", "rss=820MB"),
                seeded("n2", "gc_pressure", "gc=45/s"),
            ],
            ..RunOptions::default()
        };
        let outcome = handle
            .run(RunContext::with_reason("correlate"), opts)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.insights.len(), 1);
        let insight = &outcome.insights[0];
        assert_eq!(insight.notification_ids, vec!["n1", "n2"]);
        assert_eq!(
            insight.correlation_type,
            beamlens_core::CorrelationType::Causal
        );
        assert_eq!(insight.summary, "GC pressure driven by memory growth");
        assert_eq!(insight.matched_observations, vec!["rss=820MB", "gc=45/s"]);
        assert!(insight.hypothesis_grounded);
        assert_eq!(insight.confidence, beamlens_core::Confidence::High);

        for entry in &outcome.notifications {
            assert_eq!(entry.status, NotificationStatus::Resolved);
        }
    }

    #[tokio::test]
    async fn insight_citing_unknown_ids_is_refused() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call(
                "produce_insight",
                serde_json::json!({
                    "notification_ids": ["ghost"],
                    "correlation_type": "temporal",
                    "summary": "phantom",
                    "confidence": "low"
                }),
            ),
            ScriptedClient::tool_call("done", serde_json::json!({})),
        ]));
        let (handle, _telemetry) = spawn_coordinator(client);

        let opts = RunOptions {
            notifications: vec![seeded("n1", "memory_high", "rss=820MB")],
            ..RunOptions::default()
        };
        let outcome = handle
            .run(RunContext::with_reason("correlate"), opts)
            .await
            .unwrap();

        assert!(outcome.insights.is_empty());
        assert!(outcome
            .context
            .iter()
            .any(|m| m.content.contains("unknown notification ids")));
        assert_eq!(outcome.notifications[0].status, NotificationStatus::Unread);
    }

    #[tokio::test]
    async fn done_is_rejected_while_operators_run() {
        let op_gate = Arc::new(tokio::sync::Notify::new());
        let done_gate = Arc::new(tokio::sync::Notify::new());

        let coordinator_script = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call(
                "invoke_operators",
                serde_json::json!({ "skills": ["beam"], "context": "dig into memory" }),
            ),
            ScriptedClient::tool_call("done", serde_json::json!({})),
            ScriptedClient::gated_tool_call(done_gate.clone(), "done", serde_json::json!({})),
        ]));
        let operator_script = Arc::new(ScriptedClient::new(vec![ScriptedClient::gated_tool_call(
            op_gate.clone(),
            "finish",
            serde_json::json!({}),
        )]));
        let client = Arc::new(
            RoutedClient::new()
                .route("coordinator", coordinator_script)
                .route("beam runtime domain", operator_script),
        );

        let (handle, telemetry) = spawn_coordinator(client);
        let mut events = telemetry.subscribe();

        // Release the operator once done has been rejected; release the
        // final done once the operator's run span has closed.
        let watcher = tokio::spawn(async move {
            let mut saw_rejection = false;
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(_) => break,
                };
                match event.as_ref() {
                    TelemetryEvent::DoneRejected { .. } => {
                        saw_rejection = true;
                        op_gate.notify_one();
                    }
                    TelemetryEvent::SpanStop { span: SpanKind::Agent, .. } => {
                        done_gate.notify_one();
                        break;
                    }
                    _ => {}
                }
            }
            saw_rejection
        });

        let outcome = handle
            .run(RunContext::with_reason("probe"), RunOptions::default())
            .await
            .unwrap();

        assert!(watcher.await.unwrap(), "done_rejected telemetry expected");
        assert_eq!(outcome.iterations, 3);
        assert!(outcome
            .context
            .iter()
            .any(|m| m.content.contains("still running")));
        assert_eq!(outcome.operator_results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_the_run_and_returns_to_idle() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::hang(),
            ScriptedClient::tool_call("done", serde_json::json!({})),
        ]));
        let (handle, _telemetry) = spawn_coordinator(client);

        let opts = RunOptions {
            deadline: Some(Duration::from_millis(100)),
            ..RunOptions::default()
        };
        let err = handle
            .run(RunContext::with_reason("stuck"), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Run(RunError::DeadlineExceeded)));

        assert_eq!(handle.status().await.unwrap(), CoordinatorStatus::Idle);

        // A subsequent invocation succeeds
        let outcome = handle
            .run(RunContext::with_reason("retry"), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn queued_invocations_run_in_order() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call("done", serde_json::json!({})),
            ScriptedClient::tool_call("done", serde_json::json!({})),
        ]));
        let (handle, _telemetry) = spawn_coordinator(client);

        let first = handle.run(RunContext::with_reason("one"), RunOptions::default());
        let second = handle.run(RunContext::with_reason("two"), RunOptions::default());
        let (a, b) = tokio::join!(first, second);
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_finishes_and_reinvokes() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call(
                "schedule",
                serde_json::json!({ "ms": 10, "reason": "check back" }),
            ),
            ScriptedClient::tool_call("done", serde_json::json!({})),
        ]));
        let scripted = client.clone();
        let (handle, _telemetry) = spawn_coordinator(client);

        let outcome = handle
            .run(RunContext::with_reason("first"), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 1);

        // The scheduled wake fires and consumes the second scripted reply
        for _ in 0..100 {
            if scripted.call_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(scripted.call_count(), 2);
        assert_eq!(handle.status().await.unwrap(), CoordinatorStatus::Idle);
    }

    #[tokio::test]
    async fn statuses_and_messages_reach_the_live_operator_run() {
        let ask_gate = Arc::new(tokio::sync::Notify::new());
        let finish_gate = Arc::new(tokio::sync::Notify::new());
        let done_gate = Arc::new(tokio::sync::Notify::new());

        // message_operator is held back until the operator's first tool
        // round has completed, so the question provably lands in a run that
        // has already accumulated context.
        let coordinator_script = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call(
                "invoke_operators",
                serde_json::json!({ "skills": ["beam"], "context": "dig" }),
            ),
            ScriptedClient::tool_call("get_operator_statuses", serde_json::json!({})),
            ScriptedClient::gated_tool_call(
                ask_gate.clone(),
                "message_operator",
                serde_json::json!({ "skill": "beam", "message": "how is memory?" }),
            ),
            ScriptedClient::gated_tool_call(done_gate.clone(), "done", serde_json::json!({})),
        ]));
        // Pop order: the callback turn, the gated second turn, then the
        // answer to the out-of-band question.
        let operator_script = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call(
                "run_callback",
                serde_json::json!({ "name": "get_memory" }),
            ),
            ScriptedClient::gated_tool_call(finish_gate.clone(), "finish", serde_json::json!({})),
            ScriptedClient::text("rss is stable at 400MB"),
        ]));
        let script_probe = operator_script.clone();
        let client = Arc::new(
            RoutedClient::new()
                .route("coordinator", coordinator_script)
                .route("beam runtime domain", operator_script),
        );

        let (handle, telemetry) = spawn_coordinator(client);
        let mut events = telemetry.subscribe();

        // Gate releases keyed off telemetry: the callback's tool span means
        // the run has context (ask may go out); the second operator llm
        // span closing is the answered question (finish may resolve); the
        // agent span closing means done can be accepted.
        let watcher = tokio::spawn(async move {
            let mut operator_llm_stops = 0;
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(_) => break,
                };
                match event.as_ref() {
                    TelemetryEvent::SpanStop { span: SpanKind::Tool, label, .. }
                        if label == "get_memory" =>
                    {
                        ask_gate.notify_one();
                    }
                    TelemetryEvent::SpanStop { span: SpanKind::Llm, label, .. }
                        if label == "operator:beam" =>
                    {
                        operator_llm_stops += 1;
                        if operator_llm_stops == 2 {
                            finish_gate.notify_one();
                        }
                    }
                    TelemetryEvent::SpanStop { span: SpanKind::Agent, .. } => {
                        done_gate.notify_one();
                        break;
                    }
                    _ => {}
                }
            }
        });

        let outcome = handle
            .run(RunContext::with_reason("probe"), RunOptions::default())
            .await
            .unwrap();
        watcher.await.unwrap();

        assert_eq!(outcome.iterations, 4);
        assert!(outcome
            .context
            .iter()
            .any(|m| m.content.contains("\"status\":\"running\"")));
        assert!(outcome
            .context
            .iter()
            .any(|m| m.content.contains("rss is stable at 400MB")));
        assert_eq!(outcome.operator_results.len(), 1);

        // The answer was produced inside the running operator, against its
        // accumulated context: the ask request ends with the question and
        // carries the earlier callback result.
        let recorded = script_probe.requests();
        assert_eq!(recorded.len(), 3);
        let ask = &recorded[2];
        assert_eq!(ask.messages.last().unwrap().content, "how is memory?");
        assert!(ask
            .messages
            .iter()
            .any(|m| m.role == beamlens_core::Role::Tool && m.content.contains("rss_mb")));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_pauses_then_resumes_the_loop() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call("wait", serde_json::json!({ "ms": 1_000 })),
            ScriptedClient::tool_call("done", serde_json::json!({})),
        ]));
        let (handle, _telemetry) = spawn_coordinator(client);

        let outcome = handle
            .run(RunContext::with_reason("pause"), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.iterations, 2);
        assert!(outcome
            .context
            .iter()
            .any(|m| m.content.contains("\"waited_ms\": 1000")));
    }

    #[tokio::test]
    async fn messaging_an_idle_operator_is_a_tool_error_result() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call(
                "message_operator",
                serde_json::json!({ "skill": "beam", "message": "anyone home?" }),
            ),
            ScriptedClient::tool_call("done", serde_json::json!({})),
        ]));
        let (handle, _telemetry) = spawn_coordinator(client);

        let outcome = handle
            .run(RunContext::with_reason("probe"), RunOptions::default())
            .await
            .unwrap();
        assert!(outcome
            .context
            .iter()
            .any(|m| m.content.contains("is not running")));
    }

    #[tokio::test]
    async fn invoking_unknown_skill_surfaces_in_tool_result() {
        let client = Arc::new(ScriptedClient::new(vec![
            ScriptedClient::tool_call(
                "invoke_operators",
                serde_json::json!({ "skills": ["nonexistent"], "context": "dig" }),
            ),
            ScriptedClient::tool_call("done", serde_json::json!({})),
        ]));
        let (handle, _telemetry) = spawn_coordinator(client);

        let outcome = handle
            .run(RunContext::with_reason("probe"), RunOptions::default())
            .await
            .unwrap();
        assert!(outcome
            .context
            .iter()
            .any(|m| m.content.contains("unknown skill: nonexistent")));
    }
}
