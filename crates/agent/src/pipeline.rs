//! The pipeline coordinator strategy — classify, gather, synthesize.
//!
//! Three fixed stages instead of the iterative loop: one LLM call picks
//! skills, the gathered operators run to completion, one LLM call
//! synthesizes the answer. Strictly fewer LLM calls than the AgentLoop
//! strategy, but no ability to correct a wrong classification mid-run.

use std::collections::HashSet;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use beamlens_core::notification::generate_id;
use beamlens_core::telemetry::{SpanKind, TelemetryEvent};
use beamlens_core::{
    ChatRequest, Confidence, CorrelationType, Error, Insight, Message, Notification,
    NotificationEntry, NotificationStatus, RunError, SkillId,
};

use crate::context::RunContext;
use crate::coordinator::{Coordinator, RunOptions, RunOutcome};
use crate::llm::LlmGate;
use crate::operator::{Operator, OperatorEvent};
use crate::prompts;
use crate::tools::{parse_json_payload, PipelineClassification, PipelineSynthesis};

impl Coordinator {
    pub(crate) async fn run_pipeline(
        &self,
        context: RunContext,
        opts: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, Error> {
        let trace_id = opts.trace_id.clone().unwrap_or_else(generate_id);
        let gate = self.gate_for(opts)?;
        let children = cancel.child_token();
        let mut iterations = 0u32;
        let mut messages = vec![Message::user(context.render())];

        // ── Stage 1: classify ─────────────────────────────────────────
        let skill_list: String = self
            .skills
            .iter()
            .filter(|s| {
                opts.skills
                    .as_ref()
                    .map_or(true, |allowed| allowed.contains(&s.id()))
            })
            .map(|s| format!("- {}: {}", s.id(), s.description()))
            .collect::<Vec<_>>()
            .join("\n");
        let classify_user = format!(
            "{}\n\nAvailable skills:\n{}",
            context.render(),
            skill_list
        );

        let classification = self
            .classify(&gate, &classify_user, &trace_id, &cancel, &mut iterations)
            .await?;
        messages.push(Message::system(format!(
            "Classified as {:?}; consulting skills {:?}",
            classification.intent, classification.skills
        )));

        // ── Stage 2: gather ───────────────────────────────────────────
        let (op_tx, mut op_rx) = mpsc::unbounded_channel::<OperatorEvent>();
        let mut running: HashSet<SkillId> = HashSet::new();

        for name in &classification.skills {
            let skill_id = SkillId::new(name);
            if running.contains(&skill_id) {
                continue;
            }
            if let Some(allowed) = &opts.skills {
                if !allowed.contains(&skill_id) {
                    warn!(skill = %name, "Classified skill not available for this run");
                    continue;
                }
            }
            match self.skills.get(&skill_id) {
                Some(skill) => {
                    running.insert(skill_id);
                    let operator = Arc::new(Operator::new(
                        skill,
                        gate.clone(),
                        None,
                        self.config.node.clone(),
                        self.config.operator.clone(),
                    ));
                    operator.run_async(
                        RunContext::with_reason(classification.operator_context.clone()),
                        op_tx.clone(),
                        Some(trace_id.clone()),
                        children.child_token(),
                    );
                }
                None => warn!(skill = %name, "Classify stage selected an unknown skill"),
            }
        }
        drop(op_tx);

        let mut operator_results = Vec::new();
        let mut gathered: Vec<Notification> = Vec::new();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        while !running.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    children.cancel();
                    return Err(Error::Run(RunError::Cancelled));
                }
                _ = poll.tick() => {
                    debug!(remaining = running.len(), "Pipeline gathering");
                }
                event = op_rx.recv() => match event {
                    Some(OperatorEvent::NotificationProduced { notification, .. }) => {
                        gathered.push(notification);
                    }
                    Some(OperatorEvent::Complete { skill, result }) => {
                        running.remove(&skill);
                        match result {
                            Ok(run) => {
                                self.telemetry.publish(TelemetryEvent::OperatorComplete {
                                    skill,
                                    notifications: run.notifications.len(),
                                    trace_id: Some(trace_id.clone()),
                                });
                                operator_results.push(run);
                            }
                            Err(e) => {
                                self.telemetry.publish(TelemetryEvent::OperatorCrashed {
                                    skill,
                                    reason: e.to_string(),
                                    trace_id: Some(trace_id.clone()),
                                });
                            }
                        }
                    }
                    None => break,
                }
            }
        }

        // ── Stage 3: synthesize ───────────────────────────────────────
        let data = serde_json::to_string(&gathered)?;
        let synth_user = format!(
            "Query:\n{}\n\nOperator data:\n{}",
            context.render(),
            data
        );
        let request = ChatRequest::new(
            prompts::PIPELINE_SYNTHESIZE,
            vec![Message::user(synth_user)],
        );
        iterations += 1;
        let response = gate
            .complete(
                SpanKind::Llm,
                "pipeline:synthesize",
                request,
                Some(&trace_id),
                &cancel,
            )
            .await?;
        let answer = parse_json_payload::<PipelineSynthesis>(&response.message.content)
            .map(|s| s.answer)
            .unwrap_or(response.message.content);

        let mut entries: Vec<NotificationEntry> = opts
            .notifications
            .iter()
            .cloned()
            .map(NotificationEntry::new)
            .collect();

        let mut insights = Vec::new();
        if !gathered.is_empty() {
            let ids: Vec<String> = gathered.iter().map(|n| n.id.clone()).collect();
            let observations: Vec<String> =
                gathered.iter().map(|n| n.observation.clone()).collect();
            for notification in gathered {
                let mut entry = NotificationEntry::new(notification);
                entry.advance_to(NotificationStatus::Resolved);
                entries.push(entry);
            }

            let insight = Insight::new(
                ids,
                CorrelationType::Symptomatic,
                answer.clone(),
                observations,
                false,
                Confidence::Medium,
            );
            self.telemetry.publish(TelemetryEvent::InsightProduced {
                insight_id: insight.id.clone(),
                notification_ids: insight.notification_ids.clone(),
                trace_id: Some(trace_id.clone()),
            });
            insights.push(insight);
        }

        messages.push(Message::assistant(answer.clone()));
        Ok(RunOutcome {
            insights,
            operator_results,
            notifications: entries,
            context: messages,
            answer: Some(answer),
            iterations,
        })
    }

    /// One classify call, with a single retry when the reply does not parse.
    async fn classify(
        &self,
        gate: &LlmGate,
        classify_user: &str,
        trace_id: &str,
        cancel: &CancellationToken,
        iterations: &mut u32,
    ) -> Result<PipelineClassification, Error> {
        let request = ChatRequest::new(
            prompts::PIPELINE_CLASSIFY,
            vec![Message::user(classify_user.to_string())],
        );
        *iterations += 1;
        let response = gate
            .complete(
                SpanKind::Llm,
                "pipeline:classify",
                request,
                Some(trace_id),
                cancel,
            )
            .await?;

        match parse_json_payload::<PipelineClassification>(&response.message.content) {
            Ok(classification) => Ok(classification),
            Err(e) => {
                debug!(error = %e, "Classify reply unparseable, retrying once");
                let retry = ChatRequest::new(
                    prompts::PIPELINE_CLASSIFY,
                    vec![Message::user(format!(
                        "{classify_user}\n\nYour previous reply was invalid ({e}). \
                         Respond with JSON only."
                    ))],
                );
                *iterations += 1;
                let response = gate
                    .complete(
                        SpanKind::Llm,
                        "pipeline:classify",
                        retry,
                        Some(trace_id),
                        cancel,
                    )
                    .await?;
                parse_json_payload(&response.message.content)
            }
        }
    }
}
