//! Tool unions and their fail-closed parsers.
//!
//! The LLM selects tools from closed sets, returned as tagged structs. The
//! parsers key strictly off the tool name (never field presence): an
//! unknown name is `RunError::UnknownTool`, malformed arguments are
//! `ClientError::Schema`. Both are recoverable loop steps, fed back to the
//! LLM as error results.

use serde::{Deserialize, Serialize};

use beamlens_core::{
    ChatResponse, ClientError, Confidence, CorrelationType, Error, MessageToolCall,
    NotificationStatus, RunError, Severity, ToolDefinition,
};

/// Extract the single tool call from a response.
///
/// The loops ask for exactly one tool per turn; zero or several is a schema
/// failure.
pub fn single_call(response: &ChatResponse) -> Result<&MessageToolCall, Error> {
    match response.message.tool_calls.as_slice() {
        [call] => Ok(call),
        [] => Err(Error::Client(ClientError::Schema(
            "expected exactly one tool call, got none".into(),
        ))),
        many => Err(Error::Client(ClientError::Schema(format!(
            "expected exactly one tool call, got {}",
            many.len()
        )))),
    }
}

fn parse_args(call: &MessageToolCall) -> Result<serde_json::Value, Error> {
    if call.arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&call.arguments).map_err(|e| {
        Error::Client(ClientError::Schema(format!(
            "tool {} arguments are not valid JSON: {e}",
            call.name
        )))
    })
}

fn schema_err(name: &str, e: serde_json::Error) -> Error {
    Error::Client(ClientError::Schema(format!(
        "tool {name} arguments do not match schema: {e}"
    )))
}

fn object_schema(properties: serde_json::Value, required: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ── Operator toolset ──────────────────────────────────────────────────────

/// Arguments of the operator's `send_notification` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendNotificationArgs {
    pub anomaly_type: String,
    pub severity: Severity,
    pub context: String,
    pub observation: String,
    #[serde(default)]
    pub hypothesis: Option<String>,
}

/// The closed toolset an operator's LLM may pick from.
#[derive(Debug, Clone)]
pub enum OperatorTool {
    TakeSnapshot,
    RunCallback {
        name: String,
        args: serde_json::Value,
    },
    SendNotification(SendNotificationArgs),
    Think {
        thought: String,
    },
    Wait {
        ms: u64,
    },
    Finish,
}

impl OperatorTool {
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "take_snapshot".into(),
                description: "Sample every metric of the observed domain right now".into(),
                parameters: object_schema(serde_json::json!({}), &[]),
            },
            ToolDefinition {
                name: "run_callback".into(),
                description: "Invoke one of the domain's documented read-only callbacks".into(),
                parameters: object_schema(
                    serde_json::json!({
                        "name": { "type": "string", "description": "Callback name" },
                        "args": { "type": "object", "description": "Callback arguments" }
                    }),
                    &["name"],
                ),
            },
            ToolDefinition {
                name: "send_notification".into(),
                description: "Report a detected anomaly".into(),
                parameters: object_schema(
                    serde_json::json!({
                        "anomaly_type": { "type": "string", "description": "snake_case anomaly tag" },
                        "severity": { "type": "string", "enum": ["info", "warning", "critical"] },
                        "context": { "type": "string", "description": "Factual state" },
                        "observation": { "type": "string", "description": "The detected anomaly" },
                        "hypothesis": { "type": "string", "description": "Speculative cause" }
                    }),
                    &["anomaly_type", "severity", "context", "observation"],
                ),
            },
            ToolDefinition {
                name: "think".into(),
                description: "Record reasoning without acting".into(),
                parameters: object_schema(
                    serde_json::json!({ "thought": { "type": "string" } }),
                    &["thought"],
                ),
            },
            ToolDefinition {
                name: "wait".into(),
                description: "Pause before observing again".into(),
                parameters: object_schema(
                    serde_json::json!({ "ms": { "type": "integer", "minimum": 0 } }),
                    &["ms"],
                ),
            },
            ToolDefinition {
                name: "finish".into(),
                description: "End the investigation".into(),
                parameters: object_schema(serde_json::json!({}), &[]),
            },
        ]
    }

    pub fn parse(call: &MessageToolCall) -> Result<Self, Error> {
        let args = parse_args(call)?;
        match call.name.as_str() {
            "take_snapshot" => Ok(OperatorTool::TakeSnapshot),
            "run_callback" => {
                #[derive(Deserialize)]
                struct Args {
                    name: String,
                    #[serde(default)]
                    args: serde_json::Value,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("run_callback", e))?;
                Ok(OperatorTool::RunCallback {
                    name: parsed.name,
                    args: parsed.args,
                })
            }
            "send_notification" => serde_json::from_value(args)
                .map(OperatorTool::SendNotification)
                .map_err(|e| schema_err("send_notification", e)),
            "think" => {
                #[derive(Deserialize)]
                struct Args {
                    thought: String,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("think", e))?;
                Ok(OperatorTool::Think {
                    thought: parsed.thought,
                })
            }
            "wait" => {
                #[derive(Deserialize)]
                struct Args {
                    ms: u64,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("wait", e))?;
                Ok(OperatorTool::Wait { ms: parsed.ms })
            }
            "finish" => Ok(OperatorTool::Finish),
            other => Err(Error::Run(RunError::UnknownTool(other.to_string()))),
        }
    }
}

// ── Coordinator toolset ───────────────────────────────────────────────────

/// Arguments of the coordinator's `produce_insight` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceInsightArgs {
    pub notification_ids: Vec<String>,
    pub correlation_type: CorrelationType,
    pub summary: String,
    #[serde(default)]
    pub root_cause_hypothesis: Option<String>,
    #[serde(default)]
    pub matched_observations: Vec<String>,
    #[serde(default)]
    pub hypothesis_grounded: bool,
    pub confidence: Confidence,
}

/// The closed toolset the coordinator's LLM may pick from.
#[derive(Debug, Clone)]
pub enum CoordinatorTool {
    GetNotifications {
        status: Option<NotificationStatus>,
    },
    UpdateNotificationStatuses {
        ids: Vec<String>,
        status: NotificationStatus,
        reason: Option<String>,
    },
    ProduceInsight(ProduceInsightArgs),
    Think {
        thought: String,
    },
    InvokeOperators {
        skills: Vec<String>,
        context: String,
    },
    MessageOperator {
        skill: String,
        message: String,
    },
    GetOperatorStatuses,
    Schedule {
        ms: u64,
        reason: String,
    },
    Wait {
        ms: u64,
    },
    Done,
}

impl CoordinatorTool {
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "get_notifications".into(),
                description: "List notifications in the inbox, optionally filtered by status"
                    .into(),
                parameters: object_schema(
                    serde_json::json!({
                        "status": { "type": "string", "enum": ["unread", "acknowledged", "resolved"] }
                    }),
                    &[],
                ),
            },
            ToolDefinition {
                name: "update_notification_statuses".into(),
                description: "Advance the status of the given notifications".into(),
                parameters: object_schema(
                    serde_json::json!({
                        "ids": { "type": "array", "items": { "type": "string" } },
                        "status": { "type": "string", "enum": ["unread", "acknowledged", "resolved"] },
                        "reason": { "type": "string" }
                    }),
                    &["ids", "status"],
                ),
            },
            ToolDefinition {
                name: "produce_insight".into(),
                description: "Record a correlated insight; cited notifications are resolved"
                    .into(),
                parameters: object_schema(
                    serde_json::json!({
                        "notification_ids": { "type": "array", "items": { "type": "string" } },
                        "correlation_type": { "type": "string", "enum": ["causal", "temporal", "symptomatic"] },
                        "summary": { "type": "string" },
                        "root_cause_hypothesis": { "type": "string" },
                        "matched_observations": { "type": "array", "items": { "type": "string" } },
                        "hypothesis_grounded": { "type": "boolean" },
                        "confidence": { "type": "string", "enum": ["low", "medium", "high"] }
                    }),
                    &["notification_ids", "correlation_type", "summary", "confidence"],
                ),
            },
            ToolDefinition {
                name: "think".into(),
                description: "Record reasoning without acting".into(),
                parameters: object_schema(
                    serde_json::json!({ "thought": { "type": "string" } }),
                    &["thought"],
                ),
            },
            ToolDefinition {
                name: "invoke_operators".into(),
                description: "Launch async investigations on the named skills".into(),
                parameters: object_schema(
                    serde_json::json!({
                        "skills": { "type": "array", "items": { "type": "string" } },
                        "context": { "type": "string", "description": "What to investigate" }
                    }),
                    &["skills", "context"],
                ),
            },
            ToolDefinition {
                name: "message_operator".into(),
                description: "Ask a running operator a short out-of-band question".into(),
                parameters: object_schema(
                    serde_json::json!({
                        "skill": { "type": "string" },
                        "message": { "type": "string" }
                    }),
                    &["skill", "message"],
                ),
            },
            ToolDefinition {
                name: "get_operator_statuses".into(),
                description: "List running operators".into(),
                parameters: object_schema(serde_json::json!({}), &[]),
            },
            ToolDefinition {
                name: "schedule".into(),
                description: "Finish now and re-run the coordinator after a delay".into(),
                parameters: object_schema(
                    serde_json::json!({
                        "ms": { "type": "integer", "minimum": 0 },
                        "reason": { "type": "string" }
                    }),
                    &["ms", "reason"],
                ),
            },
            ToolDefinition {
                name: "wait".into(),
                description: "Pause the loop briefly".into(),
                parameters: object_schema(
                    serde_json::json!({ "ms": { "type": "integer", "minimum": 0 } }),
                    &["ms"],
                ),
            },
            ToolDefinition {
                name: "done".into(),
                description: "Finish the run".into(),
                parameters: object_schema(serde_json::json!({}), &[]),
            },
        ]
    }

    pub fn parse(call: &MessageToolCall) -> Result<Self, Error> {
        let args = parse_args(call)?;
        match call.name.as_str() {
            "get_notifications" => {
                #[derive(Deserialize)]
                struct Args {
                    #[serde(default)]
                    status: Option<NotificationStatus>,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("get_notifications", e))?;
                Ok(CoordinatorTool::GetNotifications {
                    status: parsed.status,
                })
            }
            "update_notification_statuses" => {
                #[derive(Deserialize)]
                struct Args {
                    ids: Vec<String>,
                    status: NotificationStatus,
                    #[serde(default)]
                    reason: Option<String>,
                }
                let parsed: Args = serde_json::from_value(args)
                    .map_err(|e| schema_err("update_notification_statuses", e))?;
                Ok(CoordinatorTool::UpdateNotificationStatuses {
                    ids: parsed.ids,
                    status: parsed.status,
                    reason: parsed.reason,
                })
            }
            "produce_insight" => serde_json::from_value(args)
                .map(CoordinatorTool::ProduceInsight)
                .map_err(|e| schema_err("produce_insight", e)),
            "think" => {
                #[derive(Deserialize)]
                struct Args {
                    thought: String,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("think", e))?;
                Ok(CoordinatorTool::Think {
                    thought: parsed.thought,
                })
            }
            "invoke_operators" => {
                #[derive(Deserialize)]
                struct Args {
                    skills: Vec<String>,
                    #[serde(default)]
                    context: String,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("invoke_operators", e))?;
                Ok(CoordinatorTool::InvokeOperators {
                    skills: parsed.skills,
                    context: parsed.context,
                })
            }
            "message_operator" => {
                #[derive(Deserialize)]
                struct Args {
                    skill: String,
                    message: String,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("message_operator", e))?;
                Ok(CoordinatorTool::MessageOperator {
                    skill: parsed.skill,
                    message: parsed.message,
                })
            }
            "get_operator_statuses" => Ok(CoordinatorTool::GetOperatorStatuses),
            "schedule" => {
                #[derive(Deserialize)]
                struct Args {
                    ms: u64,
                    #[serde(default)]
                    reason: String,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("schedule", e))?;
                Ok(CoordinatorTool::Schedule {
                    ms: parsed.ms,
                    reason: parsed.reason,
                })
            }
            "wait" => {
                #[derive(Deserialize)]
                struct Args {
                    ms: u64,
                }
                let parsed: Args =
                    serde_json::from_value(args).map_err(|e| schema_err("wait", e))?;
                Ok(CoordinatorTool::Wait { ms: parsed.ms })
            }
            "done" => Ok(CoordinatorTool::Done),
            other => Err(Error::Run(RunError::UnknownTool(other.to_string()))),
        }
    }
}

// ── Watcher verdict ───────────────────────────────────────────────────────

fn default_cooldown_minutes() -> u64 {
    5
}

/// The watcher LLM's tagged judgement of an observation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum BaselineVerdict {
    ContinueObserving {
        #[serde(default)]
        notes: String,
        confidence: Confidence,
    },
    ReportAnomaly {
        anomaly_type: String,
        severity: Severity,
        summary: String,
        #[serde(default)]
        evidence: Vec<String>,
        confidence: Confidence,
        #[serde(default = "default_cooldown_minutes")]
        cooldown_minutes: u64,
    },
    ReportHealthy {
        summary: String,
        confidence: Confidence,
    },
}

// ── Pipeline stages ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineIntent {
    Question,
    Investigation,
}

/// Output of the pipeline's classify stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineClassification {
    pub intent: PipelineIntent,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub operator_context: String,
}

/// Output of the pipeline's synthesize stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSynthesis {
    pub answer: String,
}

/// Parse a JSON payload from LLM text output, tolerating surrounding prose
/// by falling back to the outermost braces.
pub fn parse_json_payload<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, Error> {
    let trimmed = content.trim();
    if let Ok(parsed) = serde_json::from_str(trimmed) {
        return Ok(parsed);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(parsed) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(parsed);
            }
        }
    }
    Err(Error::Client(ClientError::Schema(format!(
        "response is not a valid JSON payload: {:.120}",
        trimmed
    ))))
}
