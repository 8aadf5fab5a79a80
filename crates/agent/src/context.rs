//! Run context and context compaction.
//!
//! The run context is the ordered key/value mapping a caller hands to an
//! operator or coordinator; it renders into the initial user message. The
//! compaction policy keeps an agent loop's append-only message list inside
//! a token budget by summarizing everything but the most recent messages.
//!
//! Token counts use a character heuristic (~4 chars per token), accurate
//! within ~10% for BPE tokenizers on English text.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use beamlens_core::telemetry::SpanKind;
use beamlens_core::{ChatRequest, Error, Message};

use crate::llm::LlmGate;
use crate::prompts;

/// Ordered key/value context for one run.
///
/// The `reason` key renders as `Reason: …`; every other key renders as
/// `key: value`, in key order.
#[derive(Debug, Clone, Default)]
pub struct RunContext(pub BTreeMap<String, String>);

impl RunContext {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        let mut ctx = Self::new();
        ctx.0.insert("reason".into(), reason.into());
        ctx
    }

    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Render into the initial user message.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if let Some(reason) = self.0.get("reason") {
            lines.push(format!("Reason: {reason}"));
        }
        for (key, value) in &self.0 {
            if key != "reason" {
                lines.push(format!("{key}: {value}"));
            }
        }
        if lines.is_empty() {
            "Reason: unspecified".into()
        } else {
            lines.join("\n")
        }
    }
}

/// Estimate the token count for a string. 1 token is roughly 4 characters;
/// rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() + 3) / 4
}

/// Estimate tokens for a message including per-message wire overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let overhead = 4;
    overhead + estimate_tokens(&message.content)
}

/// Estimate tokens for a whole message list.
pub fn estimate_context_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// When and how much to compact.
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    /// Compact once the estimated context exceeds this.
    pub max_tokens: usize,

    /// How many trailing messages survive compaction untouched.
    pub keep_last: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            max_tokens: 50_000,
            keep_last: 5,
        }
    }
}

/// Replace all but the last `keep_last` messages with a single summary
/// message when the context exceeds the budget. Returns whether compaction
/// ran.
pub async fn maybe_compact(
    messages: &mut Vec<Message>,
    policy: &CompactionPolicy,
    gate: &LlmGate,
    trace_id: Option<&str>,
    cancel: &CancellationToken,
) -> Result<bool, Error> {
    if estimate_context_tokens(messages) <= policy.max_tokens {
        return Ok(false);
    }
    if messages.len() <= policy.keep_last {
        return Ok(false);
    }

    let split = messages.len() - policy.keep_last;
    let head_text: String = messages[..split]
        .iter()
        .map(|m| format!("[{:?}] {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let request = ChatRequest::new(prompts::COMPACTION, vec![Message::user(head_text)]);
    let response = gate
        .complete(SpanKind::Compaction, "context", request, trace_id, cancel)
        .await?;

    let summary = Message::system(format!(
        "Earlier context (summarized): {}",
        response.message.content
    ));
    let tail = messages.split_off(split);
    messages.clear();
    messages.push(summary);
    messages.extend(tail);

    debug!(kept = policy.keep_last, "Context compacted");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use beamlens_breaker::{BreakerConfig, CircuitBreaker};
    use beamlens_core::telemetry::TelemetryBus;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn context_renders_reason_first() {
        let ctx = RunContext::with_reason("memory climbing").insert("budget", "5m");
        assert_eq!(ctx.render(), "Reason: memory climbing\nbudget: 5m");
    }

    #[test]
    fn empty_context_renders_placeholder() {
        assert_eq!(RunContext::new().render(), "Reason: unspecified");
    }

    #[test]
    fn token_estimates() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("hello"), 2);

        let msg = Message::user("test"); // 1 token + 4 overhead
        assert_eq!(estimate_message_tokens(&msg), 5);
    }

    fn test_gate(client: Arc<ScriptedClient>) -> LlmGate {
        let telemetry = Arc::new(TelemetryBus::default());
        LlmGate::new(
            client,
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), telemetry.clone())),
            telemetry,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn under_budget_is_untouched() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let gate = test_gate(client.clone());
        let mut messages = vec![Message::user("short")];

        let compacted = maybe_compact(
            &mut messages,
            &CompactionPolicy::default(),
            &gate,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!compacted);
        assert_eq!(messages.len(), 1);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn over_budget_collapses_head() {
        let client = Arc::new(ScriptedClient::new(vec![ScriptedClient::text(
            "rss grew from 400MB to 820MB across ticks",
        )]));
        let gate = test_gate(client.clone());

        let mut messages: Vec<Message> =
            (0..10).map(|i| Message::user(format!("observation {i}: {}", "x".repeat(100)))).collect();
        let policy = CompactionPolicy {
            max_tokens: 50,
            keep_last: 3,
        };

        let compacted = maybe_compact(
            &mut messages,
            &policy,
            &gate,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(compacted);
        // 1 summary + 3 kept
        assert_eq!(messages.len(), 4);
        assert!(messages[0].content.contains("summarized"));
        assert!(messages[1].content.contains("observation 7"));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn too_few_messages_never_compacts() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let gate = test_gate(client);
        let mut messages = vec![Message::user("x".repeat(10_000))];

        let policy = CompactionPolicy {
            max_tokens: 10,
            keep_last: 5,
        };
        let compacted = maybe_compact(
            &mut messages,
            &policy,
            &gate,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!compacted);
    }
}
