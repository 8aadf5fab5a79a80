//! The shared LLM call gate.
//!
//! Every LLM call in the system goes through here: circuit breaker check,
//! span telemetry, per-call timeout, and cooperative cancellation. Timeouts
//! and transport errors feed the breaker; cancellation does not.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use beamlens_breaker::CircuitBreaker;
use beamlens_core::telemetry::{SpanKind, TelemetryBus, TelemetryEvent};
use beamlens_core::{ChatRequest, ChatResponse, ClientError, Error, LlmClient, RunError};

/// Breaker-gated, timeout-bounded LLM access shared by all loops.
#[derive(Clone)]
pub struct LlmGate {
    pub client: Arc<dyn LlmClient>,
    pub breaker: Arc<CircuitBreaker>,
    pub telemetry: Arc<TelemetryBus>,
    pub timeout: Duration,
}

impl LlmGate {
    pub fn new(
        client: Arc<dyn LlmClient>,
        breaker: Arc<CircuitBreaker>,
        telemetry: Arc<TelemetryBus>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            breaker,
            telemetry,
            timeout,
        }
    }

    /// Swap the client, keeping breaker/telemetry/timeout.
    pub fn with_client(&self, client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            breaker: self.breaker.clone(),
            telemetry: self.telemetry.clone(),
            timeout: self.timeout,
        }
    }

    /// Execute one gated LLM call.
    pub async fn complete(
        &self,
        span: SpanKind,
        label: &str,
        request: ChatRequest,
        trace_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, Error> {
        if !self.breaker.allow() {
            debug!(label, "LLM call rejected by open circuit breaker");
            return Err(Error::Client(ClientError::CircuitOpen));
        }

        let trace = trace_id.map(String::from);
        self.telemetry.publish(TelemetryEvent::SpanStart {
            span,
            label: label.to_string(),
            trace_id: trace.clone(),
            system_time: Utc::now(),
        });
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.telemetry.publish(TelemetryEvent::SpanException {
                    span,
                    label: label.to_string(),
                    trace_id: trace,
                    duration_ms: started.elapsed().as_millis() as u64,
                    kind: "cancelled".into(),
                    reason: "caller cancelled".into(),
                });
                return Err(Error::Run(RunError::Cancelled));
            }
            outcome = tokio::time::timeout(self.timeout, self.client.complete(request)) => outcome,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Err(_elapsed) => {
                self.breaker.record_failure("timeout");
                self.telemetry.publish(TelemetryEvent::SpanException {
                    span,
                    label: label.to_string(),
                    trace_id: trace,
                    duration_ms,
                    kind: "timeout".into(),
                    reason: format!("no response within {:?}", self.timeout),
                });
                Err(Error::Client(ClientError::Timeout(format!(
                    "LLM call exceeded {:?}",
                    self.timeout
                ))))
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(e.to_string());
                self.telemetry.publish(TelemetryEvent::SpanException {
                    span,
                    label: label.to_string(),
                    trace_id: trace,
                    duration_ms,
                    kind: "client_error".into(),
                    reason: e.to_string(),
                });
                Err(Error::Client(e))
            }
            Ok(Ok(response)) => {
                self.breaker.record_success();
                self.telemetry.publish(TelemetryEvent::SpanStop {
                    span,
                    label: label.to_string(),
                    trace_id: trace,
                    duration_ms,
                });
                Ok(response)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use beamlens_breaker::BreakerConfig;
    use beamlens_core::Message;

    fn gate(client: Arc<dyn LlmClient>, breaker: Arc<CircuitBreaker>) -> LlmGate {
        LlmGate::new(
            client,
            breaker,
            Arc::new(TelemetryBus::default()),
            Duration::from_secs(60),
        )
    }

    fn request() -> ChatRequest {
        ChatRequest::new("system", vec![Message::user("hello")])
    }

    #[tokio::test]
    async fn success_records_on_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default(),
            Arc::new(TelemetryBus::default()),
        ));
        breaker.record_failure("earlier");
        let gate = gate(
            Arc::new(ScriptedClient::new(vec![ScriptedClient::text("ok")])),
            breaker.clone(),
        );

        let response = gate
            .complete(
                SpanKind::Llm,
                "test",
                request(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.message.content, "ok");
        // A success in closed state clears the failure count
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            Arc::new(TelemetryBus::default()),
        ));
        breaker.record_failure("transport");

        let gate = gate(
            Arc::new(ScriptedClient::new(vec![ScriptedClient::text("unused")])),
            breaker,
        );
        let err = gate
            .complete(
                SpanKind::Llm,
                "test",
                request(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Client(ClientError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_breaker_failure() {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default(),
            Arc::new(TelemetryBus::default()),
        ));
        let gate = LlmGate::new(
            Arc::new(ScriptedClient::new(vec![ScriptedClient::hang()])),
            breaker.clone(),
            Arc::new(TelemetryBus::default()),
            Duration::from_millis(100),
        );

        let err = gate
            .complete(
                SpanKind::Llm,
                "test",
                request(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Client(ClientError::Timeout(_))));
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn cancellation_does_not_touch_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default(),
            Arc::new(TelemetryBus::default()),
        ));
        let gate = gate(
            Arc::new(ScriptedClient::new(vec![ScriptedClient::hang()])),
            breaker.clone(),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gate
            .complete(SpanKind::Llm, "test", request(), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Run(RunError::Cancelled)));
        assert_eq!(breaker.snapshot().failure_count, 0);
    }
}
