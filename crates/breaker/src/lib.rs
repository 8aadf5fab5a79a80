//! Circuit breaker — closed/open/half-open guard over LLM calls.
//!
//! A single breaker instance is shared by every LLM caller in the process.
//! In closed state failures accumulate; at the threshold the breaker opens
//! and rejects calls until the reset timeout elapses, then admits probe
//! calls in half-open state. Enough successes close it again; one failure
//! reopens it.
//!
//! The open-to-half-open transition is evaluated lazily against
//! `tokio::time::Instant` whenever the state is observed, which is
//! equivalent to a scheduled timer event and lets tests drive the clock
//! with paused time.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use beamlens_core::telemetry::{TelemetryBus, TelemetryEvent};
use beamlens_core::{BreakerSnapshot, CircuitState};
use std::sync::Arc;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// When false, the breaker always allows and records nothing.
    pub enabled: bool,

    /// Consecutive failures in closed state before opening.
    pub failure_threshold: u32,

    /// Consecutive successes in half-open state before closing.
    pub success_threshold: u32,

    /// How long the breaker stays open before admitting probes.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<chrono::DateTime<Utc>>,
    last_failure_reason: Option<String>,
}

/// The shared circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    telemetry: Arc<TelemetryBus>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, telemetry: Arc<TelemetryBus>) -> Self {
        Self {
            config,
            telemetry,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_failure_at: None,
                last_failure_reason: None,
            }),
        }
    }

    /// Whether a call may proceed. Emits `circuit_breaker.rejected` when it
    /// may not.
    pub fn allow(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                self.telemetry.publish(TelemetryEvent::CircuitRejected {
                    state: inner.state,
                    failure_count: inner.failure_count,
                });
                false
            }
        }
    }

    /// Record a failed LLM call.
    pub fn record_failure(&self, reason: impl Into<String>) {
        if !self.config.enabled {
            return;
        }
        let reason = reason.into();
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);

        inner.last_failure_at = Some(Utc::now());
        inner.last_failure_reason = Some(reason.clone());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        reason = %reason,
                        "Circuit breaker opening"
                    );
                    self.transition(&mut inner, CircuitState::Open, Some(reason));
                }
            }
            CircuitState::HalfOpen => {
                // A probe failed: straight back to open, counters reset
                inner.failure_count = 0;
                inner.success_count = 0;
                self.transition(&mut inner, CircuitState::Open, Some(reason));
            }
            CircuitState::Open => {}
        }
    }

    /// Record a successful LLM call.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    self.transition(&mut inner, CircuitState::Closed, None);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Administrative reset: force closed with zero counters.
    pub fn reset(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, Some("reset".into()));
        }
    }

    /// Pure snapshot of the current state.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().unwrap();
        if self.config.enabled {
            self.refresh(&mut inner);
        }
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            last_failure_reason: inner.last_failure_reason.clone(),
        }
    }

    /// Lazily move open -> half-open once the reset timeout has elapsed.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|t| t.elapsed() >= self.config.reset_timeout)
            .unwrap_or(false);
        if elapsed {
            inner.success_count = 0;
            self.transition(inner, CircuitState::HalfOpen, None);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, reason: Option<String>) {
        let from = inner.state;
        inner.state = to;
        if to == CircuitState::Open {
            inner.opened_at = Some(Instant::now());
        } else {
            inner.opened_at = None;
        }
        debug!(from = %from, to = %to, "Circuit breaker state change");
        self.telemetry.publish(TelemetryEvent::CircuitStateChange {
            from,
            to,
            failure_count: inner.failure_count,
            reason,
        });
    }
}
