//! # BeamLens Core
//!
//! Domain types, traits, and error definitions for the BeamLens runtime
//! self-observation agent. This crate defines the domain model that all
//! other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod baseline;
pub mod breaker;
pub mod client;
pub mod error;
pub mod insight;
pub mod message;
pub mod notification;
pub mod skill;
pub mod telemetry;

// Re-export key types at crate root for ergonomics
pub use baseline::{Baseline, MetricSample};
pub use breaker::{BreakerSnapshot, CircuitState};
pub use client::{ChatRequest, ChatResponse, ClientRegistry, LlmClient, ToolDefinition, Usage};
pub use error::{ClientError, Error, Result, RunError, SkillError};
pub use insight::{Confidence, CorrelationType, Insight};
pub use message::{Message, MessageToolCall, Role};
pub use notification::{
    Notification, NotificationEntry, NotificationStatus, Severity, WatcherFindings,
};
pub use skill::{CallbackSpec, MetricSnapshot, Skill, SkillId, SkillRegistry};
pub use telemetry::{SpanKind, TelemetryBus, TelemetryEvent};
