//! Agent loops — the LLM-driven kernel of BeamLens.
//!
//! Three loop shapes live here:
//!
//! - **Operator** ([`operator::Operator`]): a per-skill tool-calling agent
//!   that investigates one domain and produces notifications.
//! - **Coordinator** ([`coordinator::Coordinator`]): the singleton actor
//!   that correlates notifications into insights, either iteratively
//!   (AgentLoop strategy) or via a fixed classify/gather/synthesize
//!   pipeline.
//! - **Watcher** ([`watcher::Watcher`]): a cron-driven observer that keeps
//!   a sliding snapshot window and delegates anomaly judgement to the LLM.
//!
//! Every LLM call in every loop goes through [`llm::LlmGate`], which
//! enforces the circuit breaker, the per-call timeout, and the telemetry
//! span contract.

pub mod context;
pub mod coordinator;
pub mod llm;
pub mod operator;
pub mod pipeline;
pub mod prompts;
pub mod testing;
pub mod tools;
pub mod watcher;

pub use context::{CompactionPolicy, RunContext};
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorStatus, RunOptions, RunOutcome,
    Strategy,
};
pub use llm::LlmGate;
pub use operator::{
    FinishReason, Operator, OperatorAsk, OperatorConfig, OperatorEvent, OperatorHandle,
    OperatorRun,
};
pub use watcher::{Watcher, WatcherConfig, WatcherStatus, WatcherTick};
