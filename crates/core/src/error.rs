//! Error types for the BeamLens domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all BeamLens operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- LLM client errors ---
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    // --- Skill callback errors ---
    #[error("Skill error: {0}")]
    Skill(#[from] SkillError),

    // --- Run lifecycle errors ---
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures when talking to an LLM backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The circuit breaker refused the call. Retriable only after a delay.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// The response could not be parsed into the expected tool union.
    #[error("Response did not match tool schema: {0}")]
    Schema(String),

    #[error("Client not configured: {0}")]
    NotConfigured(String),
}

/// Failures while executing a skill callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkillError {
    #[error("Unknown callback: {0}")]
    UnknownCallback(String),

    #[error("Callback failed: {name}: {reason}")]
    CallbackFailed { name: String, reason: String },

    #[error("Callback timed out: {name} after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("Callback result not encodable: {name}: {reason}")]
    EncodingFailed { name: String, reason: String },
}

/// Lifecycle failures of operator and coordinator runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("Maximum iterations exceeded")]
    MaxIterationsExceeded,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Cancelled")]
    Cancelled,

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),
}
