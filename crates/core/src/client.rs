//! LlmClient trait — the abstraction over LLM backends.
//!
//! A client knows how to send a request (system prompt, message history,
//! available tools) to an LLM and get a response back. The transport itself
//! (HTTP, provider SDK, local model) is an external collaborator; the core
//! only depends on this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ClientError;
use crate::message::Message;

/// A request to an LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// System instructions (skill prompt, callback docs)
    pub system: String,

    /// The accumulated context messages
    pub messages: Vec<Message>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.2
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
            tools: Vec::new(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete response from an LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The generated message (text and/or tool calls)
    pub message: Message,

    /// Which model actually responded
    pub model: String,

    /// Token usage statistics
    pub usage: Option<Usage>,
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The core LlmClient trait.
///
/// Every backend implements this trait; the agent loops call `complete()`
/// without knowing which transport is behind it.
#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// A human-readable name for this client (e.g., "anthropic", "scripted").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: ChatRequest,
    ) -> std::result::Result<ChatResponse, ClientError>;
}

/// Named LLM clients with a designated primary.
///
/// The configuration surface declares `{primary, clients}`; a run may
/// override the client per invocation.
pub struct ClientRegistry {
    primary: String,
    clients: HashMap<String, Arc<dyn LlmClient>>,
}

impl ClientRegistry {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            clients: HashMap::new(),
        }
    }

    /// A registry containing a single client, which is also the primary.
    pub fn single(client: Arc<dyn LlmClient>) -> Self {
        let name = client.name().to_string();
        let mut registry = Self::new(name.clone());
        registry.register(name, client);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, client: Arc<dyn LlmClient>) {
        self.clients.insert(name.into(), client);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(name).cloned()
    }

    /// The primary client.
    pub fn primary(&self) -> std::result::Result<Arc<dyn LlmClient>, ClientError> {
        self.get(&self.primary)
            .ok_or_else(|| ClientError::NotConfigured(self.primary.clone()))
    }

    pub fn primary_name(&self) -> &str {
        &self.primary
    }
}
