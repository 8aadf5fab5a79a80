//! Test support — scripted LLM clients.
//!
//! `ScriptedClient` plays back a fixed sequence of responses, one per
//! `complete` call, and panics when the script runs dry; tests that drive a
//! loop past its script are broken tests. `RoutedClient` dispatches between
//! scripts based on the request's system prompt, which lets one test drive
//! a coordinator and its child operators with independent scripts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use beamlens_core::{
    ChatRequest, ChatResponse, ClientError, LlmClient, Message, MessageToolCall, Usage,
};

/// One scripted reply.
#[derive(Debug)]
pub enum ScriptedResponse {
    /// Return this response immediately.
    Reply(ChatResponse),
    /// Return this error immediately.
    Fail(ClientError),
    /// Never resolve (for timeout/deadline tests).
    Hang,
    /// Wait for the notify, then return the response.
    Gated(Arc<tokio::sync::Notify>, Box<ChatResponse>),
}

/// A mock client that returns a fixed sequence of responses and records
/// every request it was handed.
#[derive(Debug)]
pub struct ScriptedClient {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// A plain text reply.
    pub fn text(content: &str) -> ScriptedResponse {
        ScriptedResponse::Reply(make_response(Message::assistant(content)))
    }

    /// A reply carrying exactly one tool call.
    pub fn tool_call(name: &str, args: serde_json::Value) -> ScriptedResponse {
        ScriptedResponse::Reply(make_tool_response(name, args))
    }

    /// A reply that never arrives.
    pub fn hang() -> ScriptedResponse {
        ScriptedResponse::Hang
    }

    /// A transport error.
    pub fn fail(error: ClientError) -> ScriptedResponse {
        ScriptedResponse::Fail(error)
    }

    /// A tool-call reply released by the given notify.
    pub fn gated_tool_call(
        gate: Arc<tokio::sync::Notify>,
        name: &str,
        args: serde_json::Value,
    ) -> ScriptedResponse {
        ScriptedResponse::Gated(gate, Box::new(make_tool_response(name, args)))
    }
}

fn make_response(message: Message) -> ChatResponse {
    ChatResponse {
        message,
        model: "scripted".into(),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
    }
}

fn make_tool_response(name: &str, args: serde_json::Value) -> ChatResponse {
    let mut message = Message::assistant("");
    message.tool_calls = vec![MessageToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: args.to_string(),
    }];
    make_response(message)
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ClientError> {
        let next = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            let call_number = requests.len();
            self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
                panic!("ScriptedClient: script exhausted at call #{call_number}")
            })
        };

        match next {
            ScriptedResponse::Reply(response) => Ok(response),
            ScriptedResponse::Fail(error) => Err(error),
            ScriptedResponse::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            ScriptedResponse::Gated(gate, response) => {
                gate.notified().await;
                Ok(*response)
            }
        }
    }
}

/// Dispatches to the first script whose marker appears in the request's
/// system prompt. Panics when no route matches.
#[derive(Debug)]
pub struct RoutedClient {
    routes: Vec<(String, Arc<dyn LlmClient>)>,
}

impl RoutedClient {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn route(mut self, marker: &str, client: Arc<dyn LlmClient>) -> Self {
        self.routes.push((marker.to_string(), client));
        self
    }
}

impl Default for RoutedClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for RoutedClient {
    fn name(&self) -> &str {
        "routed"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ClientError> {
        for (marker, client) in &self.routes {
            if request.system.contains(marker) {
                return client.complete(request).await;
            }
        }
        panic!(
            "RoutedClient: no route matches system prompt: {:.80}",
            request.system
        );
    }
}
