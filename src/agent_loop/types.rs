//! Core types for the agent loop: messages, context, and configuration.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::stream::AssistantEventStream;
use crate::tools::AgentTool;
use crate::types::{Message, MessageRole, Model, ModelContext, SimpleStreamOptions};

/// The function signature for making streaming LLM calls — the loop's
/// single extension point.
pub type StreamFn = Arc<
    dyn Fn(Model, ModelContext, SimpleStreamOptions, CancellationToken) -> AssistantEventStream
        + Send
        + Sync,
>;

/// Transforms agent messages to LLM-compatible messages before each call.
pub type ConvertToLlmFn = Arc<dyn Fn(&[AgentMessage]) -> Result<Vec<Message>> + Send + Sync>;

/// Optionally transforms the agent-level context before conversion.
pub type TransformContextFn =
    Arc<dyn Fn(Vec<AgentMessage>) -> BoxFuture<'static, Result<Vec<AgentMessage>>> + Send + Sync>;

/// Dynamically resolves an API key (for expiring tokens). Takes the
/// provider id.
pub type GetApiKeyFn = Arc<dyn Fn(&str) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Supplies queued user messages (steering or follow-up). An empty vec
/// means nothing is queued.
pub type QueueFn = Arc<dyn Fn() -> BoxFuture<'static, Vec<AgentMessage>> + Send + Sync>;

/// A [`Message`] plus an optional opaque `custom` payload for host-app
/// extensibility. Messages with a custom payload are filtered out by the
/// default LLM conversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

impl AgentMessage {
    pub fn role(&self) -> MessageRole {
        self.message.role()
    }

    /// Whether this is a standard LLM message (no custom payload).
    pub fn is_llm_message(&self) -> bool {
        self.custom.is_none()
    }

    /// Wrap a user text prompt.
    pub fn user(text: impl Into<String>) -> Self {
        Message::user(text).into()
    }
}

impl From<Message> for AgentMessage {
    fn from(message: Message) -> Self {
        Self {
            message,
            custom: None,
        }
    }
}

/// System prompt, messages, and tools for one run of the agent loop.
#[derive(Clone, Default)]
pub struct AgentContext {
    pub system_prompt: String,
    pub messages: Vec<AgentMessage>,
    pub tools: Vec<AgentTool>,
}

/// Keep only LLM-compatible messages, dropping custom payload carriers.
pub fn default_convert_to_llm(messages: &[AgentMessage]) -> Result<Vec<Message>> {
    Ok(messages
        .iter()
        .filter(|m| m.is_llm_message())
        .map(|m| m.message.clone())
        .collect())
}

/// Configuration for a single run of the agent loop.
#[derive(Clone)]
pub struct AgentLoopConfig {
    pub model: Model,
    pub options: SimpleStreamOptions,
    /// Defaults to [`default_convert_to_llm`] when unset.
    pub convert_to_llm: Option<ConvertToLlmFn>,
    pub transform_context: Option<TransformContextFn>,
    pub get_api_key: Option<GetApiKeyFn>,
    /// Polled between tool calls and between turns; non-empty interrupts.
    pub get_steering_messages: Option<QueueFn>,
    /// Polled when the agent would otherwise stop.
    pub get_follow_up_messages: Option<QueueFn>,
}

impl AgentLoopConfig {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            options: SimpleStreamOptions::default(),
            convert_to_llm: None,
            transform_context: None,
            get_api_key: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
        }
    }
}
