//! Agent-side tools: an LLM tool definition plus an execute capability.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TillerError;
use crate::types::{ContentBlock, Tool};

/// The payload a tool produces: content blocks for the model plus an
/// opaque `details` value for the host application.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AgentToolResult {
    /// A result consisting of a single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            details: None,
        }
    }
}

/// Progress callback invoked with partial results during execution.
pub type ToolUpdateFn = Arc<dyn Fn(AgentToolResult) -> BoxFuture<'static, ()> + Send + Sync>;

/// The execute capability of an [`AgentTool`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(
        &self,
        cancel: CancellationToken,
        tool_call_id: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
        on_update: ToolUpdateFn,
    ) -> Result<AgentToolResult, TillerError>;
}

/// A [`Tool`] definition paired with a human label and an execute capability.
#[derive(Clone)]
pub struct AgentTool {
    pub tool: Tool,
    pub label: String,
    pub handler: Arc<dyn ToolHandler>,
}

impl AgentTool {
    pub fn new(tool: Tool, label: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            tool,
            label: label.into(),
            handler,
        }
    }

    /// Create a tool from an async closure, for quick definitions.
    pub fn from_fn<F, Fut>(tool: Tool, label: impl Into<String>, handler: F) -> Self
    where
        F: Fn(
                CancellationToken,
                String,
                serde_json::Map<String, serde_json::Value>,
                ToolUpdateFn,
            ) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<AgentToolResult, TillerError>> + Send + 'static,
    {
        Self::new(tool, label, Arc::new(FnHandler::new(handler)))
    }

    pub fn name(&self) -> &str {
        &self.tool.name
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.tool.name)
            .field("label", &self.label)
            .finish()
    }
}

type HandlerFn = dyn Fn(
        CancellationToken,
        String,
        serde_json::Map<String, serde_json::Value>,
        ToolUpdateFn,
    ) -> Pin<Box<dyn Future<Output = Result<AgentToolResult, TillerError>> + Send>>
    + Send
    + Sync;

struct FnHandler {
    handler: Box<HandlerFn>,
}

impl FnHandler {
    fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(
                CancellationToken,
                String,
                serde_json::Map<String, serde_json::Value>,
                ToolUpdateFn,
            ) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<AgentToolResult, TillerError>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |cancel, id, args, on_update| {
                Box::pin(handler(cancel, id, args, on_update))
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for FnHandler {
    async fn execute(
        &self,
        cancel: CancellationToken,
        tool_call_id: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
        on_update: ToolUpdateFn,
    ) -> Result<AgentToolResult, TillerError> {
        (self.handler)(cancel, tool_call_id.to_string(), arguments, on_update).await
    }
}

/// Find a tool by name.
pub fn find_tool<'a>(tools: &'a [AgentTool], name: &str) -> Option<&'a AgentTool> {
    tools.iter().find(|t| t.tool.name == name)
}
