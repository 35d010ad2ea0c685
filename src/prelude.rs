//! Convenience re-exports for common usage.

pub use crate::agent::{Agent, AgentOptions, AgentState, QueueMode};
pub use crate::agent_loop::{
    agent_loop, agent_loop_continue, AgentContext, AgentEvent, AgentLoopConfig, AgentMessage,
    StreamFn,
};
pub use crate::error::{Result, TillerError};
pub use crate::stream::{assistant_event_channel, AssistantEventStream};
pub use crate::tools::{AgentTool, AgentToolResult};
pub use crate::types::{
    AssistantMessage, AssistantMessageEvent, ContentBlock, Message, Model, ModelContext,
    StopReason, ThinkingLevel, Tool, ToolCall, Usage,
};
