//! Lifecycle events emitted by the agent loop.

use serde::{Deserialize, Serialize};

use crate::stream::{event_channel, EventSink, EventStream};
use crate::tools::AgentToolResult;
use crate::types::{AssistantMessageEvent, ToolResultMessage};

use super::types::AgentMessage;

/// An event emitted during the agent loop for observability.
///
/// Events bracket cleanly: `agent_start` opens a run and `agent_end` closes
/// it; every `turn_start` / `message_start` / `tool_execution_start` has a
/// matching end event, correctly nested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        /// All messages produced during the run, in event order.
        messages: Vec<AgentMessage>,
    },
    TurnStart,
    TurnEnd {
        message: AgentMessage,
        tool_results: Vec<ToolResultMessage>,
    },
    MessageStart {
        message: AgentMessage,
    },
    MessageUpdate {
        message: AgentMessage,
        event: AssistantMessageEvent,
    },
    MessageEnd {
        message: AgentMessage,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Map<String, serde_json::Value>,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        partial: AgentToolResult,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: AgentToolResult,
        is_error: bool,
    },
}

/// Producer half of an agent event stream.
pub type AgentEventSink = EventSink<AgentEvent, Vec<AgentMessage>>;
/// Consumer half of an agent event stream. The final result is the ordered
/// list of messages the run produced.
pub type AgentEventStream = EventStream<AgentEvent, Vec<AgentMessage>>;

/// Create an agent event stream. `agent_end` is the terminal event.
pub fn agent_event_channel() -> (AgentEventSink, AgentEventStream) {
    event_channel(
        |event| matches!(event, AgentEvent::AgentEnd { .. }),
        |event| match event {
            AgentEvent::AgentEnd { messages } => messages.clone(),
            _ => Vec::new(),
        },
    )
}
