//! The agent loop: event types, configuration, and the runner.

pub mod events;
pub mod runner;
pub mod types;

pub use events::{agent_event_channel, AgentEvent, AgentEventSink, AgentEventStream};
pub use runner::{agent_loop, agent_loop_continue};
pub use types::{
    default_convert_to_llm, AgentContext, AgentLoopConfig, AgentMessage, ConvertToLlmFn,
    GetApiKeyFn, QueueFn, StreamFn, TransformContextFn,
};
