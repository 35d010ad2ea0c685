//! Core data model: content blocks, messages, usage, models, stream events.

pub mod content;
pub mod event;
pub mod message;
pub mod model;
pub mod usage;

pub use content::{ContentBlock, ToolCall};
pub use event::AssistantMessageEvent;
pub use message::{
    now_ms, AssistantMessage, Message, MessageRole, StopReason, ToolResultMessage, UserMessage,
};
pub use model::{
    Api, CacheRetention, Model, ModelContext, ModelCost, ProviderId, SimpleStreamOptions,
    StreamOptions, ThinkingBudgets, ThinkingLevel, Tool,
};
pub use usage::{Cost, Usage};
