//! High-level agent facade.

pub mod runtime;

pub use runtime::{Agent, AgentOptions, AgentState, QueueMode, Subscription};
