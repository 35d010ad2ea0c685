//! Tiller — agent runtime core for multi-provider LLM clients.
//!
//! The crate drives a multi-turn conversation with a language model:
//! streaming assembly of assistant responses, sequential tool execution,
//! mid-run steering, and post-run follow-up queues. Concrete provider
//! adapters stay outside the core; everything flows through a single
//! abstract stream function (see [`agent_loop::StreamFn`]), of which the
//! SSE proxy transport in [`provider::proxy`] is one implementation.
//!
//! Typical usage goes through the [`agent::Agent`] facade:
//!
//! ```ignore
//! let agent = Agent::new(AgentOptions {
//!     stream_fn: Some(proxy_stream_fn("https://proxy.example", token)),
//!     ..AgentOptions::default()
//! });
//! agent.set_model(model);
//! agent.set_system_prompt("You are a helpful assistant.");
//! let sub = agent.subscribe(|event| println!("{event:?}"));
//! agent.prompt("Hello!")?;
//! agent.wait_for_idle().await;
//! ```

pub mod agent;
pub mod agent_loop;
pub mod error;
pub mod models;
pub mod prelude;
pub mod provider;
pub mod stream;
pub mod tools;
pub mod types;
pub mod util;

pub use error::{Result, TillerError};
