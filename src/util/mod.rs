//! Shared utilities.

pub mod overflow;
pub mod partial_json;

pub use overflow::is_context_overflow;
pub use partial_json::parse_streaming_json;
