//! Tool definitions, execution capability, and argument validation.

pub mod tool;
pub mod validation;

pub use tool::{find_tool, AgentTool, AgentToolResult, ToolHandler, ToolUpdateFn};
pub use validation::validate_tool_arguments;
