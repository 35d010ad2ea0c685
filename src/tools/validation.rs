//! Validate tool-call arguments before execution.

use serde_json::Value;

use crate::types::{Tool, ToolCall};

/// Validate a tool call's arguments against the tool's parameter schema.
///
/// Checks that every name in the schema's `required` list is present as an
/// argument key; deeper JSON-Schema validation is out of scope. Returns the
/// arguments on success, or a human-readable report listing the missing
/// keys and echoing the received arguments.
pub fn validate_tool_arguments(
    tool: &Tool,
    call: &ToolCall,
) -> Result<serde_json::Map<String, Value>, String> {
    let args = call.arguments.clone();

    let Some(required) = tool.parameters.get("required").and_then(Value::as_array) else {
        return Ok(args);
    };

    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|name| !args.contains_key(*name))
        .collect();

    if missing.is_empty() {
        return Ok(args);
    }

    let received = serde_json::to_string_pretty(&args).unwrap_or_else(|_| "{}".to_string());
    Err(format!(
        "validation failed for tool \"{}\":\n  - missing required: {}\n\nReceived arguments:\n{}",
        call.name,
        missing.join(", "),
        received
    ))
}
