//! Best-effort parsing of truncated JSON objects.
//!
//! Providers stream tool-call arguments as an incrementally growing JSON
//! object; mid-stream the text is usually cut off inside a value. This
//! parser recovers what it can so partial arguments stay inspectable.

use serde_json::{Map, Value};

/// Parse a possibly incomplete JSON object into a key→value map.
///
/// Tries a strict parse first, then repairs the input by trimming a
/// trailing comma, closing an unterminated string, and appending the
/// missing `]`/`}` runs. Returns an empty map when nothing parseable
/// remains; never fails.
pub fn parse_streaming_json(partial: &str) -> Map<String, Value> {
    let partial = partial.trim();
    if partial.is_empty() {
        return Map::new();
    }

    if let Ok(map) = serde_json::from_str::<Map<String, Value>>(partial) {
        return map;
    }

    try_repair_and_parse(partial).unwrap_or_default()
}

fn try_repair_and_parse(input: &str) -> Option<Map<String, Value>> {
    let trimmed = input.trim_end();
    let trimmed = trimmed.strip_suffix(',').unwrap_or(trimmed);

    let mut open_braces: i64 = 0;
    let mut open_brackets: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for c in trimmed.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' && in_string {
            escaped = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => open_braces += 1,
            '}' => open_braces -= 1,
            '[' => open_brackets += 1,
            ']' => open_brackets -= 1,
            _ => {}
        }
    }

    let mut repaired = trimmed.to_string();
    if in_string {
        repaired.push('"');
    }
    for _ in 0..open_brackets.max(0) {
        repaired.push(']');
    }
    for _ in 0..open_braces.max(0) {
        repaired.push('}');
    }

    serde_json::from_str::<Map<String, Value>>(&repaired).ok()
}
