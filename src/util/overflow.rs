//! Context-overflow detection across provider error shapes.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{AssistantMessage, StopReason};

static OVERFLOW_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
static NO_BODY_PATTERN: OnceLock<Regex> = OnceLock::new();

fn overflow_patterns() -> &'static [Regex] {
    OVERFLOW_PATTERNS.get_or_init(|| {
        [
            r"(?i)prompt is too long",
            r"(?i)input is too long for requested model",
            r"(?i)exceeds the context window",
            r"(?i)input token count.*exceeds the maximum",
            r"(?i)maximum prompt length is \d+",
            r"(?i)reduce the length of the messages",
            r"(?i)maximum context length is \d+ tokens",
            r"(?i)exceeds the limit of \d+",
            r"(?i)exceeds the available context size",
            r"(?i)greater than the context length",
            r"(?i)context window exceeds limit",
            r"(?i)exceeded model token limit",
            r"(?i)context[_ ]length[_ ]exceeded",
            r"(?i)too many tokens",
            r"(?i)token limit exceeded",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid overflow pattern"))
        .collect()
    })
}

/// Cerebras/Mistral-style 400/413 responses with an empty body.
fn no_body_pattern() -> &'static Regex {
    NO_BODY_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^4(00|13)\s*(status code)?\s*\(no body\)").expect("valid no-body pattern")
    })
}

/// Returns true when an assistant message indicates the input exceeded the
/// model's context window.
///
/// `context_window` is optional; when > 0 it also enables silent-overflow
/// detection for providers that accept an overflowing request and report
/// inflated usage with a normal stop.
pub fn is_context_overflow(message: &AssistantMessage, context_window: u64) -> bool {
    if message.stop_reason == StopReason::Error {
        if let Some(error_message) = message.error_message.as_deref() {
            if !error_message.is_empty() {
                if overflow_patterns()
                    .iter()
                    .any(|p| p.is_match(error_message))
                {
                    return true;
                }
                if no_body_pattern().is_match(error_message) {
                    return true;
                }
            }
        }
    }

    if context_window > 0 && message.stop_reason == StopReason::Stop {
        let input_tokens = message.usage.input + message.usage.cache_read;
        if input_tokens > context_window {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;

    fn error_message(text: &str) -> AssistantMessage {
        AssistantMessage {
            content: vec![],
            api: "anthropic-messages".into(),
            provider: "anthropic".into(),
            model: "test".into(),
            usage: Usage::default(),
            stop_reason: StopReason::Error,
            error_message: Some(text.to_string()),
            timestamp: 0,
        }
    }

    #[test]
    fn matches_known_phrases_case_insensitively() {
        let phrases = [
            "Prompt is too long: 250000 tokens",
            "the input is too long for requested model",
            "request exceeds the context window",
            "input token count (300000) exceeds the maximum allowed",
            "maximum prompt length is 131072",
            "please reduce the length of the messages",
            "This model's maximum context length is 128000 tokens",
            "exceeds the limit of 200000",
            "exceeds the available context size",
            "is greater than the context length",
            "context window exceeds limit",
            "exceeded model token limit",
            "context_length_exceeded",
            "context length exceeded",
            "too many tokens in request",
            "token limit exceeded",
        ];
        for phrase in phrases {
            assert!(
                is_context_overflow(&error_message(phrase), 0),
                "expected overflow for {phrase:?}"
            );
        }
    }

    #[test]
    fn matches_bodyless_4xx() {
        assert!(is_context_overflow(&error_message("400 (no body)"), 0));
        assert!(is_context_overflow(
            &error_message("413 status code (no body)"),
            0
        ));
        assert!(!is_context_overflow(&error_message("404 (no body)"), 0));
    }

    #[test]
    fn unrelated_errors_are_not_overflow() {
        assert!(!is_context_overflow(&error_message("rate limited"), 0));
    }

    #[test]
    fn silent_overflow_requires_window_and_stop() {
        let mut msg = error_message("");
        msg.stop_reason = StopReason::Stop;
        msg.error_message = None;
        msg.usage = Usage {
            input: 150_000,
            cache_read: 100_000,
            ..Usage::default()
        };

        assert!(is_context_overflow(&msg, 200_000));
        assert!(!is_context_overflow(&msg, 0));
        assert!(!is_context_overflow(&msg, 300_000));
    }
}
