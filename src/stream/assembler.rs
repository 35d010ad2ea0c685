//! Assembles raw wire events into a growing partial assistant message.
//!
//! Providers (and the proxy transport) emit compact incremental events;
//! the assembler owns the partial message, grows its content list by
//! index, and translates each wire event into a normalised
//! [`AssistantMessageEvent`] carrying a snapshot of the partial.

use serde::{Deserialize, Serialize};

use crate::types::{
    now_ms, AssistantMessage, AssistantMessageEvent, ContentBlock, Model, StopReason, Usage,
};
use crate::util::parse_streaming_json;

/// Compact wire event, as sent by the proxy (`partial` stripped to reduce
/// bandwidth). For `toolcall_delta`, `delta` carries the accumulated
/// argument text so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content_index: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delta: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl RawStreamEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }
}

/// Accumulates wire events into a partial [`AssistantMessage`].
#[derive(Debug, Clone)]
pub struct MessageAssembler {
    partial: AssistantMessage,
}

impl MessageAssembler {
    /// Start assembling a response attributed to `model`.
    pub fn new(model: &Model) -> Self {
        Self {
            partial: AssistantMessage {
                content: Vec::new(),
                api: model.api.clone(),
                provider: model.provider.clone(),
                model: model.id.clone(),
                usage: Usage::default(),
                stop_reason: StopReason::Stop,
                error_message: None,
                timestamp: now_ms(),
            },
        }
    }

    /// The partial message built so far.
    pub fn partial(&self) -> &AssistantMessage {
        &self.partial
    }

    /// Consume the assembler, yielding the message in its current state.
    pub fn into_message(self) -> AssistantMessage {
        self.partial
    }

    /// Record an error terminal state and return the resulting event.
    pub fn fail(&mut self, error_message: impl Into<String>) -> AssistantMessageEvent {
        self.partial.stop_reason = StopReason::Error;
        self.partial.error_message = Some(error_message.into());
        AssistantMessageEvent::Error {
            reason: StopReason::Error,
            error: self.partial.clone(),
        }
    }

    /// Apply one wire event. Returns the normalised event to forward, or
    /// `None` for events that do not apply to the current partial (unknown
    /// kind, or a delta whose index holds a different block kind).
    pub fn apply(&mut self, raw: RawStreamEvent) -> Option<AssistantMessageEvent> {
        self.ensure_content_index(raw.content_index);
        let index = raw.content_index;

        match raw.kind.as_str() {
            "start" => Some(AssistantMessageEvent::Start {
                partial: self.partial.clone(),
            }),

            "text_start" => {
                self.partial.content[index] = ContentBlock::text("");
                Some(AssistantMessageEvent::TextStart {
                    content_index: index,
                    partial: self.partial.clone(),
                })
            }
            "text_delta" => {
                let applied = match &mut self.partial.content[index] {
                    ContentBlock::Text { text, .. } => {
                        text.push_str(&raw.delta);
                        true
                    }
                    _ => false,
                };
                applied.then(|| AssistantMessageEvent::TextDelta {
                    content_index: index,
                    delta: raw.delta,
                    partial: self.partial.clone(),
                })
            }
            "text_end" => {
                let content = match &mut self.partial.content[index] {
                    ContentBlock::Text {
                        text,
                        text_signature,
                    } => {
                        if !raw.content_signature.is_empty() {
                            *text_signature = Some(raw.content_signature);
                        }
                        Some(text.clone())
                    }
                    _ => None,
                };
                content.map(|content| AssistantMessageEvent::TextEnd {
                    content_index: index,
                    content,
                    partial: self.partial.clone(),
                })
            }

            "thinking_start" => {
                self.partial.content[index] = ContentBlock::thinking("");
                Some(AssistantMessageEvent::ThinkingStart {
                    content_index: index,
                    partial: self.partial.clone(),
                })
            }
            "thinking_delta" => {
                let applied = match &mut self.partial.content[index] {
                    ContentBlock::Thinking { thinking, .. } => {
                        thinking.push_str(&raw.delta);
                        true
                    }
                    _ => false,
                };
                applied.then(|| AssistantMessageEvent::ThinkingDelta {
                    content_index: index,
                    delta: raw.delta,
                    partial: self.partial.clone(),
                })
            }
            "thinking_end" => {
                let content = match &mut self.partial.content[index] {
                    ContentBlock::Thinking {
                        thinking,
                        thinking_signature,
                    } => {
                        if !raw.content_signature.is_empty() {
                            *thinking_signature = Some(raw.content_signature);
                        }
                        Some(thinking.clone())
                    }
                    _ => None,
                };
                content.map(|content| AssistantMessageEvent::ThinkingEnd {
                    content_index: index,
                    content,
                    partial: self.partial.clone(),
                })
            }

            "toolcall_start" => {
                self.partial.content[index] =
                    ContentBlock::tool_call(raw.id, raw.tool_name, serde_json::Map::new());
                Some(AssistantMessageEvent::ToolCallStart {
                    content_index: index,
                    partial: self.partial.clone(),
                })
            }
            "toolcall_delta" => {
                let applied = match &mut self.partial.content[index] {
                    ContentBlock::ToolCall(tc) => {
                        tc.arguments = parse_streaming_json(&raw.delta);
                        true
                    }
                    _ => false,
                };
                applied.then(|| AssistantMessageEvent::ToolCallDelta {
                    content_index: index,
                    delta: raw.delta,
                    partial: self.partial.clone(),
                })
            }
            "toolcall_end" => match &self.partial.content[index] {
                ContentBlock::ToolCall(tc) => Some(AssistantMessageEvent::ToolCallEnd {
                    content_index: index,
                    tool_call: tc.clone(),
                    partial: self.partial.clone(),
                }),
                _ => None,
            },

            "done" => {
                let reason = raw.reason.unwrap_or(StopReason::Stop);
                self.partial.stop_reason = reason;
                if let Some(usage) = raw.usage {
                    self.partial.usage = usage;
                }
                Some(AssistantMessageEvent::Done {
                    reason,
                    message: self.partial.clone(),
                })
            }
            "error" => {
                let reason = raw.reason.unwrap_or(StopReason::Error);
                self.partial.stop_reason = reason;
                self.partial.error_message = Some(raw.error_message);
                if let Some(usage) = raw.usage {
                    self.partial.usage = usage;
                }
                Some(AssistantMessageEvent::Error {
                    reason,
                    error: self.partial.clone(),
                })
            }

            _ => None,
        }
    }

    /// Grow the content list so `index` is addressable. Indices only ever
    /// grow, so existing entries keep their positions.
    fn ensure_content_index(&mut self, index: usize) {
        while self.partial.content.len() <= index {
            self.partial.content.push(ContentBlock::text(""));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        Model {
            id: "test-model".into(),
            name: "Test".into(),
            api: "anthropic-messages".into(),
            provider: "anthropic".into(),
            ..Model::default()
        }
    }

    fn text_delta(index: usize, delta: &str) -> RawStreamEvent {
        RawStreamEvent {
            content_index: index,
            delta: delta.into(),
            ..RawStreamEvent::new("text_delta")
        }
    }

    #[test]
    fn accumulates_text_by_index() {
        let mut asm = MessageAssembler::new(&model());
        asm.apply(RawStreamEvent::new("start"));
        asm.apply(RawStreamEvent::new("text_start"));
        asm.apply(text_delta(0, "Hel"));
        let event = asm.apply(text_delta(0, "lo")).unwrap();

        assert_eq!(event.partial().text(), "Hello");
        assert!(matches!(
            event,
            AssistantMessageEvent::TextDelta { content_index: 0, .. }
        ));
    }

    #[test]
    fn text_end_attaches_signature() {
        let mut asm = MessageAssembler::new(&model());
        asm.apply(RawStreamEvent::new("text_start"));
        asm.apply(text_delta(0, "hi"));
        let event = asm
            .apply(RawStreamEvent {
                content_signature: "sig".into(),
                ..RawStreamEvent::new("text_end")
            })
            .unwrap();

        match event {
            AssistantMessageEvent::TextEnd { content, partial, .. } => {
                assert_eq!(content, "hi");
                assert_eq!(
                    partial.content[0],
                    ContentBlock::Text {
                        text: "hi".into(),
                        text_signature: Some("sig".into()),
                    }
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tool_call_arguments_reparse_from_accumulated_fragment() {
        let mut asm = MessageAssembler::new(&model());
        asm.apply(RawStreamEvent {
            id: "t1".into(),
            tool_name: "add".into(),
            ..RawStreamEvent::new("toolcall_start")
        });

        let mid = asm
            .apply(RawStreamEvent {
                delta: r#"{"a":2,"b":"#.into(),
                ..RawStreamEvent::new("toolcall_delta")
            })
            .unwrap();
        let tc = mid.partial().tool_calls()[0].clone();
        assert_eq!(tc.arguments.get("a"), Some(&serde_json::json!(2)));

        asm.apply(RawStreamEvent {
            delta: r#"{"a":2,"b":2}"#.into(),
            ..RawStreamEvent::new("toolcall_delta")
        });
        let end = asm.apply(RawStreamEvent::new("toolcall_end")).unwrap();
        match end {
            AssistantMessageEvent::ToolCallEnd { tool_call, .. } => {
                assert_eq!(tool_call.id, "t1");
                assert_eq!(tool_call.name, "add");
                assert_eq!(tool_call.arguments.get("b"), Some(&serde_json::json!(2)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn done_sets_stop_reason_and_usage() {
        let mut asm = MessageAssembler::new(&model());
        asm.apply(RawStreamEvent::new("start"));
        let event = asm
            .apply(RawStreamEvent {
                reason: Some(StopReason::ToolUse),
                usage: Some(Usage {
                    input: 10,
                    output: 5,
                    ..Usage::default()
                }),
                ..RawStreamEvent::new("done")
            })
            .unwrap();

        match event {
            AssistantMessageEvent::Done { reason, message } => {
                assert_eq!(reason, StopReason::ToolUse);
                assert_eq!(message.usage.input, 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn error_carries_message_text() {
        let mut asm = MessageAssembler::new(&model());
        let event = asm
            .apply(RawStreamEvent {
                reason: Some(StopReason::Error),
                error_message: "boom".into(),
                ..RawStreamEvent::new("error")
            })
            .unwrap();

        assert!(event.is_terminal());
        assert_eq!(
            event.final_message().unwrap().error_message.as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn mismatched_delta_kind_is_dropped() {
        let mut asm = MessageAssembler::new(&model());
        asm.apply(RawStreamEvent {
            id: "t1".into(),
            tool_name: "add".into(),
            ..RawStreamEvent::new("toolcall_start")
        });
        // Text delta aimed at a tool-call slot must not clobber it.
        assert!(asm.apply(text_delta(0, "junk")).is_none());
        assert!(asm.partial().content[0].as_tool_call().is_some());
    }

    #[test]
    fn unknown_event_kind_is_ignored() {
        let mut asm = MessageAssembler::new(&model());
        assert!(asm.apply(RawStreamEvent::new("ping")).is_none());
    }

    #[test]
    fn interleaved_thinking_and_text_keep_indices_stable() {
        let mut asm = MessageAssembler::new(&model());
        asm.apply(RawStreamEvent::new("thinking_start"));
        asm.apply(RawStreamEvent {
            content_index: 0,
            delta: "hmm".into(),
            ..RawStreamEvent::new("thinking_delta")
        });
        asm.apply(RawStreamEvent {
            content_index: 1,
            ..RawStreamEvent::new("text_start")
        });
        asm.apply(text_delta(1, "answer"));

        let partial = asm.partial();
        assert_eq!(partial.content.len(), 2);
        assert!(matches!(partial.content[0], ContentBlock::Thinking { .. }));
        assert_eq!(partial.text(), "answer");
    }
}
