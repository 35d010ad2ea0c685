//! Shared test support: scripted stream functions and event capture.

use std::sync::{Arc, Mutex};

use tiller::agent_loop::StreamFn;
use tiller::stream::assembler::{MessageAssembler, RawStreamEvent};
use tiller::stream::assistant_event_channel;
use tiller::types::{Model, StopReason};

pub fn test_model() -> Model {
    Model {
        id: "stub-model".into(),
        name: "Stub".into(),
        api: "stub-api".into(),
        provider: "stub".into(),
        context_window: 200_000,
        max_tokens: 8_192,
        ..Model::default()
    }
}

/// A stream function that replays one scripted wire-event sequence per
/// call, through the real assembler.
pub fn scripted_stream_fn(scripts: Vec<Vec<RawStreamEvent>>) -> StreamFn {
    let scripts = Arc::new(Mutex::new(scripts.into_iter()));
    Arc::new(move |model, _ctx, _opts, _cancel| {
        let (sink, stream) = assistant_event_channel();
        let script = scripts
            .lock()
            .expect("script lock")
            .next()
            .unwrap_or_default();
        let mut assembler = MessageAssembler::new(&model);
        tokio::spawn(async move {
            for raw in script {
                if let Some(event) = assembler.apply(raw) {
                    sink.push(event).await;
                }
            }
            sink.end(assembler.into_message());
        });
        stream
    })
}

/// Script for a plain text response ending with `stop`.
pub fn text_script(text: &str) -> Vec<RawStreamEvent> {
    vec![
        RawStreamEvent::new("start"),
        RawStreamEvent::new("text_start"),
        RawStreamEvent {
            delta: text.into(),
            ..RawStreamEvent::new("text_delta")
        },
        RawStreamEvent::new("text_end"),
        RawStreamEvent {
            reason: Some(StopReason::Stop),
            ..RawStreamEvent::new("done")
        },
    ]
}

/// Script for a batch of tool calls ending with `toolUse`.
pub fn tool_call_script(calls: &[(&str, &str, &str)]) -> Vec<RawStreamEvent> {
    let mut script = vec![RawStreamEvent::new("start")];
    for (index, (id, name, args)) in calls.iter().enumerate() {
        script.push(RawStreamEvent {
            content_index: index,
            id: (*id).into(),
            tool_name: (*name).into(),
            ..RawStreamEvent::new("toolcall_start")
        });
        script.push(RawStreamEvent {
            content_index: index,
            delta: (*args).into(),
            ..RawStreamEvent::new("toolcall_delta")
        });
        script.push(RawStreamEvent {
            content_index: index,
            ..RawStreamEvent::new("toolcall_end")
        });
    }
    script.push(RawStreamEvent {
        reason: Some(StopReason::ToolUse),
        ..RawStreamEvent::new("done")
    });
    script
}
