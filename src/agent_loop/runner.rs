//! The agent loop — a nested state machine driving streaming and tools.
//!
//! The outer loop restarts when follow-up messages are queued; the inner
//! loop runs turns while tool calls or steering messages remain. Every
//! state transition is emitted on the run's [`AgentEventStream`]; the loop
//! never raises out of its task.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TillerError;
use crate::tools::{find_tool, validate_tool_arguments, AgentTool, AgentToolResult, ToolUpdateFn};
use crate::types::{
    now_ms, AssistantMessage, AssistantMessageEvent, ContentBlock, Message, MessageRole, Model,
    ModelContext, StopReason, ToolCall, ToolResultMessage, Usage,
};

use super::events::{agent_event_channel, AgentEvent, AgentEventSink, AgentEventStream};
use super::types::{default_convert_to_llm, AgentContext, AgentLoopConfig, AgentMessage, QueueFn, StreamFn};

/// Synthetic result text for tool calls abandoned after a steering
/// interrupt, so the model still sees a complete set of result pairs.
const SKIPPED_TOOL_TEXT: &str = "Skipped due to queued user message.";

/// Start the agent loop with new prompt messages.
///
/// The prompts are appended to the context, emitted as message events, and
/// the loop runs on its own task. The returned stream's final result is
/// the ordered list of messages the run produced.
pub fn agent_loop(
    prompts: Vec<AgentMessage>,
    agent_ctx: AgentContext,
    config: AgentLoopConfig,
    stream_fn: StreamFn,
    cancel: CancellationToken,
) -> AgentEventStream {
    let (sink, stream) = agent_event_channel();
    let sink = Arc::new(sink);

    tokio::spawn(async move {
        debug!(model = %config.model.id, prompts = prompts.len(), "agent loop start");

        let new_messages = prompts.clone();
        let mut ctx = agent_ctx;
        ctx.messages.extend(prompts.iter().cloned());

        sink.push(AgentEvent::AgentStart).await;
        sink.push(AgentEvent::TurnStart).await;

        for prompt in &prompts {
            sink.push(AgentEvent::MessageStart {
                message: prompt.clone(),
            })
            .await;
            sink.push(AgentEvent::MessageEnd {
                message: prompt.clone(),
            })
            .await;
        }

        run_loop(ctx, new_messages, config, sink, stream_fn, cancel).await;
    });

    stream
}

/// Continue the agent loop from existing context (e.g. after a restart,
/// with a trailing user message or tool results awaiting a response).
///
/// Fails when the context is empty or its last message is an assistant
/// message — there is nothing to respond to.
pub fn agent_loop_continue(
    agent_ctx: AgentContext,
    config: AgentLoopConfig,
    stream_fn: StreamFn,
    cancel: CancellationToken,
) -> Result<AgentEventStream, TillerError> {
    let Some(last) = agent_ctx.messages.last() else {
        return Err(TillerError::InvalidState(
            "cannot continue: no messages in context".into(),
        ));
    };
    if last.role() == MessageRole::Assistant {
        return Err(TillerError::InvalidState(
            "cannot continue from message role: assistant".into(),
        ));
    }

    let (sink, stream) = agent_event_channel();
    let sink = Arc::new(sink);

    tokio::spawn(async move {
        debug!(model = %config.model.id, "agent loop continue");

        sink.push(AgentEvent::AgentStart).await;
        sink.push(AgentEvent::TurnStart).await;

        run_loop(agent_ctx, Vec::new(), config, sink, stream_fn, cancel).await;
    });

    Ok(stream)
}

/// The shared main loop.
async fn run_loop(
    mut ctx: AgentContext,
    mut new_messages: Vec<AgentMessage>,
    config: AgentLoopConfig,
    sink: Arc<AgentEventSink>,
    stream_fn: StreamFn,
    cancel: CancellationToken,
) {
    let mut first_turn = true;

    // Steering queued before the run starts is drained into the first turn.
    let mut pending: Vec<AgentMessage> = match &config.get_steering_messages {
        Some(get_steering) => get_steering().await,
        None => Vec::new(),
    };

    // Outer loop: restarts when follow-up messages arrive.
    loop {
        let mut has_more_tool_calls = true;

        // Inner loop: turns, while tool calls or pending messages remain.
        while has_more_tool_calls || !pending.is_empty() {
            if first_turn {
                first_turn = false;
            } else {
                sink.push(AgentEvent::TurnStart).await;
            }

            for message in pending.drain(..) {
                sink.push(AgentEvent::MessageStart {
                    message: message.clone(),
                })
                .await;
                sink.push(AgentEvent::MessageEnd {
                    message: message.clone(),
                })
                .await;
                ctx.messages.push(message.clone());
                new_messages.push(message);
            }

            let message =
                match stream_assistant(&mut ctx, &config, &sink, &stream_fn, &cancel).await {
                    Ok(message) => message,
                    Err(err) => {
                        // Hooks or the stream function failed before producing
                        // a message; fabricate an error assistant and end.
                        let error_message = error_assistant_message(&config.model, err.to_string());
                        let agent_message: AgentMessage =
                            Message::Assistant(error_message).into();
                        new_messages.push(agent_message.clone());
                        sink.push(AgentEvent::TurnEnd {
                            message: agent_message,
                            tool_results: Vec::new(),
                        })
                        .await;
                        finish(&sink, new_messages).await;
                        return;
                    }
                };

            let agent_message: AgentMessage = Message::Assistant(message.clone()).into();
            new_messages.push(agent_message.clone());

            if matches!(message.stop_reason, StopReason::Error | StopReason::Aborted) {
                debug!(reason = %message.stop_reason, "agent loop terminating early");
                sink.push(AgentEvent::TurnEnd {
                    message: agent_message,
                    tool_results: Vec::new(),
                })
                .await;
                finish(&sink, new_messages).await;
                return;
            }

            let tool_calls: Vec<ToolCall> =
                message.tool_calls().into_iter().cloned().collect();
            has_more_tool_calls = !tool_calls.is_empty();

            let mut tool_results = Vec::new();
            let mut steering_after_tools = Vec::new();
            if has_more_tool_calls {
                let (results, steering) = execute_tool_calls(
                    &ctx.tools,
                    &tool_calls,
                    &sink,
                    config.get_steering_messages.as_ref(),
                    &cancel,
                )
                .await;
                tool_results = results;
                steering_after_tools = steering;

                for result in &tool_results {
                    let result_message: AgentMessage =
                        Message::ToolResult(result.clone()).into();
                    ctx.messages.push(result_message.clone());
                    new_messages.push(result_message);
                }
            }

            sink.push(AgentEvent::TurnEnd {
                message: agent_message,
                tool_results,
            })
            .await;

            // Steering gathered mid-batch takes priority; otherwise poll
            // the queue between turns.
            if !steering_after_tools.is_empty() {
                pending = steering_after_tools;
            } else if let Some(get_steering) = &config.get_steering_messages {
                pending = get_steering().await;
            }
        }

        // The agent would stop here. Follow-up messages restart the outer loop.
        if let Some(get_follow_up) = &config.get_follow_up_messages {
            let follow_up = get_follow_up().await;
            if !follow_up.is_empty() {
                debug!(count = follow_up.len(), "draining follow-up messages");
                pending = follow_up;
                continue;
            }
        }

        break;
    }

    finish(&sink, new_messages).await;
}

async fn finish(sink: &AgentEventSink, new_messages: Vec<AgentMessage>) {
    sink.push(AgentEvent::AgentEnd {
        messages: new_messages.clone(),
    })
    .await;
    sink.end(new_messages);
}

/// Stream a single LLM response, forwarding normalised events and keeping
/// the context's trailing partial message current.
async fn stream_assistant(
    ctx: &mut AgentContext,
    config: &AgentLoopConfig,
    sink: &AgentEventSink,
    stream_fn: &StreamFn,
    cancel: &CancellationToken,
) -> Result<AssistantMessage, TillerError> {
    let mut messages = ctx.messages.clone();

    if let Some(transform) = &config.transform_context {
        messages = transform(messages)
            .await
            .map_err(|e| TillerError::Stream(format!("transform_context: {e}")))?;
    }

    let llm_messages = match &config.convert_to_llm {
        Some(convert) => convert(&messages),
        None => default_convert_to_llm(&messages),
    }
    .map_err(|e| TillerError::Stream(format!("convert_to_llm: {e}")))?;

    let llm_ctx = ModelContext {
        system_prompt: ctx.system_prompt.clone(),
        messages: llm_messages,
        tools: ctx.tools.iter().map(|t| t.tool.clone()).collect(),
    };

    let mut options = config.options.clone();
    if let Some(get_api_key) = &config.get_api_key {
        if let Ok(key) = get_api_key(&config.model.provider).await {
            if !key.is_empty() {
                options.options.api_key = key;
            }
        }
    }

    let mut response = stream_fn(config.model.clone(), llm_ctx, options, cancel.clone());

    let mut added_partial = false;
    while let Some(event) = response.next().await {
        match event {
            AssistantMessageEvent::Start { ref partial } => {
                let agent_message: AgentMessage = Message::Assistant(partial.clone()).into();
                ctx.messages.push(agent_message.clone());
                added_partial = true;
                sink.push(AgentEvent::MessageStart {
                    message: agent_message,
                })
                .await;
            }
            AssistantMessageEvent::Done { .. } | AssistantMessageEvent::Error { .. } => break,
            delta => {
                // Deltas before `start` have no partial to apply to.
                if !added_partial {
                    continue;
                }
                let agent_message: AgentMessage =
                    Message::Assistant(delta.partial().clone()).into();
                *ctx.messages.last_mut().expect("partial message present") =
                    agent_message.clone();
                sink.push(AgentEvent::MessageUpdate {
                    message: agent_message,
                    event: delta,
                })
                .await;
            }
        }
    }

    let final_message = response
        .result()
        .await
        .ok_or_else(|| TillerError::Stream("stream ended without a result".into()))?;

    let final_agent_message: AgentMessage = Message::Assistant(final_message.clone()).into();
    if added_partial {
        *ctx.messages.last_mut().expect("partial message present") = final_agent_message.clone();
    } else {
        ctx.messages.push(final_agent_message.clone());
        sink.push(AgentEvent::MessageStart {
            message: final_agent_message.clone(),
        })
        .await;
    }
    sink.push(AgentEvent::MessageEnd {
        message: final_agent_message,
    })
    .await;

    Ok(final_message)
}

/// Run tool calls sequentially, polling steering after each. A non-empty
/// steering result abandons the remaining calls with synthetic skipped
/// results.
async fn execute_tool_calls(
    tools: &[AgentTool],
    tool_calls: &[ToolCall],
    sink: &Arc<AgentEventSink>,
    get_steering: Option<&QueueFn>,
    cancel: &CancellationToken,
) -> (Vec<ToolResultMessage>, Vec<AgentMessage>) {
    let mut results = Vec::new();
    let mut steering_messages = Vec::new();

    for (index, call) in tool_calls.iter().enumerate() {
        sink.push(AgentEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        })
        .await;

        let (result, is_error) = match find_tool(tools, &call.name) {
            None => (
                AgentToolResult::text(format!("Tool {} not found", call.name)),
                true,
            ),
            Some(tool) => match validate_tool_arguments(&tool.tool, call) {
                Err(report) => (AgentToolResult::text(report), true),
                Ok(args) => {
                    let on_update = tool_update_fn(sink.clone(), call);
                    match tool
                        .handler
                        .execute(cancel.child_token(), &call.id, args, on_update)
                        .await
                    {
                        Ok(result) => (result, false),
                        Err(err) => (AgentToolResult::text(err.to_string()), true),
                    }
                }
            },
        };

        sink.push(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: result.clone(),
            is_error,
        })
        .await;

        let result_message = ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: result.content,
            details: result.details,
            is_error,
            timestamp: now_ms(),
        };
        results.push(result_message.clone());
        emit_message_pair(sink, Message::ToolResult(result_message).into()).await;

        // A queued user message interrupts the batch.
        if let Some(get_steering) = get_steering {
            let steering = get_steering().await;
            if !steering.is_empty() {
                debug!(
                    skipped = tool_calls.len() - index - 1,
                    "steering interrupt during tool batch"
                );
                steering_messages = steering;
                for skipped in &tool_calls[index + 1..] {
                    results.push(skip_tool_call(skipped, sink).await);
                }
                break;
            }
        }
    }

    (results, steering_messages)
}

/// Emit a full start/end pair with a synthetic skipped result, so the next
/// turn carries a tool result for every call.
async fn skip_tool_call(call: &ToolCall, sink: &AgentEventSink) -> ToolResultMessage {
    let result = AgentToolResult::text(SKIPPED_TOOL_TEXT);

    sink.push(AgentEvent::ToolExecutionStart {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        args: call.arguments.clone(),
    })
    .await;
    sink.push(AgentEvent::ToolExecutionEnd {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result: result.clone(),
        is_error: true,
    })
    .await;

    let result_message = ToolResultMessage {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content: result.content,
        details: None,
        is_error: true,
        timestamp: now_ms(),
    };
    emit_message_pair(sink, Message::ToolResult(result_message.clone()).into()).await;

    result_message
}

async fn emit_message_pair(sink: &AgentEventSink, message: AgentMessage) {
    sink.push(AgentEvent::MessageStart {
        message: message.clone(),
    })
    .await;
    sink.push(AgentEvent::MessageEnd { message }).await;
}

fn tool_update_fn(sink: Arc<AgentEventSink>, call: &ToolCall) -> ToolUpdateFn {
    let tool_call_id = call.id.clone();
    let tool_name = call.name.clone();
    Arc::new(move |partial| {
        let sink = sink.clone();
        let tool_call_id = tool_call_id.clone();
        let tool_name = tool_name.clone();
        Box::pin(async move {
            sink.push(AgentEvent::ToolExecutionUpdate {
                tool_call_id,
                tool_name,
                partial,
            })
            .await;
        })
    })
}

fn error_assistant_message(model: &Model, error: String) -> AssistantMessage {
    AssistantMessage {
        content: vec![ContentBlock::text("")],
        api: model.api.clone(),
        provider: model.provider.clone(),
        model: model.id.clone(),
        usage: Usage::default(),
        stop_reason: StopReason::Error,
        error_message: Some(error),
        timestamp: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use serde_json::json;

    use crate::stream::assembler::{MessageAssembler, RawStreamEvent};
    use crate::stream::assistant_event_channel;
    use crate::types::Tool;

    fn test_model() -> Model {
        Model {
            id: "stub-model".into(),
            name: "Stub".into(),
            api: "stub-api".into(),
            provider: "stub".into(),
            ..Model::default()
        }
    }

    /// Stream function that replays one scripted wire-event sequence per
    /// call, through the real assembler.
    fn scripted_stream_fn(scripts: Vec<Vec<RawStreamEvent>>) -> StreamFn {
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

    fn text_script(text: &str) -> Vec<RawStreamEvent> {
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

    fn tool_call_script(calls: &[(&str, &str, &str)]) -> Vec<RawStreamEvent> {
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

    fn add_tool() -> AgentTool {
        AgentTool::from_fn(
            Tool {
                name: "add".into(),
                description: "add two numbers".into(),
                parameters: json!({
                    "type": "object",
                    "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                    "required": ["a", "b"],
                })
                .as_object()
                .cloned()
                .unwrap(),
            },
            "Add",
            |_cancel, _id, args, _on_update| async move {
                let a = args.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                let b = args.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(AgentToolResult::text((a + b).to_string()))
            },
        )
    }

    async fn collect_events(mut stream: AgentEventStream) -> (Vec<AgentEvent>, Vec<AgentMessage>) {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        let messages = stream.result().await.unwrap_or_default();
        (events, messages)
    }

    fn assert_brackets(events: &[AgentEvent]) {
        assert!(matches!(events.first(), Some(AgentEvent::AgentStart)));
        assert!(matches!(events.last(), Some(AgentEvent::AgentEnd { .. })));

        let turn_starts = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::TurnStart))
            .count();
        let turn_ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::TurnEnd { .. }))
            .count();
        assert_eq!(turn_starts, turn_ends, "unbalanced turn events");

        let message_starts = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::MessageStart { .. }))
            .count();
        let message_ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::MessageEnd { .. }))
            .count();
        assert_eq!(message_starts, message_ends, "unbalanced message events");

        let tool_starts = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolExecutionStart { .. }))
            .count();
        let tool_ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolExecutionEnd { .. }))
            .count();
        assert_eq!(tool_starts, tool_ends, "unbalanced tool events");
    }

    #[tokio::test]
    async fn text_only_run_produces_user_and_assistant() {
        let stream_fn = scripted_stream_fn(vec![text_script("Hello")]);
        let stream = agent_loop(
            vec![AgentMessage::user("Hi")],
            AgentContext::default(),
            AgentLoopConfig::new(test_model()),
            stream_fn,
            CancellationToken::new(),
        );

        let (events, messages) = collect_events(stream).await;
        assert_brackets(&events);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role(), MessageRole::User);
        let assistant = messages[1].message.as_assistant().expect("assistant");
        assert_eq!(assistant.text(), "Hello");
        assert_eq!(assistant.stop_reason, StopReason::Stop);

        // No tool results on the turn end.
        let turn_end = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::TurnEnd { tool_results, .. } => Some(tool_results.clone()),
                _ => None,
            })
            .expect("turn end");
        assert!(turn_end.is_empty());
    }

    #[tokio::test]
    async fn tool_call_turn_then_answer() {
        let stream_fn = scripted_stream_fn(vec![
            tool_call_script(&[("t1", "add", r#"{"a":2,"b":2}"#)]),
            text_script("4"),
        ]);
        let ctx = AgentContext {
            tools: vec![add_tool()],
            ..AgentContext::default()
        };
        let stream = agent_loop(
            vec![AgentMessage::user("2+2?")],
            ctx,
            AgentLoopConfig::new(test_model()),
            stream_fn,
            CancellationToken::new(),
        );

        let (events, messages) = collect_events(stream).await;
        assert_brackets(&events);

        // user, assistant(tool_call), tool_result, assistant("4")
        assert_eq!(messages.len(), 4);
        let result = messages[2].message.as_tool_result().expect("tool result");
        assert_eq!(result.tool_call_id, "t1");
        assert!(!result.is_error);
        assert_eq!(result.content, vec![ContentBlock::text("4")]);
        let final_answer = messages[3].message.as_assistant().expect("assistant");
        assert_eq!(final_answer.text(), "4");
    }

    #[tokio::test]
    async fn missing_tool_yields_error_result_and_run_continues() {
        let stream_fn = scripted_stream_fn(vec![
            tool_call_script(&[("t1", "vanished", "{}")]),
            text_script("recovered"),
        ]);
        let stream = agent_loop(
            vec![AgentMessage::user("go")],
            AgentContext::default(),
            AgentLoopConfig::new(test_model()),
            stream_fn,
            CancellationToken::new(),
        );

        let (events, messages) = collect_events(stream).await;
        assert_brackets(&events);

        let result = messages[2].message.as_tool_result().expect("tool result");
        assert!(result.is_error);
        assert_eq!(
            result.content,
            vec![ContentBlock::text("Tool vanished not found")]
        );
    }

    #[tokio::test]
    async fn validation_failure_skips_execute() {
        let executed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = executed.clone();
        let strict_tool = AgentTool::from_fn(
            Tool {
                name: "add".into(),
                description: "add".into(),
                parameters: json!({ "required": ["a", "b"] }).as_object().cloned().unwrap(),
            },
            "Add",
            move |_cancel, _id, _args, _on_update| {
                let seen = seen.clone();
                async move {
                    seen.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(AgentToolResult::text("ran"))
                }
            },
        );

        let stream_fn = scripted_stream_fn(vec![
            tool_call_script(&[("t1", "add", r#"{"a":1}"#)]),
            text_script("done"),
        ]);
        let ctx = AgentContext {
            tools: vec![strict_tool],
            ..AgentContext::default()
        };
        let stream = agent_loop(
            vec![AgentMessage::user("add")],
            ctx,
            AgentLoopConfig::new(test_model()),
            stream_fn,
            CancellationToken::new(),
        );

        let (events, messages) = collect_events(stream).await;
        assert_brackets(&events);
        assert!(!executed.load(std::sync::atomic::Ordering::SeqCst));

        let result = messages[2].message.as_tool_result().expect("tool result");
        assert!(result.is_error);
        match &result.content[0] {
            ContentBlock::Text { text, .. } => {
                assert!(text.contains("missing required: b"));
                assert!(text.contains("Received arguments"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn steering_mid_batch_skips_remaining_calls() {
        let steering_queue: Arc<Mutex<Vec<AgentMessage>>> = Arc::new(Mutex::new(Vec::new()));

        // The first tool queues a steering message while it runs.
        let queue = steering_queue.clone();
        let work_tool = AgentTool::from_fn(
            Tool {
                name: "work".into(),
                description: "work".into(),
                parameters: json!({}).as_object().cloned().unwrap(),
            },
            "Work",
            move |_cancel, id, _args, _on_update| {
                let queue = queue.clone();
                async move {
                    if id == "t1" {
                        queue
                            .lock()
                            .expect("queue lock")
                            .push(AgentMessage::user("stop, do X"));
                    }
                    Ok(AgentToolResult::text(format!("{id} done")))
                }
            },
        );

        let provider_queue = steering_queue.clone();
        let get_steering: QueueFn = Arc::new(move || {
            let queue = provider_queue.clone();
            Box::pin(async move { std::mem::take(&mut *queue.lock().expect("queue lock")) })
        });

        let stream_fn = scripted_stream_fn(vec![
            tool_call_script(&[("t1", "work", "{}"), ("t2", "work", "{}"), ("t3", "work", "{}")]),
            text_script("redirected"),
        ]);
        let ctx = AgentContext {
            tools: vec![work_tool],
            ..AgentContext::default()
        };
        let mut config = AgentLoopConfig::new(test_model());
        config.get_steering_messages = Some(get_steering);

        let stream = agent_loop(
            vec![AgentMessage::user("do three things")],
            ctx,
            config,
            stream_fn,
            CancellationToken::new(),
        );

        let (events, messages) = collect_events(stream).await;
        assert_brackets(&events);

        let results: Vec<&ToolResultMessage> = messages
            .iter()
            .filter_map(|m| m.message.as_tool_result())
            .collect();
        assert_eq!(results.len(), 3, "skip symmetry: one result per call");
        assert!(!results[0].is_error);
        for skipped in &results[1..] {
            assert!(skipped.is_error);
            assert_eq!(
                skipped.content,
                vec![ContentBlock::text(SKIPPED_TOOL_TEXT)]
            );
        }

        // The steering message entered the next turn before the final answer.
        let steering_position = messages
            .iter()
            .position(|m| {
                m.role() == MessageRole::User && m.message != messages[0].message
            })
            .expect("steering message in ledger");
        assert!(steering_position > 3);
        let last = messages.last().unwrap().message.as_assistant().unwrap();
        assert_eq!(last.text(), "redirected");
    }

    #[tokio::test]
    async fn error_stream_ends_run() {
        let script = vec![
            RawStreamEvent::new("start"),
            RawStreamEvent {
                reason: Some(StopReason::Error),
                error_message: "upstream exploded".into(),
                ..RawStreamEvent::new("error")
            },
        ];
        let stream = agent_loop(
            vec![AgentMessage::user("hi")],
            AgentContext::default(),
            AgentLoopConfig::new(test_model()),
            scripted_stream_fn(vec![script]),
            CancellationToken::new(),
        );

        let (events, messages) = collect_events(stream).await;
        assert_brackets(&events);

        assert_eq!(messages.len(), 2);
        let assistant = messages[1].message.as_assistant().unwrap();
        assert_eq!(assistant.stop_reason, StopReason::Error);
        assert_eq!(assistant.error_message.as_deref(), Some("upstream exploded"));
    }

    #[tokio::test]
    async fn follow_up_restarts_outer_loop_once() {
        let follow_ups: Arc<Mutex<Vec<AgentMessage>>> =
            Arc::new(Mutex::new(vec![AgentMessage::user("and then?")]));
        let queue = follow_ups.clone();
        let get_follow_up: QueueFn = Arc::new(move || {
            let queue = queue.clone();
            Box::pin(async move { std::mem::take(&mut *queue.lock().expect("queue lock")) })
        });

        let stream_fn =
            scripted_stream_fn(vec![text_script("first"), text_script("second")]);
        let mut config = AgentLoopConfig::new(test_model());
        config.get_follow_up_messages = Some(get_follow_up);

        let stream = agent_loop(
            vec![AgentMessage::user("hi")],
            AgentContext::default(),
            config,
            stream_fn,
            CancellationToken::new(),
        );

        let (events, messages) = collect_events(stream).await;
        assert_brackets(&events);

        let agent_ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::AgentEnd { .. }))
            .count();
        assert_eq!(agent_ends, 1);

        // user, assistant(first), follow-up user, assistant(second)
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[3].message.as_assistant().unwrap().text(),
            "second"
        );
    }

    #[tokio::test]
    async fn message_ledger_matches_message_end_events() {
        let stream_fn = scripted_stream_fn(vec![
            tool_call_script(&[("t1", "add", r#"{"a":2,"b":3}"#)]),
            text_script("5"),
        ]);
        let ctx = AgentContext {
            tools: vec![add_tool()],
            ..AgentContext::default()
        };
        let stream = agent_loop(
            vec![AgentMessage::user("2+3?")],
            ctx,
            AgentLoopConfig::new(test_model()),
            stream_fn,
            CancellationToken::new(),
        );

        let (events, messages) = collect_events(stream).await;

        let ended: Vec<AgentMessage> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::MessageEnd { message } => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, ended);
    }

    #[tokio::test]
    async fn continue_rejects_trailing_assistant() {
        let assistant = error_assistant_message(&test_model(), "n/a".into());
        let ctx = AgentContext {
            messages: vec![Message::Assistant(assistant).into()],
            ..AgentContext::default()
        };

        let err = agent_loop_continue(
            ctx,
            AgentLoopConfig::new(test_model()),
            scripted_stream_fn(vec![]),
            CancellationToken::new(),
        )
        .err()
        .expect("must reject");
        assert!(matches!(err, TillerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn continue_rejects_empty_context() {
        let err = agent_loop_continue(
            AgentContext::default(),
            AgentLoopConfig::new(test_model()),
            scripted_stream_fn(vec![]),
            CancellationToken::new(),
        )
        .err()
        .expect("must reject");
        assert!(matches!(err, TillerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn continue_streams_from_trailing_user_message() {
        let ctx = AgentContext {
            messages: vec![AgentMessage::user("pending question")],
            ..AgentContext::default()
        };
        let stream = agent_loop_continue(
            ctx,
            AgentLoopConfig::new(test_model()),
            scripted_stream_fn(vec![text_script("answer")]),
            CancellationToken::new(),
        )
        .expect("continue");

        let (events, messages) = collect_events(stream).await;
        assert_brackets(&events);

        // Only the newly produced assistant message is in the result.
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.as_assistant().unwrap().text(), "answer");
    }

    #[tokio::test]
    async fn tool_updates_are_forwarded() {
        let progress_tool = AgentTool::from_fn(
            Tool {
                name: "slow".into(),
                description: "slow".into(),
                parameters: json!({}).as_object().cloned().unwrap(),
            },
            "Slow",
            |_cancel, _id, _args, on_update| async move {
                on_update(AgentToolResult::text("halfway")).await;
                Ok(AgentToolResult::text("complete"))
            },
        );

        let stream_fn = scripted_stream_fn(vec![
            tool_call_script(&[("t1", "slow", "{}")]),
            text_script("ok"),
        ]);
        let ctx = AgentContext {
            tools: vec![progress_tool],
            ..AgentContext::default()
        };
        let stream = agent_loop(
            vec![AgentMessage::user("run")],
            ctx,
            AgentLoopConfig::new(test_model()),
            stream_fn,
            CancellationToken::new(),
        );

        let (events, _messages) = collect_events(stream).await;
        let update = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolExecutionUpdate { partial, .. } => Some(partial.clone()),
                _ => None,
            })
            .expect("tool execution update");
        assert_eq!(update.content, vec![ContentBlock::text("halfway")]);
    }
}
