//! Proxy transport — a stream function that relays LLM calls over SSE.

use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent_loop::StreamFn;
use crate::stream::assembler::{MessageAssembler, RawStreamEvent};
use crate::stream::{assistant_event_channel, AssistantEventSink, AssistantEventStream};
use crate::types::{Model, ModelContext, SimpleStreamOptions, StopReason};

use super::http::{parse_sse_data, shared_client};

/// Options for a proxy stream call.
#[derive(Debug, Clone)]
pub struct ProxyStreamOptions {
    pub options: SimpleStreamOptions,
    pub auth_token: String,
    pub proxy_url: String,
}

#[derive(Deserialize)]
struct ProxyErrorBody {
    error: Option<String>,
}

/// Stream an LLM response through a proxy server.
///
/// Sends `POST {proxy_url}/api/stream` and translates the SSE event lines
/// into normalised assistant events. Transport failures and non-2xx
/// responses become a synthetic `error` terminal event; cancellation ends
/// the stream with an `aborted` message.
pub fn stream_proxy(
    model: &Model,
    context: ModelContext,
    opts: ProxyStreamOptions,
    cancel: CancellationToken,
) -> AssistantEventStream {
    let (sink, stream) = assistant_event_channel();
    let model = model.clone();

    tokio::spawn(async move {
        let mut assembler = MessageAssembler::new(&model);

        let body = serde_json::json!({
            "model": model,
            "context": context,
            "options": {
                "temperature": opts.options.options.temperature,
                "maxTokens": opts.options.options.max_tokens,
                "reasoning": opts.options.reasoning,
            },
        });

        let response = shared_client()
            .post(format!("{}/api/stream", opts.proxy_url))
            .bearer_auth(&opts.auth_token)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                fail(&sink, assembler, format!("request failed: {err}")).await;
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ProxyErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .map(|e| format!("Proxy error: {e}"))
                .unwrap_or_else(|| format!("Proxy error: {status}"));
            fail(&sink, assembler, message).await;
            return;
        }

        let mut body_stream = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(model = %model.id, "proxy stream aborted");
                    abort(&sink, assembler).await;
                    return;
                }
                chunk = body_stream.next() => chunk,
            };

            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    fail(&sink, assembler, format!("stream failed: {err}")).await;
                    return;
                }
                None => break,
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let Some(data) = parse_sse_data(line.trim_end()) else {
                    continue;
                };
                let Ok(raw) = serde_json::from_str::<RawStreamEvent>(data) else {
                    continue;
                };
                if let Some(event) = assembler.apply(raw) {
                    sink.push(event).await;
                    if sink.is_closed() {
                        return;
                    }
                }
            }
        }

        // Body ended without a terminal event; resolve with what we have.
        sink.end(assembler.into_message());
    });

    stream
}

/// Adapt the proxy transport to the agent loop's [`StreamFn`] shape with a
/// fixed endpoint and auth token.
pub fn proxy_stream_fn(proxy_url: impl Into<String>, auth_token: impl Into<String>) -> StreamFn {
    let proxy_url = proxy_url.into();
    let auth_token = auth_token.into();
    std::sync::Arc::new(move |model, context, options, cancel| {
        stream_proxy(
            &model,
            context,
            ProxyStreamOptions {
                options,
                auth_token: auth_token.clone(),
                proxy_url: proxy_url.clone(),
            },
            cancel,
        )
    })
}

async fn fail(sink: &AssistantEventSink, mut assembler: MessageAssembler, message: String) {
    let event = assembler.fail(&message);
    sink.push(event).await;
    sink.end(assembler.into_message());
}

async fn abort(sink: &AssistantEventSink, mut assembler: MessageAssembler) {
    let event = assembler.apply(RawStreamEvent {
        reason: Some(StopReason::Aborted),
        error_message: "aborted".into(),
        ..RawStreamEvent::new("error")
    });
    if let Some(event) = event {
        sink.push(event).await;
    }
    sink.end(assembler.into_message());
}
