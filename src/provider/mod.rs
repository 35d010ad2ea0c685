//! Provider registry and streaming entry points.
//!
//! The core's single extension point is the stream function: given a model
//! descriptor, context, and options, it returns an event stream whose final
//! result is the finished assistant message. Providers register theirs per
//! API id; the proxy transport in [`proxy`] is one built-in implementation.

pub mod env;
pub mod http;
pub mod proxy;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, TillerError};
use crate::stream::AssistantEventStream;
use crate::types::{Api, AssistantMessage, Model, ModelContext, SimpleStreamOptions, StreamOptions};

pub use env::env_api_key;

/// A provider's streaming function.
pub type StreamFunction = Arc<
    dyn Fn(&Model, ModelContext, StreamOptions, CancellationToken) -> AssistantEventStream
        + Send
        + Sync,
>;

/// The higher-level variant that accepts reasoning options.
pub type SimpleStreamFunction = Arc<
    dyn Fn(&Model, ModelContext, SimpleStreamOptions, CancellationToken) -> AssistantEventStream
        + Send
        + Sync,
>;

/// A provider's stream functions for a specific API.
#[derive(Clone)]
pub struct ApiProvider {
    pub api: Api,
    pub stream: Option<StreamFunction>,
    pub stream_simple: Option<SimpleStreamFunction>,
}

struct RegisteredProvider {
    provider: ApiProvider,
    source_id: String,
}

type Registry = RwLock<HashMap<Api, RegisteredProvider>>;

static PROVIDER_REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    PROVIDER_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a provider for its API id. `source_id` lets a batch of
/// providers be unregistered together.
pub fn register_api_provider(provider: ApiProvider, source_id: impl Into<String>) {
    registry().write().expect("provider registry lock").insert(
        provider.api.clone(),
        RegisteredProvider {
            provider,
            source_id: source_id.into(),
        },
    );
}

/// The registered provider for an API, if any.
pub fn get_api_provider(api: &str) -> Option<ApiProvider> {
    registry()
        .read()
        .expect("provider registry lock")
        .get(api)
        .map(|r| r.provider.clone())
}

/// Remove all providers registered under `source_id`.
pub fn unregister_api_providers(source_id: &str) {
    registry()
        .write()
        .expect("provider registry lock")
        .retain(|_, r| r.source_id != source_id);
}

/// Remove every registered provider.
pub fn clear_api_providers() {
    registry()
        .write()
        .expect("provider registry lock")
        .clear();
}

/// Start a streaming call through the registered provider for `model.api`.
pub fn stream(
    model: &Model,
    context: ModelContext,
    options: StreamOptions,
    cancel: CancellationToken,
) -> Result<AssistantEventStream> {
    let provider = get_api_provider(&model.api).ok_or_else(|| TillerError::Provider {
        provider: model.provider.clone(),
        message: format!("no API provider registered for api: {}", model.api),
    })?;
    let stream_fn = provider.stream.ok_or_else(|| TillerError::Provider {
        provider: model.provider.clone(),
        message: format!("provider for {} has no stream function", model.api),
    })?;
    Ok(stream_fn(model, context, options, cancel))
}

/// Start a streaming call with reasoning options.
pub fn stream_simple(
    model: &Model,
    context: ModelContext,
    options: SimpleStreamOptions,
    cancel: CancellationToken,
) -> Result<AssistantEventStream> {
    let provider = get_api_provider(&model.api).ok_or_else(|| TillerError::Provider {
        provider: model.provider.clone(),
        message: format!("no API provider registered for api: {}", model.api),
    })?;
    let stream_fn = provider.stream_simple.ok_or_else(|| TillerError::Provider {
        provider: model.provider.clone(),
        message: format!("provider for {} has no simple stream function", model.api),
    })?;
    Ok(stream_fn(model, context, options, cancel))
}

/// Perform a streaming call and block until the final message.
pub async fn complete(
    model: &Model,
    context: ModelContext,
    options: StreamOptions,
    cancel: CancellationToken,
) -> Result<AssistantMessage> {
    let s = stream(model, context, options, cancel)?;
    s.wait()
        .await
        .ok_or_else(|| TillerError::Stream("stream ended without a result".into()))
}

/// Perform a simple streaming call and block until the final message.
pub async fn complete_simple(
    model: &Model,
    context: ModelContext,
    options: SimpleStreamOptions,
    cancel: CancellationToken,
) -> Result<AssistantMessage> {
    let s = stream_simple(model, context, options, cancel)?;
    s.wait()
        .await
        .ok_or_else(|| TillerError::Stream("stream ended without a result".into()))
}
