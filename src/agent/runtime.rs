//! High-level agent runtime wrapping the agent loop.
//!
//! Owns the observable [`AgentState`], the steering and follow-up queues,
//! and the subscriber registry. The loop itself works on a snapshot of the
//! context; state converges one way, loop → event stream → observer task →
//! state update.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent_loop::{
    agent_loop, agent_loop_continue, AgentContext, AgentEvent, AgentLoopConfig, AgentMessage,
    ConvertToLlmFn, GetApiKeyFn, QueueFn, StreamFn, TransformContextFn,
};
use crate::error::{Result, TillerError};
use crate::provider::env_api_key;
use crate::tools::AgentTool;
use crate::types::{
    ContentBlock, Message, MessageRole, Model, SimpleStreamOptions, StreamOptions,
    ThinkingBudgets, ThinkingLevel,
};

/// Dequeue behaviour for the steering and follow-up queues.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum QueueMode {
    /// Dequeue drains the whole buffer.
    All,
    /// Dequeue returns only the head.
    #[default]
    OneAtATime,
}

/// Observable agent state. Partial messages live only in `stream_message`;
/// `messages` holds finalised messages exclusively.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub system_prompt: String,
    pub model: Option<Model>,
    pub thinking_level: ThinkingLevel,
    pub tools: Vec<AgentTool>,
    pub messages: Vec<AgentMessage>,
    pub is_streaming: bool,
    pub stream_message: Option<AgentMessage>,
    pub pending_tool_calls: HashSet<String>,
    pub last_error: Option<String>,
}

/// Configuration for creating an [`Agent`].
#[derive(Clone, Default)]
pub struct AgentOptions {
    pub initial_state: Option<AgentState>,
    pub convert_to_llm: Option<ConvertToLlmFn>,
    pub transform_context: Option<TransformContextFn>,
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
    pub stream_fn: Option<StreamFn>,
    pub session_id: Option<String>,
    /// Resolves an API key per run. Defaults to environment lookup.
    pub get_api_key: Option<GetApiKeyFn>,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub max_retry_delay_ms: Option<u64>,
}

type ListenerFn = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Unsubscribe handle returned by [`Agent::subscribe`].
pub struct Subscription {
    id: u64,
    inner: Weak<AgentInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().expect("listener lock").remove(&self.id);
        }
    }
}

struct AgentInner {
    state: Mutex<AgentState>,
    listeners: Mutex<BTreeMap<u64, ListenerFn>>,
    next_listener_id: AtomicU64,
    steering_queue: Mutex<Vec<AgentMessage>>,
    follow_up_queue: Mutex<Vec<AgentMessage>>,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,
    cancel: Mutex<Option<CancellationToken>>,
    /// True while a run's observer task is alive. Outlives
    /// `AgentState::is_streaming` by the tail of listener dispatch.
    running: Mutex<bool>,
    idle: Notify,
    convert_to_llm: Option<ConvertToLlmFn>,
    transform_context: Option<TransformContextFn>,
    stream_fn: Option<StreamFn>,
    session_id: Option<String>,
    get_api_key: Option<GetApiKeyFn>,
    thinking_budgets: Option<ThinkingBudgets>,
    max_retry_delay_ms: Option<u64>,
}

/// An agent managing a conversation loop with an LLM.
///
/// All methods take `&self`; the agent is cheap to clone and safe to share
/// across tasks. No lock is held during I/O or listener callbacks.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        let state = options.initial_state.unwrap_or_default();
        Self {
            inner: Arc::new(AgentInner {
                state: Mutex::new(state),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(0),
                steering_queue: Mutex::new(Vec::new()),
                follow_up_queue: Mutex::new(Vec::new()),
                steering_mode: options.steering_mode,
                follow_up_mode: options.follow_up_mode,
                cancel: Mutex::new(None),
                running: Mutex::new(false),
                idle: Notify::new(),
                convert_to_llm: options.convert_to_llm,
                transform_context: options.transform_context,
                stream_fn: options.stream_fn,
                session_id: options.session_id,
                get_api_key: options.get_api_key,
                thinking_budgets: options.thinking_budgets,
                max_retry_delay_ms: options.max_retry_delay_ms,
            }),
        }
    }

    /// A snapshot of the current agent state.
    pub fn state(&self) -> AgentState {
        self.inner.state.lock().expect("state lock").clone()
    }

    /// Register a listener for agent events. Listeners are invoked in
    /// registration order, outside the state lock.
    pub fn subscribe(&self, listener: impl Fn(AgentEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .expect("listener lock")
            .insert(id, Arc::new(listener));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.inner.state.lock().expect("state lock").system_prompt = prompt.into();
    }

    pub fn set_model(&self, model: Model) {
        self.inner.state.lock().expect("state lock").model = Some(model);
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.inner.state.lock().expect("state lock").thinking_level = level;
    }

    pub fn set_tools(&self, tools: Vec<AgentTool>) {
        self.inner.state.lock().expect("state lock").tools = tools;
    }

    pub fn replace_messages(&self, messages: Vec<AgentMessage>) {
        self.inner.state.lock().expect("state lock").messages = messages;
    }

    pub fn append_message(&self, message: AgentMessage) {
        self.inner
            .state
            .lock()
            .expect("state lock")
            .messages
            .push(message);
    }

    pub fn clear_messages(&self) {
        self.inner.state.lock().expect("state lock").messages.clear();
    }

    /// Queue a steering message to interrupt the agent mid-run. Drained
    /// between tool calls and between turns.
    pub fn steer(&self, message: AgentMessage) {
        self.inner
            .steering_queue
            .lock()
            .expect("queue lock")
            .push(message);
    }

    /// Queue a follow-up message, processed after the run would otherwise end.
    pub fn follow_up(&self, message: AgentMessage) {
        self.inner
            .follow_up_queue
            .lock()
            .expect("queue lock")
            .push(message);
    }

    pub fn clear_steering_queue(&self) {
        self.inner.steering_queue.lock().expect("queue lock").clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.inner.follow_up_queue.lock().expect("queue lock").clear();
    }

    pub fn clear_all_queues(&self) {
        self.clear_steering_queue();
        self.clear_follow_up_queue();
    }

    pub fn has_queued_messages(&self) -> bool {
        !self.inner.steering_queue.lock().expect("queue lock").is_empty()
            || !self
                .inner
                .follow_up_queue
                .lock()
                .expect("queue lock")
                .is_empty()
    }

    /// Cancel the current run. Queued messages are kept for the next
    /// `continue_run`.
    pub fn abort(&self) {
        if let Some(cancel) = self.inner.cancel.lock().expect("cancel lock").as_ref() {
            debug!("aborting agent run");
            cancel.cancel();
        }
    }

    /// Wait until the agent is no longer running.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !*self.inner.running.lock().expect("running lock") {
                return;
            }
            notified.await;
        }
    }

    /// Clear messages, queues, and streaming state.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            state.messages.clear();
            state.is_streaming = false;
            state.stream_message = None;
            state.pending_tool_calls.clear();
            state.last_error = None;
        }
        self.clear_all_queues();
    }

    /// Send a text prompt and start the loop.
    pub fn prompt(&self, text: impl Into<String>) -> Result<()> {
        self.prompt_messages(vec![AgentMessage::user(text)])
    }

    /// Send a text prompt with attached image blocks.
    pub fn prompt_with_images(
        &self,
        text: impl Into<String>,
        images: Vec<ContentBlock>,
    ) -> Result<()> {
        let mut content = vec![ContentBlock::text(text)];
        content.extend(images);
        self.prompt_messages(vec![Message::user_with_content(content).into()])
    }

    /// Send pre-built messages as the initial batch.
    pub fn prompt_messages(&self, messages: Vec<AgentMessage>) -> Result<()> {
        self.run_loop(Some(messages), false)
    }

    /// Resume from the current context.
    ///
    /// When the last message is an assistant message, one queued steering
    /// (or else follow-up) batch is dequeued and used as the initial batch;
    /// fails when nothing is queued. Otherwise the loop continues directly
    /// from the pending user message or tool results.
    pub fn continue_run(&self) -> Result<()> {
        let last_role = {
            let state = self.inner.state.lock().expect("state lock");
            if state.is_streaming {
                return Err(TillerError::InvalidState(
                    "agent is already processing".into(),
                ));
            }
            let Some(last) = state.messages.last() else {
                return Err(TillerError::InvalidState(
                    "no messages to continue from".into(),
                ));
            };
            last.role()
        };

        if last_role == MessageRole::Assistant {
            let steering = dequeue(&self.inner.steering_queue, self.inner.steering_mode);
            if !steering.is_empty() {
                return self.run_loop(Some(steering), true);
            }
            let follow_up = dequeue(&self.inner.follow_up_queue, self.inner.follow_up_mode);
            if !follow_up.is_empty() {
                return self.run_loop(Some(follow_up), false);
            }
            return Err(TillerError::InvalidState(
                "cannot continue from message role: assistant".into(),
            ));
        }

        self.run_loop(None, false)
    }

    fn run_loop(
        &self,
        messages: Option<Vec<AgentMessage>>,
        skip_initial_steering_poll: bool,
    ) -> Result<()> {
        let (agent_ctx, model, cancel) = {
            let mut state = self.inner.state.lock().expect("state lock");
            if state.is_streaming {
                return Err(TillerError::InvalidState(
                    "agent is already processing a prompt".into(),
                ));
            }
            let Some(model) = state.model.clone() else {
                return Err(TillerError::Configuration("no model configured".into()));
            };
            if self.inner.stream_fn.is_none() {
                return Err(TillerError::Configuration(
                    "no stream function configured".into(),
                ));
            }

            state.is_streaming = true;
            state.stream_message = None;
            state.pending_tool_calls.clear();
            state.last_error = None;

            let cancel = CancellationToken::new();
            *self.inner.cancel.lock().expect("cancel lock") = Some(cancel.clone());
            *self.inner.running.lock().expect("running lock") = true;

            (
                AgentContext {
                    system_prompt: state.system_prompt.clone(),
                    messages: state.messages.clone(),
                    tools: state.tools.clone(),
                },
                model,
                cancel,
            )
        };
        let stream_fn = self.inner.stream_fn.clone().expect("checked above");

        let config = self.build_config(model, skip_initial_steering_poll);

        let stream = match messages {
            Some(messages) => agent_loop(messages, agent_ctx, config, stream_fn, cancel),
            None => match agent_loop_continue(agent_ctx, config, stream_fn, cancel) {
                Ok(stream) => stream,
                Err(err) => {
                    self.finish_run();
                    return Err(err);
                }
            },
        };

        // Observe the run on its own task; listener callbacks never run on
        // the loop task and never under the state lock.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(event) = stream.next().await {
                inner.apply_event(&event);

                let listeners: Vec<ListenerFn> = inner
                    .listeners
                    .lock()
                    .expect("listener lock")
                    .values()
                    .cloned()
                    .collect();
                for listener in listeners {
                    listener(event.clone());
                }
            }

            {
                let mut state = inner.state.lock().expect("state lock");
                state.is_streaming = false;
                state.stream_message = None;
                state.pending_tool_calls.clear();
            }
            *inner.cancel.lock().expect("cancel lock") = None;
            *inner.running.lock().expect("running lock") = false;
            inner.idle.notify_waiters();
        });

        Ok(())
    }

    fn build_config(&self, model: Model, skip_initial_steering_poll: bool) -> AgentLoopConfig {
        let reasoning = {
            let state = self.inner.state.lock().expect("state lock");
            match state.thinking_level {
                ThinkingLevel::Off => None,
                level => Some(level),
            }
        };

        let skip = Arc::new(AtomicBool::new(skip_initial_steering_poll));
        let steering_inner = self.inner.clone();
        let get_steering: QueueFn = Arc::new(move || {
            let inner = steering_inner.clone();
            let skip = skip.clone();
            Box::pin(async move {
                if skip.swap(false, Ordering::SeqCst) {
                    return Vec::new();
                }
                dequeue(&inner.steering_queue, inner.steering_mode)
            })
        });

        let follow_up_inner = self.inner.clone();
        let get_follow_up: QueueFn = Arc::new(move || {
            let inner = follow_up_inner.clone();
            Box::pin(async move { dequeue(&inner.follow_up_queue, inner.follow_up_mode) })
        });

        let get_api_key = self.inner.get_api_key.clone().or_else(|| {
            let env_lookup: GetApiKeyFn = Arc::new(|provider: &str| {
                let key = env_api_key(provider);
                Box::pin(async move {
                    key.ok_or_else(|| {
                        TillerError::Configuration("no API key in environment".into())
                    })
                })
            });
            Some(env_lookup)
        });

        AgentLoopConfig {
            model,
            options: SimpleStreamOptions {
                options: StreamOptions {
                    session_id: self.inner.session_id.clone(),
                    max_retry_delay_ms: self.inner.max_retry_delay_ms,
                    ..StreamOptions::default()
                },
                reasoning,
                thinking_budgets: self.inner.thinking_budgets.clone(),
            },
            convert_to_llm: self.inner.convert_to_llm.clone(),
            transform_context: self.inner.transform_context.clone(),
            get_api_key,
            get_steering_messages: Some(get_steering),
            get_follow_up_messages: Some(get_follow_up),
        }
    }

    fn finish_run(&self) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            state.is_streaming = false;
        }
        *self.inner.cancel.lock().expect("cancel lock") = None;
        *self.inner.running.lock().expect("running lock") = false;
        self.inner.idle.notify_waiters();
    }
}

impl AgentInner {
    fn apply_event(&self, event: &AgentEvent) {
        let mut state = self.state.lock().expect("state lock");
        match event {
            AgentEvent::MessageStart { message } | AgentEvent::MessageUpdate { message, .. } => {
                state.stream_message = Some(message.clone());
            }
            AgentEvent::MessageEnd { message } => {
                state.stream_message = None;
                state.messages.push(message.clone());
            }
            AgentEvent::ToolExecutionStart { tool_call_id, .. } => {
                state.pending_tool_calls.insert(tool_call_id.clone());
            }
            AgentEvent::ToolExecutionEnd { tool_call_id, .. } => {
                state.pending_tool_calls.remove(tool_call_id);
            }
            AgentEvent::TurnEnd { message, .. } => {
                if let Some(assistant) = message.message.as_assistant() {
                    if let Some(error) = &assistant.error_message {
                        if !error.is_empty() {
                            state.last_error = Some(error.clone());
                        }
                    }
                }
            }
            AgentEvent::AgentEnd { .. } => {
                state.is_streaming = false;
                state.stream_message = None;
            }
            _ => {}
        }
    }
}

fn dequeue(queue: &Mutex<Vec<AgentMessage>>, mode: QueueMode) -> Vec<AgentMessage> {
    let mut queue = queue.lock().expect("queue lock");
    match mode {
        QueueMode::All => std::mem::take(&mut *queue),
        QueueMode::OneAtATime => {
            if queue.is_empty() {
                Vec::new()
            } else {
                vec![queue.remove(0)]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent() -> Agent {
        Agent::new(AgentOptions::default())
    }

    #[tokio::test]
    async fn new_agent_starts_idle() {
        let agent = test_agent();
        let state = agent.state();
        assert!(!state.is_streaming);
        assert!(state.messages.is_empty());
        assert!(state.pending_tool_calls.is_empty());
        assert_eq!(state.thinking_level, ThinkingLevel::Off);
    }

    #[tokio::test]
    async fn prompt_without_model_fails() {
        let agent = test_agent();
        let err = agent.prompt("hi").unwrap_err();
        assert!(matches!(err, TillerError::Configuration(_)));
    }

    #[tokio::test]
    async fn prompt_without_stream_fn_fails() {
        let agent = test_agent();
        agent.set_model(Model::default());
        let err = agent.prompt("hi").unwrap_err();
        assert!(matches!(err, TillerError::Configuration(_)));
    }

    #[tokio::test]
    async fn queued_messages_accumulate() {
        let agent = test_agent();
        agent.steer(AgentMessage::user("a"));
        agent.steer(AgentMessage::user("b"));
        agent.follow_up(AgentMessage::user("c"));

        assert!(agent.has_queued_messages());
        assert_eq!(agent.inner.steering_queue.lock().unwrap().len(), 2);
        assert_eq!(agent.inner.follow_up_queue.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_clears_state_and_queues() {
        let agent = test_agent();
        agent.append_message(AgentMessage::user("hello"));
        agent.steer(AgentMessage::user("steer"));
        agent.follow_up(AgentMessage::user("follow"));
        agent.inner.state.lock().unwrap().last_error = Some("boom".into());

        agent.reset();

        let state = agent.state();
        assert!(state.messages.is_empty());
        assert!(state.last_error.is_none());
        assert!(!agent.has_queued_messages());
    }

    #[tokio::test]
    async fn abort_without_run_is_a_no_op() {
        let agent = test_agent();
        agent.abort();
        assert!(!agent.state().is_streaming);
    }

    #[tokio::test]
    async fn wait_for_idle_returns_immediately_when_idle() {
        let agent = test_agent();
        agent.wait_for_idle().await;
    }

    #[tokio::test]
    async fn continue_without_messages_fails() {
        let agent = test_agent();
        agent.set_model(Model::default());
        let err = agent.continue_run().unwrap_err();
        assert!(matches!(err, TillerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn setters_mutate_observable_state() {
        let agent = test_agent();
        agent.set_system_prompt("be helpful");
        agent.set_thinking_level(ThinkingLevel::High);
        agent.set_model(Model {
            id: "m1".into(),
            ..Model::default()
        });

        let state = agent.state();
        assert_eq!(state.system_prompt, "be helpful");
        assert_eq!(state.thinking_level, ThinkingLevel::High);
        assert_eq!(state.model.unwrap().id, "m1");
    }

    #[tokio::test]
    async fn unsubscribe_removes_listener() {
        let agent = test_agent();
        let sub = agent.subscribe(|_| {});
        assert_eq!(agent.inner.listeners.lock().unwrap().len(), 1);
        sub.unsubscribe();
        assert!(agent.inner.listeners.lock().unwrap().is_empty());
    }

    fn user_text(message: &AgentMessage) -> String {
        match &message.message {
            Message::User(user) => user
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
            _ => String::new(),
        }
    }

    #[test]
    fn one_at_a_time_dequeues_fifo() {
        let queue = Mutex::new(vec![
            AgentMessage::user("1"),
            AgentMessage::user("2"),
            AgentMessage::user("3"),
        ]);

        let first = dequeue(&queue, QueueMode::OneAtATime);
        assert_eq!(first.len(), 1);
        assert_eq!(user_text(&first[0]), "1");
        assert_eq!(user_text(&dequeue(&queue, QueueMode::OneAtATime)[0]), "2");
        assert_eq!(user_text(&dequeue(&queue, QueueMode::OneAtATime)[0]), "3");
        assert!(dequeue(&queue, QueueMode::OneAtATime).is_empty());
    }

    #[test]
    fn all_mode_drains_queue() {
        let queue = Mutex::new(vec![AgentMessage::user("1"), AgentMessage::user("2")]);
        assert_eq!(dequeue(&queue, QueueMode::All).len(), 2);
        assert!(dequeue(&queue, QueueMode::All).is_empty());
    }
}
