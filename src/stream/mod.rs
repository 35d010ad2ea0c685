//! Push-based, finite event streams with a terminal-event contract.
//!
//! A stream is created as a channel pair: the producer holds an
//! [`EventSink`] and pushes events until a terminal one (or calls
//! [`EventSink::end`]); the single consumer iterates [`EventStream::next`]
//! and may await [`EventStream::result`] for the final value.

pub mod assembler;

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::types::{AssistantMessage, AssistantMessageEvent};

/// Internal queue capacity. Decouples producer bursts from consumer pace;
/// `push` blocks when the queue is full.
const CHANNEL_CAPACITY: usize = 64;

type TerminalFn<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type ExtractFn<E, R> = Arc<dyn Fn(&E) -> R + Send + Sync>;

/// Producer half of an event stream.
pub struct EventSink<E, R> {
    tx: Mutex<Option<mpsc::Sender<E>>>,
    result_tx: Mutex<Option<oneshot::Sender<R>>>,
    is_terminal: TerminalFn<E>,
    extract_result: ExtractFn<E, R>,
}

/// Consumer half of an event stream.
pub struct EventStream<E, R> {
    rx: mpsc::Receiver<E>,
    result_rx: oneshot::Receiver<R>,
}

/// Create an event stream channel.
///
/// `is_terminal` marks events that close the stream; `extract_result` pulls
/// the final value out of such an event.
pub fn event_channel<E, R>(
    is_terminal: impl Fn(&E) -> bool + Send + Sync + 'static,
    extract_result: impl Fn(&E) -> R + Send + Sync + 'static,
) -> (EventSink<E, R>, EventStream<E, R>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (result_tx, result_rx) = oneshot::channel();
    (
        EventSink {
            tx: Mutex::new(Some(tx)),
            result_tx: Mutex::new(Some(result_tx)),
            is_terminal: Arc::new(is_terminal),
            extract_result: Arc::new(extract_result),
        },
        EventStream { rx, result_rx },
    )
}

impl<E, R> EventSink<E, R> {
    /// Deliver an event to the consumer in FIFO order.
    ///
    /// When the event is terminal, its extracted result is recorded, the
    /// event is delivered, and the channel closes. Pushing after the stream
    /// has closed is a no-op.
    pub async fn push(&self, event: E) {
        let terminal = (self.is_terminal)(&event);
        if terminal {
            if let Some(result_tx) = self.result_tx.lock().expect("result lock").take() {
                let _ = result_tx.send((self.extract_result)(&event));
            }
        }
        let tx = self.tx.lock().expect("sender lock").clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
        if terminal {
            self.tx.lock().expect("sender lock").take();
        }
    }

    /// Close the stream with an explicit result, without a terminal event.
    ///
    /// Idempotent: the first resolved result wins. Producers must call this
    /// (or push a terminal event) on every exit path.
    pub fn end(&self, result: R) {
        if let Some(result_tx) = self.result_tx.lock().expect("result lock").take() {
            let _ = result_tx.send(result);
        }
        self.tx.lock().expect("sender lock").take();
    }

    /// Whether a terminal event or `end` has already closed the stream.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().expect("sender lock").is_none()
    }
}

impl<E, R> EventStream<E, R> {
    /// Receive the next event, or `None` once the stream has closed and all
    /// buffered events were consumed.
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Await the final result.
    ///
    /// Returns `None` only when the producer dropped its sink without
    /// pushing a terminal event or calling `end` — the escape hatch that
    /// keeps a misbehaving producer from deadlocking its consumer.
    pub async fn result(self) -> Option<R> {
        self.result_rx.await.ok()
    }

    /// Drain and discard any remaining events, then await the result.
    pub async fn wait(mut self) -> Option<R> {
        while self.next().await.is_some() {}
        self.result().await
    }
}

/// Sink specialised for assistant-message streaming.
pub type AssistantEventSink = EventSink<AssistantMessageEvent, AssistantMessage>;
/// Stream specialised for assistant-message streaming.
pub type AssistantEventStream = EventStream<AssistantMessageEvent, AssistantMessage>;

/// Create a stream for assistant message events. `done`/`error` are the
/// terminal events; the final (or error) message is the result.
pub fn assistant_event_channel() -> (AssistantEventSink, AssistantEventStream) {
    event_channel(AssistantMessageEvent::is_terminal, |event| {
        event
            .final_message()
            .cloned()
            .expect("terminal event carries a message")
    })
}
