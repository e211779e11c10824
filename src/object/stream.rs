use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::error::LLMError;
use crate::object::TokensUsage;
use crate::utils;

/// One decoded server-sent event from the upstream stream.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    data: String,
    parsed: Option<Map<String, Value>>,
    model: String,
    usage: Option<TokensUsage>,
    first: bool,
    empty: bool,
    done: bool,
    is_usage: bool,
}

impl StreamChunk {
    fn empty_chunk() -> Self {
        Self {
            data: String::new(),
            parsed: None,
            model: String::new(),
            usage: None,
            first: false,
            empty: true,
            done: false,
            is_usage: false,
        }
    }

    fn done_chunk() -> Self {
        Self {
            data: "[DONE]".to_string(),
            parsed: None,
            model: String::new(),
            usage: None,
            first: false,
            empty: false,
            done: true,
            is_usage: false,
        }
    }

    pub fn is_first(&self) -> bool {
        self.first
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_usage(&self) -> bool {
        self.is_usage
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn usage(&self) -> Option<&TokensUsage> {
        self.usage.as_ref()
    }

    pub fn parsed(&self) -> Option<&Map<String, Value>> {
        self.parsed.as_ref()
    }

    /// The SSE `data:` payload to forward, verbatim. `None` for chunks that
    /// carry nothing (heartbeats, undecodable lines).
    pub fn sse_data(&self) -> Option<&str> {
        if self.empty {
            None
        } else {
            Some(&self.data)
        }
    }
}

pub type ChunkCallback = Arc<dyn Fn(&StreamChunk) + Send + Sync>;

#[derive(Debug, Default)]
struct StreamState {
    model: String,
    usage: Option<TokensUsage>,
    error: Option<LLMError>,
    chunk_num: u64,
    done: bool,
}

/// State shared between the pumping task, per-chunk callbacks, and the
/// detached completer that waits for EOF.
pub struct StreamShared {
    state: Mutex<StreamState>,
    eof_tx: watch::Sender<bool>,
    eof_rx: watch::Receiver<bool>,
    callbacks: Mutex<Vec<ChunkCallback>>,
}

impl StreamShared {
    fn new() -> Self {
        let (eof_tx, eof_rx) = watch::channel(false);
        Self {
            state: Mutex::new(StreamState::default()),
            eof_tx,
            eof_rx,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn signal_eof(&self) {
        let _ = self.eof_tx.send(true);
    }

    pub fn is_eof(&self) -> bool {
        *self.eof_rx.borrow()
    }

    /// Resolves once the stream has been fully consumed (or dropped).
    pub async fn wait_until_eof(&self) {
        let mut rx = self.eof_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn model(&self) -> String {
        self.state.lock().expect("stream state lock").model.clone()
    }

    pub fn usage(&self) -> Option<TokensUsage> {
        self.state.lock().expect("stream state lock").usage
    }

    pub fn error(&self) -> Option<LLMError> {
        self.state.lock().expect("stream state lock").error.clone()
    }

    fn invoke_callbacks(&self, chunk: &StreamChunk) {
        let callbacks = self.callbacks.lock().expect("stream callback lock");
        for cb in callbacks.iter() {
            cb(chunk);
        }
    }
}

type BoxedEventStream =
    Pin<Box<dyn Stream<Item = Result<eventsource_stream::Event, String>> + Send + Sync>>;

/// Streaming chat/completion response decoded from the upstream
/// `text/event-stream` body.
pub struct ChatCompletionStreamResponse {
    shared: Arc<StreamShared>,
    events: BoxedEventStream,
}

impl std::fmt::Debug for ChatCompletionStreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock().expect("stream state lock");
        f.debug_struct("ChatCompletionStreamResponse")
            .field("model", &state.model)
            .field("chunk_num", &state.chunk_num)
            .field("done", &state.done)
            .finish()
    }
}

impl ChatCompletionStreamResponse {
    pub fn from_upstream(resp: reqwest::Response) -> Self {
        use eventsource_stream::Eventsource;
        Self::from_events(resp.bytes_stream().eventsource())
    }

    pub fn from_events<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<eventsource_stream::Event, E>> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        Self {
            shared: Arc::new(StreamShared::new()),
            events: Box::pin(stream.map(|item| item.map_err(|err| err.to_string()))),
        }
    }

    pub fn shared(&self) -> Arc<StreamShared> {
        self.shared.clone()
    }

    /// Register a per-chunk callback. Callbacks run inline with decoding, in
    /// registration order, for every produced chunk including the terminal
    /// `[DONE]` one.
    pub fn on_chunk(&self, cb: ChunkCallback) {
        self.shared
            .callbacks
            .lock()
            .expect("stream callback lock")
            .push(cb);
    }

    pub fn model(&self) -> String {
        self.shared.model()
    }

    pub fn set_model(&self, model: &str) {
        self.shared
            .state
            .lock()
            .expect("stream state lock")
            .model = model.to_string();
    }

    pub fn usage(&self) -> Option<TokensUsage> {
        self.shared.usage()
    }

    pub fn error(&self) -> Option<LLMError> {
        self.shared.error()
    }

    /// Decode the next chunk. `None` means the underlying stream is finished;
    /// the EOF signal has fired by the time `None` is returned.
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        let item = self.events.next().await;
        let chunk = match item {
            None => {
                self.shared.signal_eof();
                return None;
            }
            Some(Err(err)) => {
                tracing::error!(error = %err, "failed to read next chunk from upstream stream");
                let mut state = self.shared.state.lock().expect("stream state lock");
                state.error = Some(LLMError::bad_gateway().with_cause(err));
                drop(state);
                self.shared.signal_eof();
                return None;
            }
            Some(Ok(event)) => self.decode_event(&event),
        };

        let chunk = match chunk {
            Some(chunk) => chunk,
            None => {
                // Upstream emitted an error payload mid-stream. The error is
                // recorded on the shared state and the stream terminates.
                self.shared.signal_eof();
                return None;
            }
        };

        if chunk.is_done() {
            self.shared.signal_eof();
        }
        self.shared.invoke_callbacks(&chunk);
        Some(chunk)
    }

    fn decode_event(&self, event: &eventsource_stream::Event) -> Option<StreamChunk> {
        let data = event.data.trim();
        if data.is_empty() {
            return Some(StreamChunk::empty_chunk());
        }

        if data == "[DONE]" {
            let mut state = self.shared.state.lock().expect("stream state lock");
            state.chunk_num += 1;
            state.done = true;
            return Some(StreamChunk::done_chunk());
        }

        let parsed: Map<String, Value> = match serde_json::from_str::<Value>(data)
            .ok()
            .and_then(|v| v.as_object().cloned())
        {
            Some(parsed) => parsed,
            None => {
                tracing::warn!(data, "skipping undecodable stream event");
                return Some(StreamChunk::empty_chunk());
            }
        };

        if parsed.contains_key("error") {
            let status = axum::http::StatusCode::BAD_GATEWAY;
            let error = LLMError::from_upstream_body(status, &parsed)
                .unwrap_or_else(|| LLMError::bad_gateway());
            tracing::error!(error = %error, "upstream emitted error event mid-stream");
            self.shared.state.lock().expect("stream state lock").error = Some(error);
            return None;
        }

        let model = utils::get_str_path(&parsed, "model").unwrap_or("").to_string();
        let usage = utils::get_path(&parsed, "usage")
            .filter(|_| utils::get_path(&parsed, "usage.completion_tokens").is_some())
            .and_then(|v| serde_json::from_value::<TokensUsage>(v.clone()).ok());
        let is_usage = usage.is_some();

        let mut state = self.shared.state.lock().expect("stream state lock");
        state.chunk_num += 1;
        let first = state.chunk_num == 1;
        if state.model.is_empty() && !model.is_empty() {
            state.model = model.clone();
        }
        if let Some(usage) = usage {
            state.usage = Some(usage);
        }
        drop(state);

        Some(StreamChunk {
            data: data.to_string(),
            parsed: Some(parsed),
            model,
            usage,
            first,
            empty: false,
            done: false,
            is_usage,
        })
    }
}

impl Drop for ChatCompletionStreamResponse {
    // A dropped stream (client hung up before [DONE]) still releases the
    // detached completer.
    fn drop(&mut self) {
        self.shared.signal_eof();
    }
}
