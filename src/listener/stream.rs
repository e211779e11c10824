use std::convert::Infallible;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::filters::{FilterResult, FilterRole, RequestFilters};
use crate::metadata::SharedMetadata;
use crate::object::{ChatCompletionStreamResponse, LLMRequest};

/// Emit SSE headers immediately and pump upstream chunks to the client.
///
/// Once headers are written no JSON error body can follow; chunk failures are
/// logged and the connection closes.
pub fn sse_response(
    meta: SharedMetadata,
    request: LLMRequest,
    stream: ChatCompletionStreamResponse,
    listener_reversed: RequestFilters,
) -> Response {
    // Listener-level per-chunk filters ride the decode callback, like the
    // route-level ones registered earlier.
    let chunk_filters = listener_reversed.clone();
    let chunk_meta = meta.clone();
    let chunk_request = request.clone();
    stream.on_chunk(Arc::new(move |chunk| {
        for filter in chunk_filters.with_role(FilterRole::CompletionStreamResponse) {
            let result = filter.on_completion_stream_response(&chunk_meta, &chunk_request, chunk);
            if let FilterResult::Failed(err) = result {
                tracing::error!(
                    error = %err,
                    "error during invoking of stream response filters"
                );
            }
        }
    }));

    meta.lock().expect("metadata lock").status_code = StatusCode::OK.as_u16();

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(pump(stream, meta, request, listener_reversed, tx));

    let mut response = Sse::new(ReceiverStream::new(rx)).into_response();
    let headers = response.headers_mut();
    headers.insert("Cache-Control", "no-cache".parse().expect("static header"));
    headers.insert("Connection", "keep-alive".parse().expect("static header"));
    response
}

async fn pump(
    mut stream: ChatCompletionStreamResponse,
    meta: SharedMetadata,
    request: LLMRequest,
    listener_reversed: RequestFilters,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    while let Some(chunk) = stream.next_chunk().await {
        if chunk.is_empty() {
            continue;
        }

        if chunk.is_usage() {
            if let Some(usage) = chunk.usage() {
                meta.lock().expect("metadata lock").llm_upstream_tokens_usage = Some(*usage);
            }
        }

        if chunk.is_first() {
            let mut guard = meta.lock().expect("metadata lock");
            guard.upstream_first_valid_chunk_at = Some(Utc::now());
            guard.upstream_response_model = chunk.model().to_string();
        }

        if let Some(data) = chunk.sse_data() {
            if tx.send(Ok(Event::default().data(data))).await.is_err() {
                // Client went away; stop reading the upstream.
                break;
            }
        }

        if chunk.is_done() {
            break;
        }
    }

    if let Some(error) = stream.error() {
        tracing::error!(error = %error, "stream terminated with upstream error");
        meta.lock().expect("metadata lock").error_message = Some(error.message);
    }

    for filter in listener_reversed.with_role(FilterRole::ResponsePost) {
        let result = filter
            .on_response_post(&meta, Some(&request), None, None)
            .await;
        if let FilterResult::Failed(err) = result {
            tracing::error!(error = %err, "error during invoking of response post filters");
        }
    }
}
