use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::error::{AppResult, LLMError};
use crate::filters::{FilterResult, FilterRole};
use crate::metadata::SharedMetadata;
use crate::object::{
    AudioBody, CompletionsRequest, ImageGenerationsRequest, IncomingHttp, LLMRequest, LLMResponse,
    RequestType, TextToSpeechRequest,
};

pub mod middleware;
pub mod stream;

pub use middleware::{CancellableRequestMap, DrainState};

pub async fn options_no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models(
    State(state): State<AppState>,
    Extension(meta): Extension<SharedMetadata>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let http = IncomingHttp {
        method,
        uri: uri.to_string(),
        headers,
    };
    for filter in state.listener_filters.with_role(FilterRole::RequestPre) {
        if let FilterResult::Failed(err) = filter.on_request_pre(&meta, &http).await {
            return finish_with_error(&state, &meta, None, err).await;
        }
    }

    let mut model_ids: Vec<String> = state
        .clusters
        .list_models()
        .into_iter()
        .map(|cluster| cluster.name)
        .collect();
    model_ids.sort();
    model_ids.dedup();

    let data: Vec<Value> = model_ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "modelgate"
            })
        })
        .collect();

    meta.lock().expect("metadata lock").status_code = StatusCode::OK.as_u16();
    axum::Json(json!({ "object": "list", "data": data })).into_response()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(meta): Extension<SharedMetadata>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let http = IncomingHttp {
        method,
        uri: uri.to_string(),
        headers,
    };
    handle_llm_request(state, meta, http, body, RequestType::ChatCompletions).await
}

pub async fn completions(
    State(state): State<AppState>,
    Extension(meta): Extension<SharedMetadata>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let http = IncomingHttp {
        method,
        uri: uri.to_string(),
        headers,
    };
    handle_llm_request(state, meta, http, body, RequestType::Completions).await
}

pub async fn images_generations(
    State(state): State<AppState>,
    Extension(meta): Extension<SharedMetadata>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let http = IncomingHttp {
        method,
        uri: uri.to_string(),
        headers,
    };
    handle_llm_request(state, meta, http, body, RequestType::ImageGenerations).await
}

pub async fn audio_speech(
    State(state): State<AppState>,
    Extension(meta): Extension<SharedMetadata>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let http = IncomingHttp {
        method,
        uri: uri.to_string(),
        headers,
    };
    handle_llm_request(state, meta, http, body, RequestType::TextToSpeech).await
}

fn parse_request(
    request_type: RequestType,
    http: IncomingHttp,
    body: Bytes,
) -> AppResult<LLMRequest> {
    match request_type {
        RequestType::ChatCompletions | RequestType::Completions => Ok(LLMRequest::Completions(
            CompletionsRequest::from_http(request_type, http, body)?,
        )),
        RequestType::ImageGenerations => Ok(LLMRequest::ImageGenerations(
            ImageGenerationsRequest::from_http(http, body)?,
        )),
        RequestType::TextToSpeech => Ok(LLMRequest::TextToSpeech(
            TextToSpeechRequest::from_http(http, body)?,
        )),
    }
}

async fn handle_llm_request(
    state: AppState,
    meta: SharedMetadata,
    http: IncomingHttp,
    body: Bytes,
    request_type: RequestType,
) -> Response {
    for filter in state.listener_filters.with_role(FilterRole::RequestPre) {
        if let FilterResult::Failed(err) = filter.on_request_pre(&meta, &http).await {
            return finish_with_error(&state, &meta, None, err).await;
        }
    }

    let request = match parse_request(request_type, http, body) {
        Ok(request) => request,
        Err(err) => return finish_with_error(&state, &meta, None, err).await,
    };

    meta.lock().expect("metadata lock").request_model = request.model();

    if let Some(role) = state.listener_filters.request_role_for(request_type) {
        for filter in state.listener_filters.with_role(role) {
            let result = match role {
                FilterRole::CompletionRequest => {
                    filter.on_completion_request(&meta, &request).await
                }
                _ => filter.on_image_generations_request(&meta, &request).await,
            };
            if let FilterResult::Failed(err) = result {
                return finish_with_error(&state, &meta, Some(&request), err).await;
            }
        }
    }

    let response = match state
        .routes
        .handle_request(&meta, &state.clusters, &request)
        .await
    {
        Ok(response) => response,
        Err(err) => return finish_with_error(&state, &meta, Some(&request), err).await,
    };

    // A populated response error is surfaced as the final body.
    if let Some(err) = response.error() {
        return finish_with_error(&state, &meta, Some(&request), err).await;
    }

    match response {
        LLMResponse::Stream(streaming) => {
            stream::sse_response(meta, request, streaming, state.listener_reversed.clone())
        }
        response => finish_with_response(&state, &meta, &request, response).await,
    }
}

async fn finish_with_response(
    state: &AppState,
    meta: &SharedMetadata,
    request: &LLMRequest,
    response: LLMResponse,
) -> Response {
    match request.request_type() {
        RequestType::ChatCompletions | RequestType::Completions => {
            for filter in state
                .listener_reversed
                .with_role(FilterRole::CompletionResponse)
            {
                let result = filter.on_completion_response(meta, request, &response).await;
                if let FilterResult::Failed(err) = result {
                    tracing::error!(
                        error = %err,
                        "error during invoking of completion response filters"
                    );
                }
            }
        }
        RequestType::ImageGenerations => {
            for filter in state
                .listener_reversed
                .with_role(FilterRole::ImageGenerationsResponse)
            {
                let result = filter
                    .on_image_generations_response(meta, request, &response)
                    .await;
                if let FilterResult::Failed(err) = result {
                    tracing::error!(
                        error = %err,
                        "error during invoking of image response filters"
                    );
                }
            }
        }
        RequestType::TextToSpeech => {}
    }

    run_response_post(state, meta, Some(request), Some(&response), None).await;

    match response {
        LLMResponse::Chat(resp) => {
            meta.lock().expect("metadata lock").status_code = StatusCode::OK.as_u16();
            (
                StatusCode::OK,
                [("content-type", "application/json")],
                resp.body().clone(),
            )
                .into_response()
        }
        LLMResponse::Image(resp) => {
            meta.lock().expect("metadata lock").status_code = StatusCode::OK.as_u16();
            (
                StatusCode::OK,
                [("content-type", "application/json")],
                resp.body().clone(),
            )
                .into_response()
        }
        LLMResponse::Audio(resp) => {
            meta.lock().expect("metadata lock").status_code = resp.status.as_u16();
            let content_type = resp.content_type_or_default().to_string();
            let body = match resp.body {
                AudioBody::Bytes(bytes) => Body::from(bytes),
                AudioBody::Upstream(upstream) => Body::from_stream(upstream.bytes_stream()),
            };
            (resp.status, [("content-type", content_type)], body).into_response()
        }
        LLMResponse::Stream(_) => {
            // Streams never reach the non-streaming writer.
            LLMError::internal_error().into_response()
        }
    }
}

async fn finish_with_error(
    state: &AppState,
    meta: &SharedMetadata,
    request: Option<&LLMRequest>,
    err: LLMError,
) -> Response {
    {
        let mut guard = meta.lock().expect("metadata lock");
        guard.status_code = err.status.as_u16();
        guard.error_message = Some(err.message.clone());
    }

    if err.from_upstream {
        tracing::error!(
            status = err.status.as_u16(),
            code = err.code.as_deref().unwrap_or(""),
            message = %err.message,
            "upstream returned an error"
        );
    } else if err.status.is_server_error() {
        tracing::error!(
            status = err.status.as_u16(),
            message = %err.message,
            cause = err.cause.as_deref().unwrap_or(""),
            "failed to handle request"
        );
    }

    run_response_post(state, meta, request, None, Some(&err)).await;
    err.into_response()
}

async fn run_response_post(
    state: &AppState,
    meta: &SharedMetadata,
    request: Option<&LLMRequest>,
    response: Option<&LLMResponse>,
    error: Option<&LLMError>,
) {
    for filter in state.listener_reversed.with_role(FilterRole::ResponsePost) {
        let result = filter.on_response_post(meta, request, response, error).await;
        if let FilterResult::Failed(err) = result {
            tracing::error!(error = %err, "error during invoking of response post filters");
        }
    }
}
