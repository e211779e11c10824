use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::oneshot;

use crate::app::AppState;
use crate::error::LLMError;
use crate::metadata::{self, SharedMetadata};

/// Cancel handles for in-flight requests, keyed per request.
#[derive(Default)]
pub struct CancellableRequestMap {
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl CancellableRequestMap {
    pub fn add(&self, cancel: oneshot::Sender<()>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .expect("cancellable map lock")
            .insert(id, cancel);
        id
    }

    pub fn remove(&self, id: u64) {
        self.handles.lock().expect("cancellable map lock").remove(&id);
    }

    pub fn cancel_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().expect("cancellable map lock"));
        for (_, cancel) in handles {
            let _ = cancel.send(());
        }
    }

    pub fn active(&self) -> usize {
        self.handles.lock().expect("cancellable map lock").len()
    }
}

/// Shutdown coordination for the listener: once draining, new requests are
/// rejected and in-flight ones get a bounded grace period.
pub struct DrainState {
    drained: AtomicBool,
    pub cancellable: CancellableRequestMap,
    grace: Duration,
}

impl DrainState {
    pub fn new(grace: Duration) -> Self {
        Self {
            drained: AtomicBool::new(false),
            cancellable: CancellableRequestMap::default(),
            grace,
        }
    }

    pub fn has_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    pub async fn drain(&self) {
        self.drained.store(true, Ordering::Release);
        tokio::time::sleep(self.grace).await;
        self.cancellable.cancel_all();
    }
}

pub async fn with_init_metadata(mut req: Request, next: Next) -> Response {
    req.extensions_mut().insert(metadata::new_shared());
    next.run(req).await
}

pub async fn with_request_timer(req: Request, next: Next) -> Response {
    let meta = req.extensions().get::<SharedMetadata>().cloned();
    if let Some(meta) = &meta {
        meta.lock().expect("metadata lock").request_at = Some(Utc::now());
    }
    let response = next.run(req).await;
    if let Some(meta) = &meta {
        meta.lock().expect("metadata lock").respond_at = Some(Utc::now());
    }
    response
}

pub async fn with_access_log(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let meta = req.extensions().get::<SharedMetadata>().cloned();
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let x_forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let response = next.run(req).await;

    if let Some(meta) = meta {
        let guard = meta.lock().expect("metadata lock");
        metrics::counter!(
            "modelgate_requests_total",
            "status" => guard.status_code.to_string()
        )
        .increment(1);

        if state.access_log {
            let duration_ms = match (guard.request_at, guard.respond_at) {
                (Some(start), Some(end)) => (end - start).num_milliseconds(),
                _ => 0,
            };
            let (api_key_id, user_id) = guard
                .auth_info
                .as_ref()
                .map(|a| (a.api_key_id.clone(), a.user_id.clone()))
                .unwrap_or_default();
            tracing::info!(
                method,
                uri,
                x_forwarded_for,
                duration_ms,
                api_key_id,
                user_id,
                request_model = %guard.request_model,
                response_model = %guard.response_model,
                status = guard.status_code,
                upstream_provider = guard.upstream_provider.map(|p| p.as_str()).unwrap_or(""),
                upstream_request_model = %guard.upstream_request_model,
                upstream_response_model = %guard.upstream_response_model,
                upstream_response_status = guard.upstream_response_status,
                prompt_tokens = guard
                    .llm_upstream_tokens_usage
                    .map(|u| u.prompt_tokens)
                    .unwrap_or(0),
                completion_tokens = guard
                    .llm_upstream_tokens_usage
                    .map(|u| u.completion_tokens)
                    .unwrap_or(0),
                "access"
            );
        }
    }

    response
}

/// Converts panics below this layer into an internal-error JSON body.
pub async fn with_recover(req: Request, next: Next) -> Response {
    let meta = req.extensions().get::<SharedMetadata>().cloned();
    let uri = req.uri().to_string();
    match std::panic::AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let panic_message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(%uri, panic = %panic_message, "recovered from panic");
            let err = LLMError::internal_error();
            if let Some(meta) = meta {
                let mut guard = meta.lock().expect("metadata lock");
                guard.status_code = err.status.as_u16();
                guard.error_message = Some(err.message.clone());
            }
            err.into_response()
        }
    }
}

pub async fn with_reject_after_drained(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.drain.has_drained() {
        let err = LLMError::service_unavailable();
        if let Some(meta) = req.extensions().get::<SharedMetadata>() {
            let mut guard = meta.lock().expect("metadata lock");
            guard.status_code = err.status.as_u16();
            guard.error_message = Some(err.message.clone());
        }
        return err.into_response();
    }
    next.run(req).await
}

pub async fn with_cancellable(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let id = state.drain.cancellable.add(cancel_tx);

    let response = tokio::select! {
        response = next.run(req) => response,
        _ = cancel_rx => LLMError::service_unavailable().into_response(),
    };

    state.drain.cancellable.remove(id);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_cancels_registered_handles_after_grace() {
        let drain = DrainState::new(Duration::from_millis(10));
        let (tx, rx) = oneshot::channel();
        drain.cancellable.add(tx);

        assert!(!drain.has_drained());
        drain.drain().await;
        assert!(drain.has_drained());
        assert!(rx.await.is_ok());
        assert_eq!(drain.cancellable.active(), 0);
    }

    #[test]
    fn remove_drops_the_handle() {
        let map = CancellableRequestMap::default();
        let (tx, _rx) = oneshot::channel();
        let id = map.add(tx);
        assert_eq!(map.active(), 1);
        map.remove(id);
        assert_eq!(map.active(), 0);
    }
}
