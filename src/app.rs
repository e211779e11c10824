use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use axum::middleware::from_fn;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::bootkit::LifeCycle;
use crate::clusters::ClusterRegistry;
use crate::config::StaticConfig;
use crate::error::{AppResult, LLMError};
use crate::filters::{FilterContext, RequestFilters, Services};
use crate::listener::{self, middleware, DrainState};
use crate::route::{registry::init_direct_model_route, RouteRegistry};

#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub clusters: Arc<ClusterRegistry>,
    pub routes: Arc<RouteRegistry>,
    pub listener_filters: RequestFilters,
    pub listener_reversed: RequestFilters,
    pub drain: Arc<DrainState>,
    pub metrics: PrometheusHandle,
    pub access_log: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub config_path: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("MODELGATE_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let config_path = std::env::var("MODELGATE_CONFIG")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self {
            listen,
            config_path,
        }
    }
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<String> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle);
        }
        Err(err) => {
            let _ = METRICS_ERROR.set(err.to_string());
        }
    });
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    Err(LLMError::internal_error().with_cause(
        METRICS_ERROR
            .get()
            .cloned()
            .unwrap_or_else(|| "metrics recorder unavailable".to_string()),
    ))
}

fn load_static_config(path: Option<&str>) -> AppResult<StaticConfig> {
    let Some(path) = path else {
        return Ok(StaticConfig::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|err| {
        LLMError::internal_error().with_cause(format!("failed to read config {path}: {err}"))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        LLMError::internal_error().with_cause(format!("failed to decode config {path}: {err}"))
    })
}

pub async fn load_state(services: Services, lifecycle: &LifeCycle) -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env(), services, lifecycle).await
}

pub async fn load_state_with_runtime(
    runtime: RuntimeConfig,
    services: Services,
    lifecycle: &LifeCycle,
) -> AppResult<AppState> {
    let config = load_static_config(runtime.config_path.as_deref())?;
    load_state_with_config(config, services, lifecycle).await
}

pub async fn load_state_with_config(
    config: StaticConfig,
    services: Services,
    lifecycle: &LifeCycle,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("modelgate/0.1")
        .build()
        .map_err(|err| LLMError::internal_error().with_cause(err))?;

    let metrics = init_metrics()?;

    let clusters = Arc::new(ClusterRegistry::new(http.clone()));
    let routes = Arc::new(RouteRegistry::new());
    let ctx = FilterContext {
        lifecycle,
        services: &services,
    };

    for cluster in &config.clusters {
        clusters.upsert_and_register_cluster(cluster.clone(), lifecycle)?;
        routes.register_base_route_with_config(init_direct_model_route(&cluster.name), &ctx)?;
    }

    for route in &config.routes {
        routes.register_match_route_with_config(route.clone(), &ctx)?;
    }

    let listener_filters = crate::filters::build_filters(&config.listener.filters, &ctx)?;
    let listener_reversed = listener_filters.reversed();

    let drain = Arc::new(DrainState::new(Duration::from_secs(
        config.listener.drain_wait_secs,
    )));

    Ok(AppState {
        http,
        clusters,
        routes,
        listener_filters,
        listener_reversed,
        drain,
        metrics,
        access_log: config.listener.access_log,
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(listener::chat_completions).options(listener::options_no_content),
        )
        .route(
            "/v1/completions",
            post(listener::completions).options(listener::options_no_content),
        )
        .route(
            "/v1/images/generations",
            post(listener::images_generations).options(listener::options_no_content),
        )
        .route(
            "/v1/audio/speech",
            post(listener::audio_speech).options(listener::options_no_content),
        )
        .route("/v1/models", get(listener::list_models))
        .route("/metrics", get(listener::metrics))
        .layer(
            tower::ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(from_fn(middleware::with_init_metadata))
                .layer(from_fn_with_state(
                    state.clone(),
                    middleware::with_access_log,
                ))
                .layer(from_fn(middleware::with_request_timer))
                .layer(from_fn(middleware::with_recover))
                .layer(from_fn_with_state(
                    state.clone(),
                    middleware::with_reject_after_drained,
                ))
                .layer(from_fn_with_state(
                    state.clone(),
                    middleware::with_cancellable,
                )),
        )
        .with_state(state)
}
