use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Sse};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use modelgate::app::{self, AppState};
use modelgate::bootkit::LifeCycle;
use modelgate::config::{
    ClusterConfig, FallbackConfig, FilterConfig, HeaderConfig, ListenerConfig, LoadBalancePolicy,
    MeteringPolicy, Provider, RouteConfig, RouteMatch, RouteTarget, SizeFrom, StaticConfig,
    StringMatch, UpstreamConfig,
};
use modelgate::filters::auth::{ApiKeyAuthResponse, AuthService};
use modelgate::filters::usage::{UsageReport, UsageStatsService};
use modelgate::filters::{RpcCode, RpcError, Services};

const GOOD_KEY: &str = "sk-good";

#[derive(Default)]
struct UpstreamState {
    captured_headers: Mutex<Vec<(String, String)>>,
    captured_bodies: Mutex<Vec<Value>>,
    attempts: AtomicU32,
    fail_with_502_times: u32,
}

type SharedUpstream = Arc<UpstreamState>;

fn capture(state: &UpstreamState, headers: &HeaderMap, keys: &[&str]) {
    let mut lock = state.captured_headers.lock().unwrap();
    for key in keys {
        if let Some(value) = headers.get(*key).and_then(|v| v.to_str().ok()) {
            lock.push((key.to_string(), value.to_string()));
        }
    }
}

async fn upstream_chat(
    State(state): State<SharedUpstream>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    capture(&state, &headers, &["authorization", "accept"]);
    state.captured_bodies.lock().unwrap().push(body.clone());

    let attempt = state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt <= state.fail_with_502_times {
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": {"message": "upstream exploded", "code": "bad_gateway"}})),
        )
            .into_response();
    }

    if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
        let events: Vec<Result<Event, Infallible>> = vec![
            Ok(Event::default()
                .data(json!({"model": "m", "choices": [{"delta": {"content": "a"}}]}).to_string())),
            Ok(Event::default().data(
                json!({"model": "m", "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}})
                    .to_string(),
            )),
            Ok(Event::default().data("[DONE]")),
        ];
        return Sse::new(futures_util::stream::iter(events)).into_response();
    }

    Json(json!({
        "model": "openai/gpt-4",
        "choices": [{"message": {"role": "assistant", "content": "hi"}}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    }))
    .into_response()
}

fn tiny_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::new(width, height);
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

async fn upstream_images(Json(_body): Json<Value>) -> axum::response::Response {
    let png = tiny_png(272, 170);
    let b64 = base64::engine::general_purpose::STANDARD.encode(png);
    Json(json!({
        "created": 0,
        "data": [{"b64_json": b64}]
    }))
    .into_response()
}

async fn upstream_speech(
    State(state): State<SharedUpstream>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    capture(&state, &headers, &["authorization", "content-type"]);
    state
        .captured_bodies
        .lock()
        .unwrap()
        .push(serde_json::from_slice(&body).unwrap_or(Value::Null));
    (
        StatusCode::OK,
        [("content-type", "audio/mpeg")],
        b"mp3-bytes".to_vec(),
    )
        .into_response()
}

async fn upstream_ssml(
    State(state): State<SharedUpstream>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    capture(
        &state,
        &headers,
        &[
            "ocp-apim-subscription-key",
            "x-microsoft-outputformat",
            "content-type",
        ],
    );
    state
        .captured_bodies
        .lock()
        .unwrap()
        .push(Value::String(body));
    (
        StatusCode::OK,
        [("content-type", "audio/mpeg")],
        b"ms-audio".to_vec(),
    )
        .into_response()
}

async fn start_upstream(fail_with_502_times: u32) -> (SocketAddr, SharedUpstream) {
    let state = Arc::new(UpstreamState {
        fail_with_502_times,
        ..Default::default()
    });
    let router = Router::new()
        .route("/v1/chat/completions", post(upstream_chat))
        .route("/v1/images/generations", post(upstream_images))
        .route("/v1/audio/speech", post(upstream_speech))
        .route("/cognitiveservices/v1", post(upstream_ssml))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

struct FakeAuth;

#[async_trait]
impl AuthService for FakeAuth {
    async fn api_key_auth(&self, api_key: &str) -> Result<ApiKeyAuthResponse, RpcError> {
        if api_key == GOOD_KEY {
            return Ok(ApiKeyAuthResponse {
                is_valid: true,
                api_key_id: "ak-1".to_string(),
                user_id: "u-1".to_string(),
                allow_models: vec!["**".to_string()],
                deny_models: vec!["denied/**".to_string()],
            });
        }
        Err(RpcError::new(RpcCode::NotFound, "unknown api key"))
    }
}

#[derive(Default)]
struct RecordingUsage {
    reports: Mutex<Vec<UsageReport>>,
}

#[async_trait]
impl UsageStatsService for RecordingUsage {
    async fn usage_report(&self, report: UsageReport) -> Result<(), RpcError> {
        self.reports.lock().unwrap().push(report);
        Ok(())
    }
}

fn chat_cluster(name: &str, addr: SocketAddr, upstream_model: &str) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        provider: Provider::OpenAi,
        load_balance_policy: LoadBalancePolicy::Unspecified,
        upstream: UpstreamConfig {
            url: format!("http://{addr}/v1"),
            headers: vec![HeaderConfig {
                key: "Authorization".to_string(),
                value: "Bearer sk-upstream".to_string(),
            }],
            timeout_ms: Some(5_000),
            default_params: serde_json::Map::new(),
            override_params: json!({"model": upstream_model}).as_object().cloned().unwrap(),
            remove_param_keys: vec![],
        },
        metering_policy: None,
        filters: vec![],
    }
}

fn listener_with_filters() -> ListenerConfig {
    ListenerConfig {
        access_log: false,
        filters: vec![
            FilterConfig {
                name: "api-key-auth".to_string(),
                config: Value::Null,
            },
            FilterConfig {
                name: "rate-limit".to_string(),
                config: json!({
                    "policies": [{
                        "based_on": "api_key",
                        "limit": 100,
                        "duration_secs": 60
                    }]
                }),
            },
            FilterConfig {
                name: "usage-stats".to_string(),
                config: Value::Null,
            },
        ],
        drain_wait_secs: 1,
    }
}

async fn build_state(config: StaticConfig, usage: Arc<RecordingUsage>) -> AppState {
    let lifecycle = LifeCycle::new();
    let services = Services {
        auth: Some(Arc::new(FakeAuth)),
        usage: Some(usage),
    };
    app::load_state_with_config(config, services, &lifecycle)
        .await
        .unwrap()
}

fn post_json(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(AUTHORIZATION, format!("Bearer {auth}"));
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

#[tokio::test]
async fn chat_completion_happy_path_rewrites_model() {
    let (addr, upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let usage = Arc::new(RecordingUsage::default());
    let state = build_state(config, usage.clone()).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["usage"]["prompt_tokens"], 3);
    assert_eq!(body["usage"]["completion_tokens"], 1);
    assert_eq!(body["choices"][0]["message"]["content"], "hi");

    // The upstream saw its own model name and the configured credential.
    let sent = upstream.captured_bodies.lock().unwrap();
    assert_eq!(sent[0]["model"], "openai/gpt-4");
    let headers = upstream.captured_headers.lock().unwrap();
    assert!(headers
        .iter()
        .any(|(k, v)| k == "authorization" && v == "Bearer sk-upstream"));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let reports = usage.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].user_model, "gpt-4");
    assert_eq!(reports[0].usage.as_tokens().unwrap().total_tokens, 4);
}

#[tokio::test]
async fn missing_api_key_is_401() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            None,
            json!({"model": "gpt-4", "messages": []}),
        ))
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "missing_api_key");
}

#[tokio::test]
async fn incorrect_api_key_is_401() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some("sk-wrong"),
            json!({"model": "gpt-4", "messages": []}),
        ))
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "incorrect_api_key");
}

#[tokio::test]
async fn denied_model_is_403() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("denied/secret", addr, "denied/secret")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "denied/secret", "messages": []}),
        ))
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "model_access_denied");
}

#[tokio::test]
async fn unknown_model_is_404() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "ghost", "messages": []}),
        ))
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "model_not_found");
}

fn parse_sse_datas(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| data.trim().to_string())
        .collect()
}

#[tokio::test]
async fn streaming_forwards_chunks_and_reports_usage() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let usage = Arc::new(RecordingUsage::default());
    let state = build_state(config, usage.clone()).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "gpt-4", "messages": [], "stream": true}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let raw = String::from_utf8(bytes.to_vec()).unwrap();
    let datas = parse_sse_datas(&raw);

    assert_eq!(datas.len(), 3);
    let first: Value = serde_json::from_str(&datas[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "a");
    let second: Value = serde_json::from_str(&datas[1]).unwrap();
    assert_eq!(second["usage"]["completion_tokens"], 1);
    assert_eq!(datas[2], "[DONE]");

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let reports = usage.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let tokens = reports[0].usage.as_tokens().unwrap();
    assert_eq!((tokens.prompt_tokens, tokens.completion_tokens), (1, 1));
}

#[tokio::test]
async fn fallback_retries_until_upstream_recovers() {
    let (addr, upstream) = start_upstream(2).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4-backend", addr, "openai/gpt-4")],
        routes: vec![RouteConfig {
            name: "gpt-4".to_string(),
            matches: vec![RouteMatch {
                model: StringMatch::Exact("gpt-4".to_string()),
            }],
            targets: vec![RouteTarget {
                cluster: "gpt-4-backend".to_string(),
                namespace: None,
                weight: None,
            }],
            load_balance_policy: LoadBalancePolicy::Unspecified,
            filters: vec![],
            fallback: Some(FallbackConfig {
                pre_delay_ms: Some(10),
                post_delay_ms: None,
                max_retries: Some(3),
            }),
        }],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "gpt-4", "messages": []}),
        ))
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "gpt-4-backend");
    assert_eq!(upstream.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_fallback_surfaces_upstream_error() {
    let (addr, upstream) = start_upstream(100).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4-backend", addr, "openai/gpt-4")],
        routes: vec![RouteConfig {
            name: "gpt-4".to_string(),
            matches: vec![RouteMatch {
                model: StringMatch::Exact("gpt-4".to_string()),
            }],
            targets: vec![RouteTarget {
                cluster: "gpt-4-backend".to_string(),
                namespace: None,
                weight: None,
            }],
            load_balance_policy: LoadBalancePolicy::Unspecified,
            filters: vec![],
            fallback: Some(FallbackConfig {
                pre_delay_ms: None,
                post_delay_ms: None,
                max_retries: Some(2),
            }),
        }],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "gpt-4", "messages": []}),
        ))
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["message"], "upstream exploded");
    // Initial attempt plus two retries.
    assert_eq!(upstream.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limit_denies_third_request_within_window() {
    let (addr, _upstream) = start_upstream(0).await;
    let mut listener = listener_with_filters();
    listener.filters[1] = FilterConfig {
        name: "rate-limit".to_string(),
        config: json!({
            "policies": [{
                "based_on": "api_key",
                "limit": 2,
                "duration_secs": 60
            }]
        }),
    };
    let config = StaticConfig {
        listener,
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_json(
                "/v1/chat/completions",
                Some(GOOD_KEY),
                json!({"model": "gpt-4", "messages": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "gpt-4", "messages": []}),
        ))
        .await
        .unwrap();
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
}

#[tokio::test]
async fn image_generation_meters_output_dimensions() {
    let (addr, _upstream) = start_upstream(0).await;
    let mut cluster = chat_cluster("dall-e-3", addr, "dall-e-3");
    cluster.metering_policy = Some(MeteringPolicy {
        size_from: SizeFrom::Output,
    });
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![cluster],
        routes: vec![],
    };
    let usage = Arc::new(RecordingUsage::default());
    let state = build_state(config, usage.clone()).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/images/generations",
            Some(GOOD_KEY),
            json!({"model": "dall-e-3", "prompt": "a fox", "size": "256x256"}),
        ))
        .await
        .unwrap();

    let (status, _body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let reports = usage.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let images = reports[0].usage.as_images().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!((images[0].width, images[0].height), (272, 170));
}

#[tokio::test]
async fn speech_request_forwards_audio_binary() {
    let (addr, upstream) = start_upstream(0).await;
    let mut cluster = chat_cluster("tts-1", addr, "tts-1");
    cluster.upstream.url = format!("http://{addr}/v1/audio/speech");
    cluster.upstream.override_params = serde_json::Map::new();
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![cluster],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/audio/speech",
            Some(GOOD_KEY),
            json!({"model": "tts-1", "input": "hello", "voice": "alloy"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(content_type.starts_with("audio/mpeg"));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.as_ref(), b"mp3-bytes");

    // For configured header keys the downstream credential passes through to
    // the speech upstream.
    let headers = upstream.captured_headers.lock().unwrap();
    assert!(headers
        .iter()
        .any(|(k, v)| k == "authorization" && *v == format!("Bearer {GOOD_KEY}")));
}

#[tokio::test]
async fn options_requests_short_circuit() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/v1/chat/completions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn drained_listener_rejects_new_requests() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state.clone());

    state.drain.drain().await;

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "gpt-4", "messages": []}),
        ))
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "service_unavailable");
}

#[tokio::test]
async fn models_endpoint_lists_registered_clusters() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![
            chat_cluster("gpt-4", addr, "openai/gpt-4"),
            chat_cluster("claude-3", addr, "anthropic/claude-3"),
        ],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/models")
                .header(AUTHORIZATION, format!("Bearer {GOOD_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["claude-3", "gpt-4"]);
}

#[tokio::test]
async fn invalid_body_is_400() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("Bearer {GOOD_KEY}"))
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("JSON"));
}

#[tokio::test]
async fn stream_error_before_headers_is_a_json_error() {
    let (addr, _upstream) = start_upstream(100).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "gpt-4", "messages": [], "stream": true}),
        ))
        .await
        .unwrap();

    // The upstream failed before any SSE headers were written, so the client
    // still gets a JSON error body.
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(content_type.starts_with("application/json"));
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["message"], "upstream exploded");
}

#[tokio::test]
async fn prefix_route_matches_model_families() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-family", addr, "openai/gpt-4")],
        routes: vec![RouteConfig {
            name: "gpt-family".to_string(),
            matches: vec![RouteMatch {
                model: StringMatch::Prefix("gpt-".to_string()),
            }],
            targets: vec![RouteTarget {
                cluster: "gpt-family".to_string(),
                namespace: None,
                weight: None,
            }],
            load_balance_policy: LoadBalancePolicy::Unspecified,
            filters: vec![],
            fallback: None,
        }],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "gpt-4o-mini", "messages": []}),
        ))
        .await
        .unwrap();
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "gpt-family");

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "o1-mini", "messages": []}),
        ))
        .await
        .unwrap();
    let (status, _body) = read_json(response).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn microsoft_speech_builds_ssml_request() {
    let (addr, upstream) = start_upstream(0).await;
    let mut cluster = chat_cluster("azure-tts", addr, "azure-tts");
    cluster.provider = Provider::MicrosoftSpeechServiceV1;
    cluster.upstream.url = format!("http://{addr}/cognitiveservices/v1");
    cluster.upstream.headers = vec![];
    cluster.upstream.override_params = serde_json::Map::new();
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![cluster],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/audio/speech",
            Some(GOOD_KEY),
            json!({
                "model": "azure-tts",
                "input": "hello world",
                "voice": "en-US-AvaNeural",
                "response_format": "mp3"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(bytes.as_ref(), b"ms-audio");

    let bodies = upstream.captured_bodies.lock().unwrap();
    let ssml = bodies[0].as_str().unwrap();
    assert!(ssml.contains("<speak"));
    assert!(ssml.contains("en-US-AvaNeural"));
    assert!(ssml.contains("hello world"));

    let headers = upstream.captured_headers.lock().unwrap();
    assert!(headers
        .iter()
        .any(|(k, v)| k == "ocp-apim-subscription-key" && v == GOOD_KEY));
    assert!(headers
        .iter()
        .any(|(k, v)| k == "x-microsoft-outputformat" && v == "audio-48khz-192kbitrate-mono-mp3"));
    assert!(headers
        .iter()
        .any(|(k, v)| k == "content-type" && v == "application/ssml+xml"));
}

#[tokio::test]
async fn cluster_reconfiguration_is_visible_to_new_requests() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![chat_cluster("gpt-4", addr, "openai/gpt-4")],
        routes: vec![],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state.clone());

    // A cluster registered after boot serves requests immediately.
    let lifecycle = LifeCycle::new();
    state
        .clusters
        .upsert_and_register_cluster(chat_cluster("late-model", addr, "openai/late"), &lifecycle)
        .unwrap();
    let services = Services {
        auth: Some(Arc::new(FakeAuth)),
        usage: None,
    };
    let ctx = modelgate::filters::FilterContext {
        lifecycle: &lifecycle,
        services: &services,
    };
    state
        .routes
        .register_base_route_with_config(
            modelgate::route::registry::init_direct_model_route("late-model"),
            &ctx,
        )
        .unwrap();

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "late-model", "messages": []}),
        ))
        .await
        .unwrap();
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "late-model");

    // Removing the cluster makes its model unresolvable again.
    state.clusters.remove_cluster("late-model");
    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(GOOD_KEY),
            json!({"model": "late-model", "messages": []}),
        ))
        .await
        .unwrap();
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "model_not_found");
}

#[tokio::test]
async fn weighted_route_splits_traffic_between_clusters() {
    let (addr, _upstream) = start_upstream(0).await;
    let config = StaticConfig {
        listener: listener_with_filters(),
        clusters: vec![
            chat_cluster("gpt-4-a", addr, "openai/gpt-4"),
            chat_cluster("gpt-4-b", addr, "openai/gpt-4"),
        ],
        routes: vec![RouteConfig {
            name: "gpt-4".to_string(),
            matches: vec![RouteMatch {
                model: StringMatch::Exact("gpt-4".to_string()),
            }],
            targets: vec![
                RouteTarget {
                    cluster: "gpt-4-a".to_string(),
                    namespace: None,
                    weight: Some(1),
                },
                RouteTarget {
                    cluster: "gpt-4-b".to_string(),
                    namespace: None,
                    weight: Some(1),
                },
            ],
            load_balance_policy: LoadBalancePolicy::WeightedRoundRobin,
            filters: vec![],
            fallback: None,
        }],
    };
    let state = build_state(config, Arc::new(RecordingUsage::default())).await;
    let router = app::build_app(state);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..32 {
        let response = router
            .clone()
            .oneshot(post_json(
                "/v1/chat/completions",
                Some(GOOD_KEY),
                json!({"model": "gpt-4", "messages": []}),
            ))
            .await
            .unwrap();
        let (status, body) = read_json(response).await;
        assert_eq!(status, StatusCode::OK);
        seen.insert(body["model"].as_str().unwrap().to_string());
    }

    // Both weighted targets serve traffic; the response model always reflects
    // the selected cluster.
    assert!(seen.contains("gpt-4-a"));
    assert!(seen.contains("gpt-4-b"));
}
