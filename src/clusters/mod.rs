use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::bootkit::LifeCycle;
use crate::config::{ClusterConfig, LoadBalancePolicy};
use crate::error::{AppResult, LLMError};
use crate::metadata::SharedMetadata;
use crate::object::{LLMRequest, LLMResponse, RequestType, Usage};
use crate::providers;

pub mod filters;
pub mod registry;

pub use registry::ClusterRegistry;

/// Snapshot handed to response completers once a logical response is done
/// (immediately for non-streaming responses, at EOF for streams).
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub request_type: RequestType,
    pub model: String,
    pub usage: Option<Usage>,
    pub error_message: Option<String>,
}

/// A stage in the per-cluster chain. Request-side stages run in chain order;
/// response-side stages run over the reversed chain.
///
/// Incoming request -> preflight x n -> modifier x n -> marshaller -> upstream
/// Incoming response -> unmarshaller -> modifier x n -> completer x n
#[async_trait]
pub trait ClusterFilter: Send + Sync {
    fn request_preflight(&self, _request: &LLMRequest) -> AppResult<()> {
        Ok(())
    }

    fn request_modifier(
        &self,
        _config: &ClusterConfig,
        request: LLMRequest,
    ) -> AppResult<LLMRequest> {
        Ok(request)
    }

    /// Only meaningful when the cluster's load-balance policy is CUSTOM.
    fn is_endpoint_selector(&self) -> bool {
        false
    }

    fn select_endpoint(&self, _request: &LLMRequest, _endpoints: &[String]) -> Option<String> {
        None
    }

    fn marshal_upstream_request(
        &self,
        _client: &reqwest::Client,
        _config: &ClusterConfig,
        _request: &LLMRequest,
        pre: Option<reqwest::Request>,
    ) -> AppResult<Option<reqwest::Request>> {
        Ok(pre)
    }

    async fn unmarshal_response(
        &self,
        _client: &reqwest::Client,
        _config: &ClusterConfig,
        _request: &LLMRequest,
        _raw: &mut Option<reqwest::Response>,
        pre: Option<LLMResponse>,
    ) -> AppResult<Option<LLMResponse>> {
        Ok(pre)
    }

    fn response_modifier(
        &self,
        _config: &ClusterConfig,
        response: LLMResponse,
    ) -> AppResult<LLMResponse> {
        Ok(response)
    }

    async fn response_complete(&self, _summary: &ResponseSummary) -> AppResult<()> {
        Ok(())
    }
}

/// Registry entry for a named cluster filter factory.
pub struct ClusterFilterEntry {
    pub name: &'static str,
    pub factory: fn(serde_json::Value, &LifeCycle) -> AppResult<Arc<dyn ClusterFilter>>,
}

inventory::collect!(ClusterFilterEntry);

fn new_cluster_filter(
    name: &str,
    config: serde_json::Value,
    lifecycle: &LifeCycle,
) -> AppResult<Arc<dyn ClusterFilter>> {
    for entry in inventory::iter::<ClusterFilterEntry> {
        if entry.name == name {
            return (entry.factory)(config, lifecycle);
        }
    }
    Err(LLMError::internal_error().with_cause(format!("unknown cluster filter: {name}")))
}

/// One logical upstream model: a filter chain plus the HTTP/WS execution of
/// exactly one upstream call.
pub struct Cluster {
    config: ClusterConfig,
    filters: Vec<Arc<dyn ClusterFilter>>,
    reversed_filters: Vec<Arc<dyn ClusterFilter>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        http: reqwest::Client,
        lifecycle: &LifeCycle,
    ) -> AppResult<Self> {
        let mut chain: Vec<Arc<dyn ClusterFilter>> = Vec::new();
        for fc in &config.filters {
            chain.push(new_cluster_filter(&fc.name, fc.config.clone(), lifecycle)?);
        }

        let has_selector = chain.iter().any(|f| f.is_endpoint_selector());
        match config.load_balance_policy {
            LoadBalancePolicy::Custom => {
                if !has_selector {
                    return Err(LLMError::internal_error()
                        .with_cause("custom load balance policy must be implemented"));
                }
            }
            _ => {
                if has_selector {
                    return Err(LLMError::internal_error()
                        .with_cause("internal load balance policy must NOT be implemented"));
                }
            }
        }

        // The provider protocol handler always terminates the chain.
        chain.push(Arc::new(filters::ProtocolHandler::default()));

        let mut reversed = chain.clone();
        reversed.reverse();

        Ok(Self {
            config,
            filters: chain,
            reversed_filters: reversed,
            http,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn do_upstream_request(
        self: &Arc<Self>,
        meta: &SharedMetadata,
        mut request: LLMRequest,
    ) -> AppResult<LLMResponse> {
        {
            let mut guard = meta.lock().expect("metadata lock");
            guard.upstream_provider = Some(self.config.provider);
        }

        for filter in &self.filters {
            filter.request_preflight(&request)?;
        }

        for filter in &self.filters {
            request = filter.request_modifier(&self.config, request)?;
        }

        meta.lock().expect("metadata lock").upstream_request_model = request.model();

        let mut response = if self.config.provider.is_websocket() {
            self.do_websocket_request(meta, &request).await?
        } else {
            self.do_http_request(meta, &request).await?
        };

        {
            let mut guard = meta.lock().expect("metadata lock");
            guard.upstream_response_model = response.model();
        }

        for filter in &self.reversed_filters {
            response = filter.response_modifier(&self.config, response)?;
        }

        if let Some(error) = response.error() {
            meta.lock().expect("metadata lock").upstream_response_error_message =
                Some(error.message.clone());
        }

        match response {
            LLMResponse::Stream(ref stream) => {
                let shared = stream.shared();
                let cluster = self.clone();
                let meta = meta.clone();
                let request_type = request.request_type();
                let request_model = request.model();
                // Completion runs detached: usage lands in metadata after the
                // stream drains, then completers fire once.
                tokio::spawn(async move {
                    shared.wait_until_eof().await;

                    let usage = shared.usage();
                    if let Some(usage) = usage {
                        meta.lock().expect("metadata lock").llm_upstream_tokens_usage = Some(usage);
                    }

                    let summary = ResponseSummary {
                        request_type,
                        model: {
                            let model = shared.model();
                            if model.is_empty() { request_model } else { model }
                        },
                        usage: usage.map(Usage::Tokens),
                        error_message: shared.error().map(|e| e.message),
                    };
                    if let Err(err) = cluster.run_completers(&summary).await {
                        tracing::error!(error = %err, "response completion failed");
                    }
                });
            }
            ref resp => {
                let usage = resp.usage();
                {
                    let mut guard = meta.lock().expect("metadata lock");
                    match request.request_type() {
                        RequestType::ChatCompletions | RequestType::Completions => {
                            if let Some(Usage::Tokens(tokens)) = &usage {
                                guard.llm_upstream_tokens_usage = Some(*tokens);
                            }
                        }
                        RequestType::ImageGenerations => {
                            if let Some(Usage::Images(images)) = &usage {
                                guard.llm_upstream_images_usage = Some(images.clone());
                            }
                        }
                        RequestType::TextToSpeech => {}
                    }
                }

                let summary = ResponseSummary {
                    request_type: request.request_type(),
                    model: resp.model(),
                    usage,
                    error_message: resp.error().map(|e| e.message),
                };
                self.run_completers(&summary).await?;
            }
        }

        Ok(response)
    }

    async fn do_http_request(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
    ) -> AppResult<LLMResponse> {
        let mut upstream_request: Option<reqwest::Request> = None;
        for filter in &self.filters {
            upstream_request =
                filter.marshal_upstream_request(&self.http, &self.config, request, upstream_request)?;
        }
        let mut upstream_request = upstream_request.ok_or_else(|| {
            LLMError::internal_error()
                .with_cause("upstream request marshallers produced no request")
        })?;

        if let Some(timeout_ms) = self.config.upstream.timeout_ms {
            *upstream_request.timeout_mut() =
                Some(std::time::Duration::from_millis(timeout_ms));
        }

        meta.lock().expect("metadata lock").upstream_request_at = Some(Utc::now());

        let raw = self
            .http
            .execute(upstream_request)
            .await
            .map_err(|err| LLMError::bad_gateway().with_cause(err))?;

        {
            let mut guard = meta.lock().expect("metadata lock");
            guard.upstream_respond_at = Some(Utc::now());
            guard.upstream_response_status = raw.status().as_u16();
        }

        let mut raw = Some(raw);
        let mut response: Option<LLMResponse> = None;
        for filter in &self.reversed_filters {
            response = filter
                .unmarshal_response(&self.http, &self.config, request, &mut raw, response)
                .await?;
        }

        response.ok_or_else(|| {
            LLMError::internal_error().with_cause("response unmarshallers produced no response")
        })
    }

    async fn do_websocket_request(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
    ) -> AppResult<LLMResponse> {
        let tts = request.as_text_to_speech().ok_or_else(|| {
            LLMError::internal_error()
                .with_cause("websocket provider only supports text-to-speech requests")
        })?;

        // The configured upstream Authorization header wins over the
        // downstream credential.
        let auth_header = providers::header_value(&self.config.upstream.headers, "authorization")
            .map(|v| v.to_string())
            .or_else(|| request.http().authorization().map(|v| v.to_string()))
            .unwrap_or_default();

        meta.lock().expect("metadata lock").upstream_request_at = Some(Utc::now());

        let result = providers::do_speech(
            self.config.provider,
            &self.config.upstream.url,
            &auth_header,
            tts,
        )
        .await;

        {
            let mut guard = meta.lock().expect("metadata lock");
            guard.upstream_respond_at = Some(Utc::now());
            if let Err(ref err) = result {
                guard.upstream_response_status = err.status.as_u16();
            } else {
                guard.upstream_response_status = 200;
            }
        }

        result
    }

    async fn run_completers(&self, summary: &ResponseSummary) -> AppResult<()> {
        for filter in &self.reversed_filters {
            filter.response_complete(summary).await?;
        }
        Ok(())
    }
}
