use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppResult, LLMError};
use crate::filters::{
    FilterContext, FilterEntry, FilterResult, FilterRole, RequestFilter, RpcError,
};
use crate::metadata::SharedMetadata;
use crate::object::{LLMRequest, LLMResponse, StreamChunk, Usage};

const DEFAULT_USAGE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageReportMode {
    PerRequest,
}

#[derive(Debug, Clone)]
pub struct UsageReport {
    pub api_key_id: String,
    pub user_model: String,
    pub upstream_model: String,
    pub usage: Usage,
    pub mode: UsageReportMode,
}

/// Remote usage-accounting boundary, consumed per terminal response.
#[async_trait]
pub trait UsageStatsService: Send + Sync {
    async fn usage_report(&self, report: UsageReport) -> Result<(), RpcError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageFilterConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_USAGE_TIMEOUT.as_millis() as u64
}

impl Default for UsageFilterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

pub struct UsageFilter {
    config: UsageFilterConfig,
    service: Arc<dyn UsageStatsService>,
}

impl UsageFilter {
    pub fn new(config: UsageFilterConfig, service: Arc<dyn UsageStatsService>) -> Self {
        Self { config, service }
    }

    fn build_report(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
        response_model: &str,
        usage: Usage,
    ) -> Option<UsageReport> {
        let api_key_id = {
            let guard = meta.lock().expect("metadata lock");
            guard
                .auth_info
                .as_ref()
                .map(|auth| auth.api_key_id.clone())
        };
        let Some(api_key_id) = api_key_id else {
            tracing::warn!("no auth info in metadata, skipping usage report");
            return None;
        };
        Some(UsageReport {
            api_key_id,
            user_model: request.model(),
            upstream_model: response_model.to_string(),
            usage,
            mode: UsageReportMode::PerRequest,
        })
    }

    /// Reporting never blocks the response path and never propagates errors.
    fn spawn_report(&self, report: UsageReport) {
        let service = self.service.clone();
        let timeout = Duration::from_millis(self.config.timeout_ms.max(1));
        tokio::spawn(async move {
            let model = report.user_model.clone();
            match tokio::time::timeout(timeout, service.usage_report(report)).await {
                Ok(Ok(())) => {
                    tracing::info!(%model, "reported usage");
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, %model, "failed to report usage");
                }
                Err(_) => {
                    tracing::warn!(%model, "usage report timed out");
                }
            }
        });
    }

    fn report_response(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
        response: &LLMResponse,
    ) -> FilterResult {
        let Some(usage) = response.usage() else {
            tracing::warn!(model = %request.model(), "no usage in response");
            return FilterResult::Ok;
        };
        if let Some(report) = self.build_report(meta, request, &response.model(), usage) {
            self.spawn_report(report);
        }
        FilterResult::Ok
    }
}

#[async_trait]
impl RequestFilter for UsageFilter {
    fn name(&self) -> &'static str {
        "usage-stats"
    }

    fn roles(&self) -> &'static [FilterRole] {
        &[
            FilterRole::CompletionResponse,
            FilterRole::CompletionStreamResponse,
            FilterRole::ImageGenerationsResponse,
        ]
    }

    async fn on_completion_response(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
        response: &LLMResponse,
    ) -> FilterResult {
        self.report_response(meta, request, response)
    }

    fn on_completion_stream_response(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
        chunk: &StreamChunk,
    ) -> FilterResult {
        if !chunk.is_usage() {
            return FilterResult::Ok;
        }
        let Some(usage) = chunk.usage().copied() else {
            return FilterResult::Ok;
        };
        let model = if chunk.model().is_empty() {
            request.model()
        } else {
            chunk.model().to_string()
        };
        if let Some(report) = self.build_report(meta, request, &model, Usage::Tokens(usage)) {
            self.spawn_report(report);
        }
        FilterResult::Ok
    }

    async fn on_image_generations_response(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
        response: &LLMResponse,
    ) -> FilterResult {
        self.report_response(meta, request, response)
    }
}

fn new_with_config(
    config: serde_json::Value,
    ctx: &FilterContext<'_>,
) -> AppResult<Arc<dyn RequestFilter>> {
    let config: UsageFilterConfig = if config.is_null() {
        UsageFilterConfig::default()
    } else {
        serde_json::from_value(config)
            .map_err(|err| LLMError::internal_error().with_cause(err))?
    };
    let service = ctx.services.usage.clone().ok_or_else(|| {
        LLMError::internal_error().with_cause("usage-stats filter requires a usage service")
    })?;
    Ok(Arc::new(UsageFilter::new(config, service)))
}

inventory::submit!(FilterEntry {
    name: "usage-stats",
    factory: new_with_config,
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{self, AuthInfo};
    use crate::object::{
        ChatCompletionsResponse, CompletionsRequest, IncomingHttp, RequestType, TokensUsage,
    };
    use axum::http::{HeaderMap, Method, StatusCode};
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;

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

    fn chat_request(model: &str) -> LLMRequest {
        LLMRequest::Completions(
            CompletionsRequest::from_http(
                RequestType::ChatCompletions,
                IncomingHttp {
                    method: Method::POST,
                    uri: "/v1/chat/completions".to_string(),
                    headers: HeaderMap::new(),
                },
                Bytes::from(serde_json::to_vec(&json!({"model": model})).unwrap()),
            )
            .unwrap(),
        )
    }

    fn meta_with_key() -> crate::metadata::SharedMetadata {
        let meta = metadata::new_shared();
        meta.lock().unwrap().auth_info = Some(AuthInfo {
            is_valid: true,
            api_key_id: "ak-1".to_string(),
            ..Default::default()
        });
        meta
    }

    #[tokio::test]
    async fn terminal_response_reports_token_usage() {
        let service = Arc::new(RecordingUsage::default());
        let filter = UsageFilter::new(UsageFilterConfig::default(), service.clone());

        let response = LLMResponse::Chat(
            ChatCompletionsResponse::from_bytes(
                StatusCode::OK,
                Bytes::from(
                    serde_json::to_vec(&json!({
                        "model": "openai/gpt-4",
                        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
                    }))
                    .unwrap(),
                ),
            )
            .unwrap(),
        );

        let meta = meta_with_key();
        let request = chat_request("gpt-4");
        let result = filter.on_completion_response(&meta, &request, &response).await;
        assert!(!result.is_failed());

        tokio::task::yield_now().await;
        let reports = service.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].api_key_id, "ak-1");
        assert_eq!(reports[0].user_model, "gpt-4");
        assert_eq!(reports[0].upstream_model, "openai/gpt-4");
        assert_eq!(
            reports[0].usage.as_tokens(),
            Some(&TokensUsage {
                prompt_tokens: 3,
                completion_tokens: 1,
                total_tokens: 4
            })
        );
    }

    #[tokio::test]
    async fn usage_service_failure_never_propagates() {
        struct FailingUsage;

        #[async_trait]
        impl UsageStatsService for FailingUsage {
            async fn usage_report(&self, _report: UsageReport) -> Result<(), RpcError> {
                Err(RpcError::new(
                    crate::filters::RpcCode::Unavailable,
                    "stats down",
                ))
            }
        }

        let filter = UsageFilter::new(UsageFilterConfig::default(), Arc::new(FailingUsage));
        let response = LLMResponse::Chat(
            ChatCompletionsResponse::from_bytes(
                StatusCode::OK,
                Bytes::from(
                    serde_json::to_vec(&json!({
                        "model": "m",
                        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
                    }))
                    .unwrap(),
                ),
            )
            .unwrap(),
        );

        let meta = meta_with_key();
        let request = chat_request("gpt-4");
        let result = filter.on_completion_response(&meta, &request, &response).await;
        assert!(!result.is_failed());
    }
}
