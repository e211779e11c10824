use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppResult, LLMError};
use crate::filters::{
    FilterContext, FilterEntry, FilterResult, FilterRole, RequestFilter, RpcCode, RpcError,
};
use crate::metadata::{AuthInfo, SharedMetadata};
use crate::object::{IncomingHttp, LLMRequest};
use crate::utils;

const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Remote authentication boundary. The production client is a gRPC stub
/// living outside the core; tests install in-process fakes.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn api_key_auth(&self, api_key: &str) -> Result<ApiKeyAuthResponse, RpcError>;
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuthResponse {
    pub is_valid: bool,
    pub api_key_id: String,
    pub user_id: String,
    pub allow_models: Vec<String>,
    pub deny_models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthFilterConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_AUTH_TIMEOUT.as_millis() as u64
}

impl Default for AuthFilterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

pub struct AuthFilter {
    config: AuthFilterConfig,
    service: Arc<dyn AuthService>,
}

impl AuthFilter {
    pub fn new(config: AuthFilterConfig, service: Arc<dyn AuthService>) -> Self {
        Self { config, service }
    }

    fn check_model_access(&self, meta: &SharedMetadata, request: &LLMRequest) -> FilterResult {
        let auth_info = {
            let guard = meta.lock().expect("metadata lock");
            guard.auth_info.clone()
        };
        let Some(auth_info) = auth_info else {
            return FilterResult::failed(
                LLMError::internal_error().with_cause("missing auth info in context"),
            );
        };

        let model = request.model();
        if model.is_empty() {
            return FilterResult::failed(LLMError::missing_model());
        }

        let denied = is_denied(&model, &auth_info.deny_models);
        let granted = is_granted(&model, &auth_info.allow_models);

        if denied {
            tracing::debug!(user = %auth_info.user_id, %model, "model access denied");
            return FilterResult::failed(LLMError::model_access_denied(&model));
        }

        if !granted {
            tracing::debug!(user = %auth_info.user_id, %model, "model not accessible");
            return FilterResult::failed(LLMError::model_not_found(&model));
        }

        FilterResult::Ok
    }
}

pub fn bearer_token(http: &IncomingHttp) -> Option<&str> {
    let header = http.authorization()?;
    let token = header.strip_prefix("Bearer ")?;
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Explicit deny rules override allows.
pub fn is_denied(request_model: &str, deny_models: &[String]) -> bool {
    deny_models
        .iter()
        .any(|rule| utils::model_glob_match(rule, request_model))
}

/// An empty allow-list grants access to every model.
pub fn is_granted(request_model: &str, allow_models: &[String]) -> bool {
    if allow_models.is_empty() {
        return true;
    }
    allow_models
        .iter()
        .any(|rule| utils::model_glob_match(rule, request_model))
}

pub fn can_access_model(
    request_model: &str,
    allow_models: &[String],
    deny_models: &[String],
) -> bool {
    !is_denied(request_model, deny_models) && is_granted(request_model, allow_models)
}

#[async_trait]
impl RequestFilter for AuthFilter {
    fn name(&self) -> &'static str {
        "api-key-auth"
    }

    fn roles(&self) -> &'static [FilterRole] {
        &[
            FilterRole::RequestPre,
            FilterRole::CompletionRequest,
            FilterRole::ImageGenerationsRequest,
        ]
    }

    async fn on_request_pre(&self, meta: &SharedMetadata, http: &IncomingHttp) -> FilterResult {
        meta.lock().expect("metadata lock").enabled_auth_filter = true;

        let Some(api_key) = bearer_token(http) else {
            return FilterResult::failed(LLMError::missing_api_key());
        };

        let timeout = Duration::from_millis(self.config.timeout_ms.max(1));
        let response =
            match tokio::time::timeout(timeout, self.service.api_key_auth(api_key)).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::new(RpcCode::DeadlineExceeded, "auth rpc timed out")),
            };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                return match err.code {
                    RpcCode::NotFound | RpcCode::Unauthenticated | RpcCode::PermissionDenied => {
                        tracing::debug!(code = ?err.code, "api key rejected by auth service");
                        FilterResult::failed(LLMError::incorrect_api_key(api_key))
                    }
                    RpcCode::Unavailable => {
                        tracing::warn!(error = %err, "auth service unavailable");
                        FilterResult::failed(LLMError::service_unavailable())
                    }
                    _ => {
                        tracing::error!(error = %err, "auth rpc failed");
                        FilterResult::failed(LLMError::internal_error().with_cause(err))
                    }
                };
            }
        };

        let is_valid = response.is_valid;
        meta.lock().expect("metadata lock").auth_info = Some(AuthInfo {
            is_valid,
            api_key_id: response.api_key_id,
            user_id: response.user_id,
            allow_models: response.allow_models,
            deny_models: response.deny_models,
        });

        if !is_valid {
            return FilterResult::failed(LLMError::incorrect_api_key(api_key));
        }

        FilterResult::Ok
    }

    async fn on_completion_request(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
    ) -> FilterResult {
        self.check_model_access(meta, request)
    }

    async fn on_image_generations_request(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
    ) -> FilterResult {
        self.check_model_access(meta, request)
    }
}

fn new_with_config(
    config: serde_json::Value,
    ctx: &FilterContext<'_>,
) -> AppResult<Arc<dyn RequestFilter>> {
    let config: AuthFilterConfig = if config.is_null() {
        AuthFilterConfig::default()
    } else {
        serde_json::from_value(config)
            .map_err(|err| LLMError::internal_error().with_cause(err))?
    };
    let service = ctx.services.auth.clone().ok_or_else(|| {
        LLMError::internal_error().with_cause("api-key-auth filter requires an auth service")
    })?;
    Ok(Arc::new(AuthFilter::new(config, service)))
}

inventory::submit!(FilterEntry {
    name: "api-key-auth",
    factory: new_with_config,
});
