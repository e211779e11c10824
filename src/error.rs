use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils;

/// Gateway-wide error classification. Every failure that escapes a pipeline
/// stage is normalized into one of these codes before it reaches the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LLMErrorCode {
    ModelNotFound,
    ModelAccessDenied,
    RateLimitExceeded,
    InsufficientQuota,
    MissingApiKey,
    IncorrectApiKey,
    MissingModel,
    ServiceUnavailable,
    InternalError,
    BadGateway,
}

impl LLMErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelNotFound => "model_not_found",
            Self::ModelAccessDenied => "model_access_denied",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::InsufficientQuota => "insufficient_quota",
            Self::MissingApiKey => "missing_api_key",
            Self::IncorrectApiKey => "incorrect_api_key",
            Self::MissingModel => "missing_model",
            Self::ServiceUnavailable => "service_unavailable",
            Self::InternalError => "internal_error",
            Self::BadGateway => "bad_gateway",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "model_not_found" => Some(Self::ModelNotFound),
            "model_access_denied" => Some(Self::ModelAccessDenied),
            "rate_limit_exceeded" => Some(Self::RateLimitExceeded),
            "insufficient_quota" => Some(Self::InsufficientQuota),
            "missing_api_key" => Some(Self::MissingApiKey),
            "incorrect_api_key" => Some(Self::IncorrectApiKey),
            "missing_model" => Some(Self::MissingModel),
            "service_unavailable" => Some(Self::ServiceUnavailable),
            "internal_error" => Some(Self::InternalError),
            "bad_gateway" => Some(Self::BadGateway),
            _ => None,
        }
    }
}

/// An OpenAI-compatible error: HTTP status plus the `{"error": {...}}` body.
#[derive(Debug, Clone)]
pub struct LLMError {
    pub status: StatusCode,
    pub code: Option<String>,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
    pub from_upstream: bool,
    pub cause: Option<String>,
}

impl LLMError {
    pub fn new(status: StatusCode, code: Option<LLMErrorCode>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.map(|c| c.as_str().to_string()),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
            from_upstream: false,
            cause: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        let cause = cause.to_string();
        if self.message.is_empty() {
            self.message = cause.clone();
        } else {
            self.message = format!("{}: {}", self.message, cause);
        }
        self.cause = Some(cause);
        self
    }

    pub fn from_upstream(mut self) -> Self {
        self.from_upstream = true;
        self
    }

    pub fn code_is(&self, code: LLMErrorCode) -> bool {
        self.code.as_deref() == Some(code.as_str())
    }

    pub fn missing_api_key() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            Some(LLMErrorCode::MissingApiKey),
            "You didn't provide an API key. You need to provide your API key in an \
             Authorization header using Bearer auth (i.e. Authorization: Bearer YOUR_KEY).",
        )
    }

    pub fn incorrect_api_key(api_key: &str) -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            Some(LLMErrorCode::IncorrectApiKey),
            format!("Incorrect API key provided: {api_key}."),
        )
    }

    pub fn model_not_found(model: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            Some(LLMErrorCode::ModelNotFound),
            format!("The model `{model}` does not exist or you do not have access to it."),
        )
    }

    pub fn model_access_denied(model: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            Some(LLMErrorCode::ModelAccessDenied),
            format!("You do not have access to the model `{model}`."),
        )
    }

    pub fn rate_limit_exceeded() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            Some(LLMErrorCode::RateLimitExceeded),
            "You have exceeded the rate limit. Please try again later.",
        )
    }

    pub fn insufficient_quota() -> Self {
        Self::new(
            StatusCode::PAYMENT_REQUIRED,
            Some(LLMErrorCode::InsufficientQuota),
            "You exceeded your current quota, please check your plan and billing details.",
        )
        .with_type("insufficient_quota")
    }

    pub fn missing_model() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            Some(LLMErrorCode::MissingModel),
            "you must provide a model parameter",
        )
    }

    pub fn missing_parameter(parameter: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            None,
            format!("Missing required parameter: '{parameter}'."),
        )
        .with_param(parameter)
    }

    pub fn invalid_body() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            None,
            "We could not parse the JSON body of your request. The API expects a JSON \
             payload, but what was sent was not valid JSON.",
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, None, message)
    }

    pub fn not_found(method: &str, uri: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            None,
            format!("Invalid URL ({} {})", method.to_uppercase(), uri),
        )
    }

    pub fn internal_error() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            Some(LLMErrorCode::InternalError),
            "internal error",
        )
        .with_type("internal_error")
    }

    pub fn bad_gateway() -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            Some(LLMErrorCode::BadGateway),
            "bad gateway",
        )
        .with_type("upstream_error")
    }

    pub fn service_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            Some(LLMErrorCode::ServiceUnavailable),
            "service unavailable",
        )
        .with_type("internal_error")
    }

    /// Decode an upstream error body into the taxonomy.
    ///
    /// Recognized shapes: the standard `{"error": {...}}` object, the
    /// OpenRouter `{"error": "<string>"}` form, and the vLLM
    /// `{"object": "error", "message": ..., "code": ...}` form. Returns `None`
    /// when the body carries no error and the status was below 400.
    pub fn from_upstream_body(status: StatusCode, parsed: &Map<String, Value>) -> Option<Self> {
        if let Some(error_map) = utils::get_path(parsed, "error").and_then(|v| v.as_object()) {
            let mut err = Self::new(status, None, "");
            err.code = error_map
                .get("code")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            err.message = error_map
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error (empty message received from upstream)")
                .to_string();
            if let Some(t) = error_map.get("type").and_then(|v| v.as_str()) {
                err.error_type = t.to_string();
            }
            err.param = error_map
                .get("param")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            return Some(err.from_upstream());
        }

        if let Some(error_str) = utils::get_str_path(parsed, "error") {
            return Some(
                Self::new(status, None, format!("upstream error: {error_str}")).from_upstream(),
            );
        }

        if status.as_u16() >= 400 {
            if utils::get_str_path(parsed, "object") == Some("error") {
                let mut err = Self::new(status, None, "");
                err.code = utils::get_str_path(parsed, "code").map(|s| s.to_string());
                err.message = utils::get_str_path(parsed, "message")
                    .unwrap_or("unknown upstream error")
                    .to_string();
                if let Some(t) = utils::get_str_path(parsed, "type") {
                    err.error_type = t.to_string();
                }
                err.param = utils::get_str_path(parsed, "param").map(|s| s.to_string());
                return Some(err.from_upstream());
            }

            return Some(
                Self::new(status, None, format!("upstream unknown error: {status}"))
                    .from_upstream(),
            );
        }

        None
    }

    /// Decode raw upstream bytes; opaque bodies become bad_gateway carrying a
    /// snippet of the payload.
    pub fn parse_upstream_error(status: StatusCode, body: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.as_object().cloned())
        {
            Some(parsed) => Self::from_upstream_body(status, &parsed).unwrap_or_else(|| {
                Self::bad_gateway()
                    .with_message(format!("upstream returned status {status}"))
                    .from_upstream()
            }),
            None => {
                let snippet: String = String::from_utf8_lossy(body).chars().take(256).collect();
                Self::bad_gateway()
                    .with_message(format!("upstream returned status {status}: {snippet}"))
                    .from_upstream()
            }
        }
    }
}

impl std::fmt::Display for LLMError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LLMError {}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl LLMError {
    pub fn to_body_value(&self) -> Value {
        serde_json::to_value(ErrorEnvelope {
            error: ErrorBody {
                message: self.message.clone(),
                error_type: self.error_type.clone(),
                param: self.param.clone(),
                code: self.code.clone(),
            },
        })
        .unwrap_or(Value::Null)
    }
}

impl IntoResponse for LLMError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = self.to_body_value();
        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, LLMError>;
