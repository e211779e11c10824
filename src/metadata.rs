use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::config::Provider;
use crate::object::{ImageUsage, TokensUsage};

/// Authentication result stored by the auth filter.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub is_valid: bool,
    pub api_key_id: String,
    pub user_id: String,
    pub allow_models: Vec<String>,
    pub deny_models: Vec<String>,
}

/// Per-request record threaded through the pipeline for logging and filter
/// coordination.
///
/// Each field has exactly one writing stage: the listener owns the request
/// timestamps and status, the auth filter owns `auth_info`, the route layer
/// owns `matched_route`/`response_model`, the cluster owns the `upstream_*`
/// fields, and the stream pump owns `upstream_first_valid_chunk_at` and the
/// usage fields.
#[derive(Debug, Default)]
pub struct RequestMetadata {
    pub request_at: Option<DateTime<Utc>>,
    pub respond_at: Option<DateTime<Utc>>,
    pub status_code: u16,
    pub error_message: Option<String>,

    pub enabled_auth_filter: bool,
    pub auth_info: Option<AuthInfo>,

    pub request_model: String,
    pub response_model: String,
    pub matched_route: Option<String>,
    pub selected_cluster: Option<String>,

    pub upstream_provider: Option<Provider>,
    pub upstream_request_at: Option<DateTime<Utc>>,
    pub upstream_respond_at: Option<DateTime<Utc>>,
    pub upstream_first_valid_chunk_at: Option<DateTime<Utc>>,
    pub upstream_request_model: String,
    pub upstream_response_model: String,
    pub upstream_response_status: u16,
    pub upstream_response_error_message: Option<String>,

    pub llm_upstream_tokens_usage: Option<TokensUsage>,
    pub llm_upstream_images_usage: Option<Vec<ImageUsage>>,
}

pub type SharedMetadata = Arc<Mutex<RequestMetadata>>;

pub fn new_shared() -> SharedMetadata {
    Arc::new(Mutex::new(RequestMetadata::default()))
}
