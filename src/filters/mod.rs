use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::bootkit::LifeCycle;
use crate::error::{AppResult, LLMError};
use crate::metadata::SharedMetadata;
use crate::object::{IncomingHttp, LLMRequest, LLMResponse, StreamChunk};

pub mod auth;
pub mod ratelimit;
pub mod usage;

pub use auth::AuthService;
pub use usage::UsageStatsService;

/// Status codes surfaced by the RPC service boundaries (auth, usage stats).
/// Mirrors the gRPC codes the filters dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    NotFound,
    Unauthenticated,
    PermissionDenied,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of one filter invocation. `Failed` aborts the pipeline for
/// pre-stage filters; post-stage failures are logged and the pipeline
/// continues.
#[derive(Debug)]
pub enum FilterResult {
    Ok,
    Failed(LLMError),
}

impl FilterResult {
    pub fn ok() -> Self {
        FilterResult::Ok
    }

    pub fn failed(error: LLMError) -> Self {
        FilterResult::Failed(error)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FilterResult::Failed(_))
    }

    pub fn into_result(self) -> AppResult<()> {
        match self {
            FilterResult::Ok => Ok(()),
            FilterResult::Failed(err) => Err(err),
        }
    }
}

/// Role capabilities a filter may declare. The chain partitions filters into
/// per-role ordered lists at construction, so runtime dispatch only walks the
/// relevant list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRole {
    RequestPre,
    CompletionRequest,
    ImageGenerationsRequest,
    CompletionResponse,
    CompletionStreamResponse,
    ImageGenerationsResponse,
    ResponsePost,
}

const ROLE_COUNT: usize = 7;

fn role_index(role: FilterRole) -> usize {
    match role {
        FilterRole::RequestPre => 0,
        FilterRole::CompletionRequest => 1,
        FilterRole::ImageGenerationsRequest => 2,
        FilterRole::CompletionResponse => 3,
        FilterRole::CompletionStreamResponse => 4,
        FilterRole::ImageGenerationsResponse => 5,
        FilterRole::ResponsePost => 6,
    }
}

/// A stage in the request/response pipeline. A single filter may satisfy
/// several roles; it declares them and overrides the matching methods.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn roles(&self) -> &'static [FilterRole];

    async fn on_request_pre(&self, _meta: &SharedMetadata, _http: &IncomingHttp) -> FilterResult {
        FilterResult::Ok
    }

    async fn on_completion_request(
        &self,
        _meta: &SharedMetadata,
        _request: &LLMRequest,
    ) -> FilterResult {
        FilterResult::Ok
    }

    async fn on_image_generations_request(
        &self,
        _meta: &SharedMetadata,
        _request: &LLMRequest,
    ) -> FilterResult {
        FilterResult::Ok
    }

    async fn on_completion_response(
        &self,
        _meta: &SharedMetadata,
        _request: &LLMRequest,
        _response: &LLMResponse,
    ) -> FilterResult {
        FilterResult::Ok
    }

    /// Invoked per stream chunk, inline with decoding. Implementations must
    /// not block; slow work is spawned off the critical path.
    fn on_completion_stream_response(
        &self,
        _meta: &SharedMetadata,
        _request: &LLMRequest,
        _chunk: &StreamChunk,
    ) -> FilterResult {
        FilterResult::Ok
    }

    async fn on_image_generations_response(
        &self,
        _meta: &SharedMetadata,
        _request: &LLMRequest,
        _response: &LLMResponse,
    ) -> FilterResult {
        FilterResult::Ok
    }

    async fn on_response_post(
        &self,
        _meta: &SharedMetadata,
        _request: Option<&LLMRequest>,
        _response: Option<&LLMResponse>,
        _error: Option<&LLMError>,
    ) -> FilterResult {
        FilterResult::Ok
    }
}

/// An ordered filter chain with per-role partitions.
#[derive(Clone, Default)]
pub struct RequestFilters {
    by_role: [Vec<Arc<dyn RequestFilter>>; ROLE_COUNT],
}

impl RequestFilters {
    pub fn new(filters: Vec<Arc<dyn RequestFilter>>) -> Self {
        let mut by_role: [Vec<Arc<dyn RequestFilter>>; ROLE_COUNT] = Default::default();
        for filter in filters {
            for role in filter.roles() {
                by_role[role_index(*role)].push(filter.clone());
            }
        }
        Self { by_role }
    }

    /// The same filters with every role list reversed, for the response side
    /// of the pipeline.
    pub fn reversed(&self) -> Self {
        let mut by_role = self.by_role.clone();
        for list in by_role.iter_mut() {
            list.reverse();
        }
        Self { by_role }
    }

    pub fn with_role(&self, role: FilterRole) -> &[Arc<dyn RequestFilter>] {
        &self.by_role[role_index(role)]
    }

    pub fn request_role_for(
        &self,
        request_type: crate::object::RequestType,
    ) -> Option<FilterRole> {
        match request_type {
            crate::object::RequestType::ChatCompletions
            | crate::object::RequestType::Completions => Some(FilterRole::CompletionRequest),
            crate::object::RequestType::ImageGenerations => {
                Some(FilterRole::ImageGenerationsRequest)
            }
            crate::object::RequestType::TextToSpeech => None,
        }
    }
}

/// External service boundaries the built-in filters depend on. The gateway
/// core consumes these through traits; the RPC clients live outside.
#[derive(Clone, Default)]
pub struct Services {
    pub auth: Option<Arc<dyn AuthService>>,
    pub usage: Option<Arc<dyn UsageStatsService>>,
}

pub struct FilterContext<'a> {
    pub lifecycle: &'a LifeCycle,
    pub services: &'a Services,
}

/// Registry entry for a named filter factory.
pub struct FilterEntry {
    pub name: &'static str,
    pub factory: fn(Value, &FilterContext<'_>) -> AppResult<Arc<dyn RequestFilter>>,
}

inventory::collect!(FilterEntry);

pub fn new_request_filter(
    name: &str,
    config: Value,
    ctx: &FilterContext<'_>,
) -> AppResult<Arc<dyn RequestFilter>> {
    for entry in inventory::iter::<FilterEntry> {
        if entry.name == name {
            return (entry.factory)(config, ctx);
        }
    }
    Err(LLMError::internal_error().with_cause(format!("unknown filter: {name}")))
}

pub fn build_filters(
    configs: &[crate::config::FilterConfig],
    ctx: &FilterContext<'_>,
) -> AppResult<RequestFilters> {
    let mut filters = Vec::with_capacity(configs.len());
    for cfg in configs {
        filters.push(new_request_filter(&cfg.name, cfg.config.clone(), ctx)?);
    }
    Ok(RequestFilters::new(filters))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PreOnly;

    #[async_trait]
    impl RequestFilter for PreOnly {
        fn name(&self) -> &'static str {
            "pre-only"
        }

        fn roles(&self) -> &'static [FilterRole] {
            &[FilterRole::RequestPre]
        }
    }

    struct Both;

    #[async_trait]
    impl RequestFilter for Both {
        fn name(&self) -> &'static str {
            "both"
        }

        fn roles(&self) -> &'static [FilterRole] {
            &[FilterRole::RequestPre, FilterRole::CompletionResponse]
        }
    }

    #[test]
    fn chain_partitions_by_declared_role() {
        let chain = RequestFilters::new(vec![Arc::new(PreOnly), Arc::new(Both)]);
        assert_eq!(chain.with_role(FilterRole::RequestPre).len(), 2);
        assert_eq!(chain.with_role(FilterRole::CompletionResponse).len(), 1);
        assert_eq!(chain.with_role(FilterRole::ResponsePost).len(), 0);
    }

    #[test]
    fn reversed_flips_each_role_list() {
        let chain = RequestFilters::new(vec![Arc::new(PreOnly), Arc::new(Both)]);
        let reversed = chain.reversed();
        assert_eq!(
            reversed.with_role(FilterRole::RequestPre)[0].name(),
            "both"
        );
        assert_eq!(chain.with_role(FilterRole::RequestPre)[0].name(), "pre-only");
    }
}
