use std::sync::Arc;
use std::time::Duration;

use crate::clusters::ClusterRegistry;
use crate::config::{LoadBalancePolicy, RouteConfig};
use crate::error::AppResult;
use crate::filters::{FilterContext, FilterRole, RequestFilters};
use crate::metadata::SharedMetadata;
use crate::object::{LLMRequest, LLMResponse, RequestType};

pub mod loadbalance;
pub mod registry;

pub use loadbalance::LoadBalancer;
pub use registry::RouteRegistry;

const DEFAULT_FALLBACK_MAX_RETRIES: u64 = 3;

/// A named matcher plus target set: selects one cluster per request and owns
/// the per-route filters and fallback policy.
pub struct Route {
    config: RouteConfig,
    load_balancer: LoadBalancer,
    filters: RequestFilters,
    reversed_filters: RequestFilters,
}

impl Route {
    pub fn new(config: RouteConfig, ctx: &FilterContext<'_>) -> AppResult<Self> {
        let filters = crate::filters::build_filters(&config.filters, ctx)?;
        let reversed_filters = filters.reversed();
        let load_balancer = LoadBalancer::new(&config);
        Ok(Self {
            config,
            load_balancer,
            filters,
            reversed_filters,
        })
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// A request matches when any match entry binds its model name and the
    /// route has at least one target.
    pub fn matches(&self, request: &LLMRequest) -> bool {
        if self.config.matches.is_empty() || self.config.targets.is_empty() {
            return false;
        }
        let model = request.model();
        self.config
            .matches
            .iter()
            .any(|entry| entry.model.matches(&model))
    }

    fn select_cluster(&self) -> String {
        if self.config.load_balance_policy == LoadBalancePolicy::Unspecified {
            return self
                .config
                .targets
                .first()
                .map(|t| t.cluster.clone())
                .unwrap_or_default();
        }
        self.load_balancer.next()
    }

    pub async fn handle_request(
        &self,
        meta: &SharedMetadata,
        clusters: &ClusterRegistry,
        request: &LLMRequest,
    ) -> AppResult<LLMResponse> {
        if let Some(role) = self.filters.request_role_for(request.request_type()) {
            for filter in self.filters.with_role(role) {
                let result = match role {
                    FilterRole::CompletionRequest => {
                        filter.on_completion_request(meta, request).await
                    }
                    _ => filter.on_image_generations_request(meta, request).await,
                };
                result.into_result()?;
            }
        }

        let mut retried_count: u64 = 0;

        loop {
            let cluster_name = self.select_cluster();

            if retried_count > 0 {
                if let Some(pre_delay_ms) =
                    self.config.fallback.as_ref().and_then(|f| f.pre_delay_ms)
                {
                    tokio::time::sleep(Duration::from_millis(pre_delay_ms)).await;
                }
            }

            let result = clusters
                .handle_request(meta, &cluster_name, request.clone())
                .await;
            self.load_balancer.done();

            if let Ok(ref response) = result {
                self.run_response_filters(meta, request, response).await;

                if let LLMResponse::Stream(stream) = response {
                    let stream_filters = self.reversed_filters.clone();
                    let meta = meta.clone();
                    let request = request.clone();
                    stream.on_chunk(Arc::new(move |chunk| {
                        for filter in
                            stream_filters.with_role(FilterRole::CompletionStreamResponse)
                        {
                            let result =
                                filter.on_completion_stream_response(&meta, &request, chunk);
                            if let crate::filters::FilterResult::Failed(err) = result {
                                tracing::error!(
                                    error = %err,
                                    "error during invoking of stream response filters"
                                );
                            }
                        }
                    }));
                }
            }

            meta.lock().expect("metadata lock").response_model = request.model();

            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            let Some(fallback) = self.config.fallback.as_ref() else {
                return Err(err);
            };

            if let Some(post_delay_ms) = fallback.post_delay_ms {
                tokio::time::sleep(Duration::from_millis(post_delay_ms)).await;
            }

            let max_retries = fallback
                .max_retries
                .filter(|max| *max > 0)
                .unwrap_or(DEFAULT_FALLBACK_MAX_RETRIES);
            if retried_count >= max_retries {
                return Err(err);
            }
            retried_count += 1;
        }
    }

    /// Response-side route filters log failures and continue.
    async fn run_response_filters(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
        response: &LLMResponse,
    ) {
        match request.request_type() {
            RequestType::ChatCompletions | RequestType::Completions => {
                if response.is_stream() {
                    return;
                }
                for filter in self.reversed_filters.with_role(FilterRole::CompletionResponse) {
                    let result = filter.on_completion_response(meta, request, response).await;
                    if let crate::filters::FilterResult::Failed(err) = result {
                        tracing::error!(
                            error = %err,
                            "error during invoking of completion response filters"
                        );
                    }
                }
            }
            RequestType::ImageGenerations => {
                for filter in self
                    .reversed_filters
                    .with_role(FilterRole::ImageGenerationsResponse)
                {
                    let result = filter
                        .on_image_generations_response(meta, request, response)
                        .await;
                    if let crate::filters::FilterResult::Failed(err) = result {
                        tracing::error!(
                            error = %err,
                            "error during invoking of image response filters"
                        );
                    }
                }
            }
            RequestType::TextToSpeech => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootkit::LifeCycle;
    use crate::config::{RouteMatch, RouteTarget, StringMatch};
    use crate::filters::Services;
    use crate::object::{CompletionsRequest, IncomingHttp};
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;
    use serde_json::json;

    fn route(matches: Vec<RouteMatch>, targets: Vec<RouteTarget>) -> Route {
        let lifecycle = LifeCycle::new();
        let services = Services::default();
        let ctx = FilterContext {
            lifecycle: &lifecycle,
            services: &services,
        };
        Route::new(
            RouteConfig {
                name: "r".to_string(),
                matches,
                targets,
                load_balance_policy: LoadBalancePolicy::Unspecified,
                filters: vec![],
                fallback: None,
            },
            &ctx,
        )
        .unwrap()
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

    fn target(cluster: &str) -> RouteTarget {
        RouteTarget {
            cluster: cluster.to_string(),
            namespace: None,
            weight: None,
        }
    }

    #[test]
    fn exact_match_binds_model() {
        let route = route(
            vec![RouteMatch {
                model: StringMatch::Exact("gpt-4".to_string()),
            }],
            vec![target("c")],
        );
        assert!(route.matches(&chat_request("gpt-4")));
        assert!(!route.matches(&chat_request("gpt-4o")));
    }

    #[test]
    fn prefix_match_binds_model() {
        let route = route(
            vec![RouteMatch {
                model: StringMatch::Prefix("gpt-".to_string()),
            }],
            vec![target("c")],
        );
        assert!(route.matches(&chat_request("gpt-4o")));
        assert!(!route.matches(&chat_request("o1")));
    }

    #[test]
    fn empty_targets_reject_the_match() {
        let route = route(
            vec![RouteMatch {
                model: StringMatch::Exact("gpt-4".to_string()),
            }],
            vec![],
        );
        assert!(!route.matches(&chat_request("gpt-4")));
    }
}
