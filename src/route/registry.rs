use std::sync::{Arc, RwLock};

use crate::clusters::ClusterRegistry;
use crate::config::{RouteConfig, RouteMatch, RouteTarget, StringMatch};
use crate::error::{AppResult, LLMError};
use crate::filters::FilterContext;
use crate::metadata::SharedMetadata;
use crate::object::{LLMRequest, LLMResponse};
use crate::route::Route;

#[derive(Default)]
struct Inner {
    // Registration order is preserved; match-routes shadow base-routes on
    // name collision.
    match_routes: Vec<(String, Arc<Route>)>,
    base_routes: Vec<(String, Arc<Route>)>,
    merged: Vec<Arc<Route>>,
}

impl Inner {
    fn merge(&mut self) {
        let mut merged: Vec<Arc<Route>> = Vec::new();
        for (_, route) in &self.match_routes {
            merged.push(route.clone());
        }
        for (name, route) in &self.base_routes {
            if self.match_routes.iter().any(|(n, _)| n == name) {
                continue;
            }
            merged.push(route.clone());
        }
        self.merged = merged;
    }

    fn upsert(list: &mut Vec<(String, Arc<Route>)>, name: String, route: Arc<Route>) {
        if let Some(entry) = list.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = route;
        } else {
            list.push((name, route));
        }
    }
}

/// The auto-generated one-per-cluster route: exact model match on the
/// cluster's own name.
pub fn init_direct_model_route(model_name: &str) -> RouteConfig {
    RouteConfig {
        name: model_name.to_string(),
        matches: vec![RouteMatch {
            model: StringMatch::Exact(model_name.to_string()),
        }],
        targets: vec![RouteTarget {
            cluster: model_name.to_string(),
            namespace: None,
            weight: None,
        }],
        load_balance_policy: crate::config::LoadBalancePolicy::Unspecified,
        filters: vec![],
        fallback: None,
    }
}

/// Process-wide route registry: two maps under one RW-lock, with the derived
/// scan list recomputed on every mutation.
#[derive(Default)]
pub struct RouteRegistry {
    inner: RwLock<Inner>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_match_route_with_config(
        &self,
        config: RouteConfig,
        ctx: &FilterContext<'_>,
    ) -> AppResult<()> {
        let name = config.name.clone();
        let route = Arc::new(Route::new(config, ctx)?);
        let mut inner = self.inner.write().expect("route registry lock");
        Inner::upsert(&mut inner.match_routes, name.clone(), route);
        inner.merge();
        tracing::info!(%name, "register match route");
        Ok(())
    }

    pub fn register_base_route_with_config(
        &self,
        config: RouteConfig,
        ctx: &FilterContext<'_>,
    ) -> AppResult<()> {
        let name = config.name.clone();
        let route = Arc::new(Route::new(config, ctx)?);
        let mut inner = self.inner.write().expect("route registry lock");
        Inner::upsert(&mut inner.base_routes, name.clone(), route);
        inner.merge();
        tracing::info!(%name, "register base route");
        Ok(())
    }

    pub fn remove_match_route(&self, name: &str) {
        let mut inner = self.inner.write().expect("route registry lock");
        inner.match_routes.retain(|(n, _)| n != name);
        inner.merge();
        tracing::info!(%name, "remove match route");
    }

    pub fn remove_base_route(&self, name: &str) {
        let mut inner = self.inner.write().expect("route registry lock");
        inner.base_routes.retain(|(n, _)| n != name);
        inner.merge();
        tracing::info!(%name, "remove base route");
    }

    /// First route whose match-predicates satisfy the request, in
    /// registration order.
    pub fn match_route(&self, request: &LLMRequest) -> Option<Arc<Route>> {
        let inner = self.inner.read().expect("route registry lock");
        inner
            .merged
            .iter()
            .find(|route| route.matches(request))
            .cloned()
    }

    pub async fn handle_request(
        &self,
        meta: &SharedMetadata,
        clusters: &ClusterRegistry,
        request: &LLMRequest,
    ) -> AppResult<LLMResponse> {
        let Some(route) = self.match_route(request) else {
            return Err(LLMError::model_not_found(&request.model()));
        };

        meta.lock().expect("metadata lock").matched_route = Some(route.name().to_string());

        route.handle_request(meta, clusters, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootkit::LifeCycle;
    use crate::config::LoadBalancePolicy;
    use crate::filters::Services;
    use crate::object::{CompletionsRequest, IncomingHttp, RequestType};
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;
    use serde_json::json;

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

    fn route_config(name: &str, model: &str, cluster: &str) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            matches: vec![RouteMatch {
                model: StringMatch::Exact(model.to_string()),
            }],
            targets: vec![RouteTarget {
                cluster: cluster.to_string(),
                namespace: None,
                weight: None,
            }],
            load_balance_policy: LoadBalancePolicy::Unspecified,
            filters: vec![],
            fallback: None,
        }
    }

    #[test]
    fn match_routes_take_precedence_over_base_routes() {
        let registry = RouteRegistry::new();
        let lifecycle = LifeCycle::new();
        let services = Services::default();
        let ctx = FilterContext {
            lifecycle: &lifecycle,
            services: &services,
        };

        registry
            .register_base_route_with_config(route_config("gpt-4", "gpt-4", "base-cluster"), &ctx)
            .unwrap();
        registry
            .register_match_route_with_config(route_config("gpt-4", "gpt-4", "match-cluster"), &ctx)
            .unwrap();

        let matched = registry.match_route(&chat_request("gpt-4")).unwrap();
        assert_eq!(matched.config().targets[0].cluster, "match-cluster");

        // Removing the match-route falls back to the shadowed base route.
        registry.remove_match_route("gpt-4");
        let matched = registry.match_route(&chat_request("gpt-4")).unwrap();
        assert_eq!(matched.config().targets[0].cluster, "base-cluster");
    }

    #[test]
    fn unmatched_model_returns_none() {
        let registry = RouteRegistry::new();
        let lifecycle = LifeCycle::new();
        let services = Services::default();
        let ctx = FilterContext {
            lifecycle: &lifecycle,
            services: &services,
        };
        registry
            .register_base_route_with_config(route_config("gpt-4", "gpt-4", "c"), &ctx)
            .unwrap();
        assert!(registry.match_route(&chat_request("claude-3")).is_none());
    }

    #[test]
    fn direct_model_route_matches_its_own_name() {
        let config = init_direct_model_route("my-model");
        assert_eq!(config.name, "my-model");
        assert_eq!(config.targets[0].cluster, "my-model");
        match &config.matches[0].model {
            StringMatch::Exact(exact) => assert_eq!(exact, "my-model"),
            StringMatch::Prefix(_) => panic!("expected exact match"),
        }
    }
}
