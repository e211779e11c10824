use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::bootkit::LifeCycle;
use crate::clusters::Cluster;
use crate::config::ClusterConfig;
use crate::error::{AppResult, LLMError};
use crate::metadata::SharedMetadata;
use crate::object::{LLMRequest, LLMResponse};

#[derive(Default)]
struct Inner {
    clusters: HashMap<String, Arc<Cluster>>,
    configs: HashMap<String, ClusterConfig>,
}

/// Process-wide mapping from cluster name to cluster. Writers are rare
/// (config reconciliation); readers run on every request.
#[derive(Default)]
pub struct ClusterRegistry {
    inner: RwLock<Inner>,
    http: reqwest::Client,
}

impl ClusterRegistry {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            http,
        }
    }

    pub fn upsert_and_register_cluster(
        &self,
        config: ClusterConfig,
        lifecycle: &LifeCycle,
    ) -> AppResult<()> {
        let cluster = Arc::new(Cluster::new(config.clone(), self.http.clone(), lifecycle)?);
        let mut inner = self.inner.write().expect("cluster registry lock");
        inner.configs.insert(config.name.clone(), config.clone());
        inner.clusters.insert(config.name.clone(), cluster);
        tracing::info!(name = %config.name, "register cluster");
        Ok(())
    }

    pub fn remove_cluster(&self, name: &str) {
        let mut inner = self.inner.write().expect("cluster registry lock");
        inner.clusters.remove(name);
        inner.configs.remove(name);
        tracing::info!(%name, "remove cluster");
    }

    pub fn find_cluster_by_name(&self, name: &str) -> Option<Arc<Cluster>> {
        self.inner
            .read()
            .expect("cluster registry lock")
            .clusters
            .get(name)
            .cloned()
    }

    /// Every registered cluster config, for the models listing.
    pub fn list_models(&self) -> Vec<ClusterConfig> {
        let inner = self.inner.read().expect("cluster registry lock");
        inner.configs.values().cloned().collect()
    }

    pub async fn handle_request(
        &self,
        meta: &SharedMetadata,
        cluster_name: &str,
        request: LLMRequest,
    ) -> AppResult<LLMResponse> {
        let Some(cluster) = self.find_cluster_by_name(cluster_name) else {
            return Err(LLMError::model_not_found(&request.model()));
        };

        meta.lock().expect("metadata lock").selected_cluster = Some(cluster_name.to_string());

        let response = cluster.do_upstream_request(meta, request).await?;

        // Upstream failures are errors (and eligible for route fallback). An
        // error body delivered with a 2xx status is surfaced as-is instead.
        if let Some(error) = response.error() {
            if error.status.as_u16() >= 400 {
                return Err(error);
            }
        }

        Ok(response)
    }
}
