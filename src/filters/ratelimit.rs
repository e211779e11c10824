use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;

use crate::bootkit::LifeCycleHook;
use crate::error::{AppResult, LLMError};
use crate::filters::{
    FilterContext, FilterEntry, FilterResult, FilterRole, RequestFilter, RpcError,
};
use crate::metadata::SharedMetadata;
use crate::object::LLMRequest;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const MAX_TTL: Duration = Duration::from_secs(5 * 60);
const TTL_RATE: u32 = 2;

const NUM_SHARDS: usize = 64;
const MAX_BUCKETS_PER_SHARD: usize = 10_000;

// Fixed-point precision for sub-unit refill fairness.
const PRECISION: i64 = 1000;

const DEFAULT_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_SERVER_PREFIX: &str = "modelgate-rate-limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBaseOn {
    ApiKey,
    UserId,
}

impl RateLimitBaseOn {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::UserId => "user_id",
        }
    }
}

/// Policy scope matcher. Absent means "any value of based_on".
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMatch {
    Exact(String),
    Prefix(String),
}

impl RateLimitMatch {
    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(exact) => value == exact,
            Self::Prefix(prefix) => !prefix.is_empty() && value.starts_with(prefix),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitPolicy {
    pub based_on: RateLimitBaseOn,
    #[serde(default, rename = "match")]
    pub matcher: Option<RateLimitMatch>,
    pub limit: u64,
    #[serde(default)]
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    Local,
    Redis,
}

impl Default for RateLimitMode {
    fn default() -> Self {
        RateLimitMode::Local
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitFilterConfig {
    #[serde(default)]
    pub server_prefix: String,
    #[serde(default)]
    pub mode: RateLimitMode,
    #[serde(default)]
    pub policies: Vec<RateLimitPolicy>,
}

/// Remote token-bucket backend (Redis). Lives outside the gateway and is
/// consumed through this trait.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn check(&self, key: &str, window: Duration, limit: u64) -> Result<bool, RpcError>;
}

/// Fixed-point token bucket. Atomic fields keep refill O(1) under the shard
/// lock with no per-bucket mutex.
struct TokenBucket {
    tokens: AtomicI64,
    capacity: AtomicI64,
    rate: AtomicI64,
    last_update: AtomicI64,
    old_limit: AtomicI64,
    expire_at: AtomicI64,
}

impl TokenBucket {
    fn new(limit: u64, capacity: i64, rate: i64, now_ns: i64, expire_at: i64) -> Self {
        Self {
            tokens: AtomicI64::new(capacity),
            capacity: AtomicI64::new(capacity),
            rate: AtomicI64::new(rate),
            last_update: AtomicI64::new(now_ns),
            old_limit: AtomicI64::new(limit as i64),
            expire_at: AtomicI64::new(expire_at),
        }
    }

    fn try_consume(&self, now_ns: i64) -> bool {
        let last_update = self.last_update.load(Ordering::Acquire);
        let elapsed_secs = (now_ns - last_update) / 1_000_000_000;
        let tokens_to_add = elapsed_secs * self.rate.load(Ordering::Acquire);

        if tokens_to_add > 0 {
            let new_tokens = (self.tokens.load(Ordering::Acquire) + tokens_to_add)
                .min(self.capacity.load(Ordering::Acquire));
            self.tokens.store(new_tokens, Ordering::Release);
            self.last_update.store(now_ns, Ordering::Release);
        }

        if self.tokens.load(Ordering::Acquire) >= PRECISION {
            self.tokens.fetch_sub(PRECISION, Ordering::AcqRel);
            return true;
        }

        false
    }
}

#[derive(Default)]
struct Shard {
    buckets: HashMap<String, Arc<TokenBucket>>,
    last_access: HashMap<String, i64>,
}

impl Shard {
    fn evict_oldest(&mut self) {
        let oldest = self
            .last_access
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            tracing::debug!(%key, "evicting least-recently-accessed rate limit bucket");
            self.buckets.remove(&key);
            self.last_access.remove(&key);
        }
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Local sharded limiter keyed by FNV-1a of the bucket key.
pub struct LocalRateLimiter {
    shards: Vec<Mutex<Shard>>,
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRateLimiter {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        for _ in 0..NUM_SHARDS {
            shards.push(Mutex::new(Shard::default()));
        }
        Self { shards }
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let index = fnv1a_32(key.as_bytes()) as usize % self.shards.len();
        &self.shards[index]
    }

    pub fn check(&self, key: &str, window: Duration, limit: u64) -> bool {
        let window = if window.is_zero() { DEFAULT_DURATION } else { window };
        let now = now_nanos();
        let ttl = MAX_TTL.max(window * TTL_RATE);
        let expire_at = now + ttl.as_nanos() as i64;

        let capacity = (limit as i64) * PRECISION;
        let rate = ((capacity as f64) / window.as_secs_f64()) as i64;

        let mut shard = self.shard(key).lock().expect("rate limit shard lock");
        shard.last_access.insert(key.to_string(), now);

        let expired = shard
            .buckets
            .get(key)
            .map(|bucket| now > bucket.expire_at.load(Ordering::Acquire))
            .unwrap_or(false);
        if expired {
            shard.buckets.remove(key);
            shard.last_access.remove(key);
        }

        if !shard.buckets.contains_key(key) {
            if shard.buckets.len() >= MAX_BUCKETS_PER_SHARD {
                shard.evict_oldest();
            }
            shard.buckets.insert(
                key.to_string(),
                Arc::new(TokenBucket::new(limit, capacity, rate, now, expire_at)),
            );
            shard.last_access.insert(key.to_string(), now);
        }

        let bucket = shard.buckets.get(key).expect("bucket inserted above").clone();
        drop(shard);

        if bucket.old_limit.load(Ordering::Acquire) != limit as i64 {
            bucket.old_limit.store(limit as i64, Ordering::Release);
            bucket.capacity.store(capacity, Ordering::Release);
            bucket.rate.store(rate, Ordering::Release);
        }
        bucket.expire_at.store(expire_at, Ordering::Release);

        bucket.try_consume(now)
    }

    fn cleanup(&self) {
        let now = now_nanos();
        for (index, shard) in self.shards.iter().enumerate() {
            let mut shard = shard.lock().expect("rate limit shard lock");
            let before = shard.buckets.len();
            shard
                .buckets
                .retain(|_, bucket| now <= bucket.expire_at.load(Ordering::Acquire));
            let buckets = std::mem::take(&mut shard.buckets);
            shard.last_access.retain(|key, _| buckets.contains_key(key));
            shard.buckets = buckets;
            let removed = before - shard.buckets.len();
            if removed > 0 {
                tracing::debug!(shard = index, removed, "cleaned expired rate limit buckets");
            }
        }
    }
}

fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub struct RateLimitFilter {
    server_prefix: String,
    policies: Vec<RateLimitPolicy>,
    mode: RateLimitMode,
    local: Arc<LocalRateLimiter>,
    remote: Option<Arc<dyn RateLimitStore>>,
}

impl RateLimitFilter {
    pub fn new(config: RateLimitFilterConfig, remote: Option<Arc<dyn RateLimitStore>>) -> Self {
        let server_prefix = if config.server_prefix.is_empty() {
            DEFAULT_SERVER_PREFIX.to_string()
        } else {
            config.server_prefix
        };
        Self {
            server_prefix,
            policies: config.policies,
            mode: config.mode,
            local: Arc::new(LocalRateLimiter::new()),
            remote,
        }
    }

    pub fn spawn_cleanup(&self, lifecycle: &crate::bootkit::LifeCycle) {
        if self.mode != RateLimitMode::Local {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let limiter = self.local.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.cleanup(),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("stopping rate limiter cleanup loop");
                            return;
                        }
                    }
                }
            }
        });
        lifecycle.append(LifeCycleHook::on_stop(move || async move {
            let _ = shutdown_tx.send(true);
            Ok(())
        }));
    }

    fn find_matching_policy(&self, api_key_id: &str, user_id: &str) -> Option<&RateLimitPolicy> {
        self.policies.iter().find(|policy| {
            let value = match policy.based_on {
                RateLimitBaseOn::ApiKey => api_key_id,
                RateLimitBaseOn::UserId => user_id,
            };
            match &policy.matcher {
                None => true,
                Some(matcher) => matcher.matches(value),
            }
        })
    }

    fn build_key(&self, based_on: RateLimitBaseOn, value: &str, model: &str) -> String {
        format!("{}:{}:{}:{}", self.server_prefix, based_on.as_str(), value, model)
    }

    async fn allow_request(&self, api_key_id: &str, user_id: &str, model: &str) -> AppResult<bool> {
        let Some(policy) = self.find_matching_policy(api_key_id, user_id) else {
            return Ok(true);
        };

        // limit 0 disables the policy
        if policy.limit == 0 {
            return Ok(true);
        }

        let value = match policy.based_on {
            RateLimitBaseOn::ApiKey => api_key_id,
            RateLimitBaseOn::UserId => user_id,
        };

        let window = if policy.duration_secs == 0 {
            DEFAULT_DURATION
        } else {
            Duration::from_secs(policy.duration_secs)
        };

        let key = self.build_key(policy.based_on, value, model);

        match self.mode {
            RateLimitMode::Local => Ok(self.local.check(&key, window, policy.limit)),
            RateLimitMode::Redis => {
                let store = self.remote.as_ref().ok_or_else(|| {
                    LLMError::internal_error()
                        .with_cause("redis rate limit mode requires a remote store")
                })?;
                store
                    .check(&key, window, policy.limit)
                    .await
                    .map_err(|err| LLMError::internal_error().with_cause(err))
            }
        }
    }

    async fn on_request(&self, meta: &SharedMetadata, request: &LLMRequest) -> FilterResult {
        let (api_key_id, user_id) = {
            let guard = meta.lock().expect("metadata lock");
            match &guard.auth_info {
                Some(auth) => (auth.api_key_id.clone(), auth.user_id.clone()),
                None => (String::new(), String::new()),
            }
        };

        if api_key_id.is_empty() && user_id.is_empty() {
            tracing::debug!("no api key or user id in metadata, skipping rate limit");
            return FilterResult::Ok;
        }

        match self
            .allow_request(&api_key_id, &user_id, &request.model())
            .await
        {
            Ok(true) => FilterResult::Ok,
            Ok(false) => {
                tracing::debug!(
                    api_key_id,
                    user_id,
                    model = %request.model(),
                    "rate limit exceeded"
                );
                FilterResult::failed(LLMError::rate_limit_exceeded())
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to check rate limit");
                FilterResult::failed(err)
            }
        }
    }
}

#[async_trait]
impl RequestFilter for RateLimitFilter {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn roles(&self) -> &'static [FilterRole] {
        &[
            FilterRole::CompletionRequest,
            FilterRole::ImageGenerationsRequest,
        ]
    }

    async fn on_completion_request(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
    ) -> FilterResult {
        self.on_request(meta, request).await
    }

    async fn on_image_generations_request(
        &self,
        meta: &SharedMetadata,
        request: &LLMRequest,
    ) -> FilterResult {
        self.on_request(meta, request).await
    }
}

fn new_with_config(
    config: serde_json::Value,
    ctx: &FilterContext<'_>,
) -> AppResult<Arc<dyn RequestFilter>> {
    let config: RateLimitFilterConfig = serde_json::from_value(config)
        .map_err(|err| LLMError::internal_error().with_cause(err))?;
    let filter = RateLimitFilter::new(config, None);
    filter.spawn_cleanup(ctx.lifecycle);
    Ok(Arc::new(filter))
}

inventory::submit!(FilterEntry {
    name: "rate-limit",
    factory: new_with_config,
});
