use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upstream protocol family. Selects the provider adapter for a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    Vllm,
    Ollama,
    OpenRouter,
    MicrosoftSpeechServiceV1,
    ElevenLabsV1,
    KoemotionV1,
    VolcengineSeedSpeechV1,
    DeepgramV1,
    AlibabaCosyVoice,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "open_ai",
            Self::Vllm => "vllm",
            Self::Ollama => "ollama",
            Self::OpenRouter => "open_router",
            Self::MicrosoftSpeechServiceV1 => "microsoft_speech_service_v1",
            Self::ElevenLabsV1 => "eleven_labs_v1",
            Self::KoemotionV1 => "koemotion_v1",
            Self::VolcengineSeedSpeechV1 => "volcengine_seed_speech_v1",
            Self::DeepgramV1 => "deepgram_v1",
            Self::AlibabaCosyVoice => "alibaba_cosy_voice",
        }
    }

    /// WebSocket-only providers bypass the HTTP marshaller stage.
    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::AlibabaCosyVoice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    Unspecified,
    WeightedRoundRobin,
    WeightedLeastRequest,
    Custom,
}

impl Default for LoadBalancePolicy {
    fn default() -> Self {
        LoadBalancePolicy::Unspecified
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderConfig {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub default_params: Map<String, Value>,
    #[serde(default)]
    pub override_params: Map<String, Value>,
    #[serde(default)]
    pub remove_param_keys: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            timeout_ms: None,
            default_params: Map::new(),
            override_params: Map::new(),
            remove_param_keys: Vec::new(),
        }
    }
}

/// How image-generation billing derives image dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeFrom {
    Unspecified,
    Input,
    Output,
    Greatest,
}

impl Default for SizeFrom {
    fn default() -> Self {
        SizeFrom::Unspecified
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MeteringPolicy {
    #[serde(default)]
    pub size_from: SizeFrom,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    pub provider: Provider,
    #[serde(default)]
    pub load_balance_policy: LoadBalancePolicy,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub metering_policy: Option<MeteringPolicy>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
}

impl StringMatch {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            StringMatch::Exact(exact) => !exact.is_empty() && value == exact,
            StringMatch::Prefix(prefix) => !prefix.is_empty() && value.starts_with(prefix),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteMatch {
    pub model: StringMatch,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteTarget {
    pub cluster: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub weight: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    #[serde(default)]
    pub pre_delay_ms: Option<u64>,
    #[serde(default)]
    pub post_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub name: String,
    #[serde(default)]
    pub matches: Vec<RouteMatch>,
    #[serde(default)]
    pub targets: Vec<RouteTarget>,
    #[serde(default)]
    pub load_balance_policy: LoadBalancePolicy,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "default_access_log")]
    pub access_log: bool,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default = "default_drain_wait_secs")]
    pub drain_wait_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            access_log: default_access_log(),
            filters: Vec::new(),
            drain_wait_secs: default_drain_wait_secs(),
        }
    }
}

fn default_access_log() -> bool {
    true
}

fn default_drain_wait_secs() -> u64 {
    15
}

/// Static configuration for a single-process gateway: the dev-mode equivalent
/// of the reconciled cluster/route records.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cluster_config_roundtrip() {
        let cfg: ClusterConfig = serde_json::from_value(json!({
            "name": "gpt-4",
            "provider": "open_ai",
            "load_balance_policy": "unspecified",
            "upstream": {
                "url": "https://api.openai.com/v1",
                "headers": [{"key": "Authorization", "value": "Bearer sk-x"}],
                "default_params": {"temperature": 0.7},
                "override_params": {"model": "openai/gpt-4"},
                "remove_param_keys": ["user"]
            },
            "metering_policy": {"size_from": "output"}
        }))
        .unwrap();
        assert_eq!(cfg.name, "gpt-4");
        assert_eq!(cfg.provider, Provider::OpenAi);
        assert_eq!(
            cfg.metering_policy.unwrap().size_from,
            SizeFrom::Output
        );
        assert_eq!(cfg.upstream.headers.len(), 1);
    }

    #[test]
    fn string_match_semantics() {
        let exact: StringMatch = serde_json::from_value(json!({"exact": "gpt-4"})).unwrap();
        assert!(exact.matches("gpt-4"));
        assert!(!exact.matches("gpt-4o"));

        let prefix: StringMatch = serde_json::from_value(json!({"prefix": "gpt-"})).unwrap();
        assert!(prefix.matches("gpt-4o"));
        assert!(!prefix.matches("o1"));

        let empty = StringMatch::Exact(String::new());
        assert!(!empty.matches(""));
    }

    #[test]
    fn route_defaults() {
        let cfg: RouteConfig = serde_json::from_value(json!({
            "name": "r",
            "matches": [{"model": {"exact": "m"}}],
            "targets": [{"cluster": "c"}]
        }))
        .unwrap();
        assert!(cfg.fallback.is_none());
        assert_eq!(cfg.load_balance_policy, LoadBalancePolicy::Unspecified);
        assert!(cfg.targets[0].weight.is_none());
    }
}
