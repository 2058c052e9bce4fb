//! Configuration management for llmgate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::balancer::{LoadBalancerConfig, ModelTable, Strategy, Weights};
use crate::error::{GateError, Result};
use crate::provider::{ProviderRegistry, DASHSCOPE, VOLCENGINE};
use crate::ratelimit::{QpmLimit, RateLimiterConfig, DEFAULT_KEY_PREFIX};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "LLMGATE";

/// Main configuration for a gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Shared counter store
    #[serde(default)]
    pub store: StoreConfig,

    /// Timing settings applied to every limiter
    #[serde(default)]
    pub limiter_defaults: LimiterDefaults,

    /// One entry per provider or provider endpoint
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderLimitConfig>,

    #[serde(default)]
    pub load_balancer: LoadBalancerSettings,

    /// Replaces the built-in model table when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelTable>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            limiter_defaults: LimiterDefaults::default(),
            providers: default_providers(),
            load_balancer: LoadBalancerSettings::default(),
            models: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only coordinates tasks within one process.
    #[default]
    Memory,
    Redis,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, used by the redis backend
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            op_timeout_ms: default_op_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_op_timeout() -> u64 {
    1000
}

/// Timing settings shared by every limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterDefaults {
    /// QPM window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Expiry on concurrency keys in seconds
    #[serde(default = "default_concurrency_ttl")]
    pub concurrency_ttl_secs: u64,

    /// Bound on `acquire()`; unset waits indefinitely
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    /// Retry interval while concurrency is saturated
    #[serde(default = "default_backoff")]
    pub concurrency_backoff_ms: u64,

    /// Maximum random delay added to every wait
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
}

impl Default for LimiterDefaults {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            concurrency_ttl_secs: default_concurrency_ttl(),
            acquire_timeout_ms: None,
            concurrency_backoff_ms: default_backoff(),
            jitter_ms: default_jitter(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_concurrency_ttl() -> u64 {
    300
}

fn default_backoff() -> u64 {
    100
}

fn default_jitter() -> u64 {
    250
}

/// Limits for one provider or provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimitConfig {
    pub provider: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Integer or `"unlimited"`
    pub qpm_limit: QpmLimit,

    pub concurrent_limit: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProviderLimitConfig {
    fn new(provider: &str, endpoint: Option<&str>, qpm_limit: u64, concurrent_limit: u64) -> Self {
        Self {
            provider: provider.to_string(),
            endpoint: endpoint.map(str::to_string),
            qpm_limit: QpmLimit::Limited(qpm_limit),
            concurrent_limit,
            enabled: true,
        }
    }
}

/// Defaults sit at 90% of each provider's published RPM.
fn default_providers() -> Vec<ProviderLimitConfig> {
    vec![
        ProviderLimitConfig::new(DASHSCOPE, None, 13_500, 500),
        ProviderLimitConfig::new(VOLCENGINE, Some("ark-deepseek"), 13_500, 500),
        ProviderLimitConfig::new(VOLCENGINE, Some("ark-kimi"), 4_500, 500),
        ProviderLimitConfig::new(VOLCENGINE, Some("ark-doubao"), 27_000, 500),
    ]
}

fn default_true() -> bool {
    true
}

/// Load balancer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default = "default_true")]
    pub rate_limit_aware: bool,

    /// Provider weights for the `weighted` strategy
    #[serde(default)]
    pub weights: Weights,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: Strategy::default(),
            rate_limit_aware: true,
            weights: Weights::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GateError::Config(e.to_string()))
    }

    /// Layer an optional YAML file under `LLMGATE_*` environment variables.
    ///
    /// Nested keys are separated by `__`, so `LLMGATE_STORE__URL` sets
    /// `store.url`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject duplicate limiter entries and unknown provider/endpoint pairs.
    pub fn validate(&self, registry: &ProviderRegistry) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.providers {
            let target = registry.validate(&entry.provider, entry.endpoint.as_deref())?;
            if !seen.insert(target.clone()) {
                return Err(GateError::Config(format!(
                    "Duplicate limits configured for {}",
                    target
                )));
            }
        }
        if self.limiter_defaults.window_secs == 0 {
            return Err(GateError::Config("window_secs must be positive".to_string()));
        }
        if let Some(models) = &self.models {
            models.validate(registry)?;
        }
        Ok(())
    }

    /// Limiter configs with the shared timing settings applied.
    pub fn limiter_configs(&self) -> Vec<RateLimiterConfig> {
        let defaults = &self.limiter_defaults;
        self.providers
            .iter()
            .map(|entry| {
                let mut config =
                    RateLimiterConfig::new(&entry.provider, 0, entry.concurrent_limit)
                        .with_qpm_limit(entry.qpm_limit)
                        .with_enabled(entry.enabled)
                        .with_window(Duration::from_secs(defaults.window_secs))
                        .with_concurrency_ttl(Duration::from_secs(defaults.concurrency_ttl_secs))
                        .with_acquire_timeout(defaults.acquire_timeout_ms.map(Duration::from_millis))
                        .with_backoff(
                            Duration::from_millis(defaults.concurrency_backoff_ms),
                            Duration::from_millis(defaults.jitter_ms),
                        )
                        .with_key_prefix(&self.store.key_prefix);
                if let Some(endpoint) = &entry.endpoint {
                    config = config.with_endpoint(endpoint);
                }
                config
            })
            .collect()
    }

    pub fn load_balancer_config(&self) -> LoadBalancerConfig {
        let settings = &self.load_balancer;
        LoadBalancerConfig::default()
            .with_enabled(settings.enabled)
            .with_strategy(settings.strategy)
            .with_rate_limit_aware(settings.rate_limit_aware)
            .with_weights(settings.weights.clone())
            .with_key_prefix(&self.store.key_prefix)
    }

    /// The configured model table, or the built-in one.
    pub fn model_table(&self) -> ModelTable {
        self.models.clone().unwrap_or_else(ModelTable::builtin)
    }
}
