//! Logical model resolution across providers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::strategy::{random_index, round_robin_index, weighted_index, Strategy, Weights};
use super::table::{ModelMapping, ModelTable, Target};
use crate::error::{GateError, Result};
use crate::provider::ProviderEndpoint;
use crate::ratelimit::{Permit, RateLimiter, DEFAULT_KEY_PREFIX};
use crate::store::SharedCounterStore;

/// Balancing behavior for pooled models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    /// When false every pool resolves to its first target.
    pub enabled: bool,
    pub strategy: Strategy,
    /// Steer away from targets whose limiter would make the caller wait.
    pub rate_limit_aware: bool,
    pub weights: Weights,
    pub key_prefix: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: Strategy::RoundRobin,
            rate_limit_aware: true,
            weights: Weights::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl LoadBalancerConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_rate_limit_aware(mut self, rate_limit_aware: bool) -> Self {
        self.rate_limit_aware = rate_limit_aware;
        self
    }

    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }
}

/// A resolved logical model: what to call and which limiter guards it.
#[derive(Debug, Clone)]
pub struct Route {
    pub logical: String,
    /// Provider-qualified model identifier.
    pub model: String,
    pub target: ProviderEndpoint,
    /// `None` when no limiter is configured for the target.
    pub limiter: Option<Arc<RateLimiter>>,
}

impl Route {
    /// Acquire through the route's limiter, or pass straight through when
    /// the target is unlimited.
    pub async fn acquire(&self) -> Result<Permit> {
        match &self.limiter {
            Some(limiter) => limiter.acquire().await,
            None => Ok(Permit::passthrough()),
        }
    }
}

/// Outcome counters for one provider target, local to this process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderMetrics {
    pub requests: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: f64,
}

/// Resolves logical model names to provider-qualified identifiers.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    table: ModelTable,
    limiters: HashMap<ProviderEndpoint, Arc<RateLimiter>>,
    store: Arc<dyn SharedCounterStore>,
    /// Fallback cursors per pool, used while the store is unreachable.
    local_cursors: Mutex<HashMap<String, u64>>,
    metrics: Mutex<HashMap<ProviderEndpoint, ProviderMetrics>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("config", &self.config)
            .field("models", &self.table.len())
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl LoadBalancer {
    /// Balancer over the built-in model table.
    pub fn new(
        config: LoadBalancerConfig,
        store: Arc<dyn SharedCounterStore>,
        limiters: Vec<Arc<RateLimiter>>,
    ) -> Self {
        Self::with_table(config, store, limiters, ModelTable::builtin())
    }

    pub fn with_table(
        config: LoadBalancerConfig,
        store: Arc<dyn SharedCounterStore>,
        limiters: Vec<Arc<RateLimiter>>,
        table: ModelTable,
    ) -> Self {
        let limiters = limiters
            .into_iter()
            .map(|limiter| (limiter.target().clone(), limiter))
            .collect();

        debug!(
            strategy = %config.strategy,
            rate_limit_aware = config.rate_limit_aware,
            enabled = config.enabled,
            models = table.len(),
            "Load balancer initialized"
        );

        Self {
            config,
            table,
            limiters,
            store,
            local_cursors: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn table(&self) -> &ModelTable {
        &self.table
    }

    /// Store key of the rotation cursor for the pool behind `logical`.
    /// Each pool rotates independently.
    pub fn cursor_key(&self, logical: &str) -> String {
        format!(
            "{}{}:{}:cursor",
            self.config.key_prefix,
            self.config.strategy.id(),
            logical
        )
    }

    pub fn limiter_for(&self, target: &ProviderEndpoint) -> Option<&Arc<RateLimiter>> {
        self.limiters.get(target)
    }

    /// Provider-qualified identifier for `logical`.
    pub async fn map_model(&self, logical: &str) -> Result<String> {
        Ok(self.select(logical).await?.model.clone())
    }

    /// Resolve `logical` together with the limiter to acquire before calling.
    pub async fn route(&self, logical: &str) -> Result<Route> {
        let target = self.select(logical).await?;
        let endpoint = target.provider_endpoint();
        Ok(Route {
            logical: logical.to_string(),
            model: target.model.clone(),
            limiter: self.limiters.get(&endpoint).cloned(),
            target: endpoint,
        })
    }

    async fn select(&self, logical: &str) -> Result<&Target> {
        let mapping = self
            .table
            .get(logical)
            .ok_or_else(|| GateError::UnknownModel(logical.to_string()))?;

        let candidates = match mapping {
            ModelMapping::Fixed(target) => return Ok(target),
            ModelMapping::Pool(targets) => targets,
        };
        let Some(primary) = candidates.first() else {
            return Err(GateError::Config(format!(
                "Model '{}' maps to an empty pool",
                logical
            )));
        };
        if !self.config.enabled {
            return Ok(primary);
        }

        let mut pool: Vec<&Target> = candidates.iter().collect();
        if self.config.rate_limit_aware {
            let checks = join_all(candidates.iter().map(|t| self.is_available(t))).await;
            let available: Vec<&Target> = candidates
                .iter()
                .zip(checks)
                .filter_map(|(target, ok)| ok.then_some(target))
                .collect();

            // All or nothing available: rotation decides.
            if !available.is_empty() && available.len() < candidates.len() {
                if let [only] = available.as_slice() {
                    debug!(
                        model = logical,
                        target = %only.provider_endpoint(),
                        "Only one target has capacity, skipping rotation"
                    );
                    return Ok(*only);
                }
                pool = available;
            }
        }

        let index = self.pick(logical, &pool).await;
        let chosen = pool[index];
        trace!(
            model = logical,
            strategy = %self.config.strategy,
            target = %chosen.provider_endpoint(),
            "Selected target"
        );
        Ok(chosen)
    }

    async fn is_available(&self, target: &Target) -> bool {
        let endpoint = target.provider_endpoint();
        let Some(limiter) = self.limiters.get(&endpoint) else {
            return true;
        };
        match limiter.can_acquire_now().await {
            Ok(available) => available,
            Err(e) => {
                warn!(target = %endpoint, error = %e, "Availability check failed, treating target as busy");
                false
            }
        }
    }

    async fn pick(&self, logical: &str, pool: &[&Target]) -> usize {
        match self.config.strategy {
            Strategy::RoundRobin => {
                round_robin_index(self.advance_cursor(logical).await, pool.len())
            }
            Strategy::Random => random_index(pool.len()),
            Strategy::Weighted => {
                let weights: Vec<u32> = pool
                    .iter()
                    .map(|t| self.config.weights.weight_of(&t.provider))
                    .collect();
                weighted_index(&weights)
            }
        }
    }

    /// Next value of the pool's shared rotation cursor. A store failure falls
    /// back to a cursor local to this process.
    async fn advance_cursor(&self, logical: &str) -> u64 {
        let key = self.cursor_key(logical);
        match self.store.increment(&key).await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(key = %key, error = %e, "Shared cursor unavailable, using local cursor");
                let mut cursors = self.local_cursors.lock();
                let cursor = cursors.entry(logical.to_string()).or_insert(0);
                *cursor += 1;
                *cursor
            }
        }
    }

    /// Record how a call through `target` went.
    pub fn record_outcome(&self, target: &ProviderEndpoint, success: bool, latency: Duration) {
        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(target.clone()).or_default();
        entry.requests += 1;
        if !success {
            entry.failures += 1;
        }
        entry.total_latency_ms += latency.as_millis() as u64;
        entry.avg_latency_ms = entry.total_latency_ms as f64 / entry.requests as f64;
    }

    /// Snapshot keyed by `provider[/endpoint]`.
    pub fn metrics(&self) -> BTreeMap<String, ProviderMetrics> {
        self.metrics
            .lock()
            .iter()
            .map(|(target, m)| (target.to_string(), m.clone()))
            .collect()
    }
}
