//! Composition root: one store, one limiter per provider target, one balancer.

use std::sync::Arc;

use tracing::info;

use crate::balancer::LoadBalancer;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::provider::{ProviderEndpoint, ProviderRegistry};
use crate::ratelimit::{LimiterStats, RateLimiter};
use crate::store::{self, SharedCounterStore};

/// Everything a worker process needs for admission control.
#[derive(Debug)]
pub struct Gateway {
    store: Arc<dyn SharedCounterStore>,
    limiters: Vec<Arc<RateLimiter>>,
    balancer: LoadBalancer,
}

impl Gateway {
    /// Validate `config`, connect to the store and build every component.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let registry = ProviderRegistry::builtin();
        config.validate(&registry)?;

        let store = store::connect(&config.store).await?;
        Self::build(config, store, &registry)
    }

    /// Build on an existing store; used when several gateways share one.
    pub fn with_store(
        config: &GatewayConfig,
        store: Arc<dyn SharedCounterStore>,
        registry: &ProviderRegistry,
    ) -> Result<Self> {
        config.validate(registry)?;
        Self::build(config, store, registry)
    }

    fn build(
        config: &GatewayConfig,
        store: Arc<dyn SharedCounterStore>,
        registry: &ProviderRegistry,
    ) -> Result<Self> {
        let limiters = config
            .limiter_configs()
            .into_iter()
            .map(|c| RateLimiter::with_registry(c, store.clone(), registry).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let balancer = LoadBalancer::with_table(
            config.load_balancer_config(),
            store.clone(),
            limiters.clone(),
            config.model_table(),
        );

        info!(
            storage = store.backend_name(),
            limiters = limiters.len(),
            models = balancer.table().len(),
            "Gateway ready"
        );

        Ok(Self {
            store,
            limiters,
            balancer,
        })
    }

    pub fn store(&self) -> &Arc<dyn SharedCounterStore> {
        &self.store
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn limiters(&self) -> &[Arc<RateLimiter>] {
        &self.limiters
    }

    pub fn limiter(&self, target: &ProviderEndpoint) -> Option<&Arc<RateLimiter>> {
        self.limiters.iter().find(|l| l.target() == target)
    }

    /// Stats for every limiter, in configuration order.
    pub async fn stats(&self) -> Result<Vec<LimiterStats>> {
        let mut stats = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            stats.push(limiter.get_stats().await?);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderLimitConfig;
    use crate::provider::{DASHSCOPE, VOLCENGINE};
    use crate::ratelimit::QpmLimit;

    #[tokio::test]
    async fn test_default_gateway_wires_components() {
        let gateway = Gateway::from_config(&GatewayConfig::default()).await.unwrap();
        assert_eq!(gateway.limiters().len(), 4);
        assert_eq!(gateway.store().backend_name(), "memory");

        let route = gateway.balancer().route("kimi").await.unwrap();
        let limiter = route.limiter.as_ref().unwrap();
        assert_eq!(
            limiter.target(),
            &ProviderEndpoint::new(VOLCENGINE, Some("ark-kimi"))
        );
        assert!(gateway
            .limiter(&ProviderEndpoint::new(DASHSCOPE, None))
            .is_some());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_connecting() {
        let mut config = GatewayConfig::default();
        config.providers.push(ProviderLimitConfig {
            provider: VOLCENGINE.to_string(),
            endpoint: Some("ark-unknown".to_string()),
            qpm_limit: QpmLimit::Limited(10),
            concurrent_limit: 1,
            enabled: true,
        });

        let err = Gateway::from_config(&config).await.unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("ark-unknown"));
    }

    #[tokio::test]
    async fn test_stats_cover_every_limiter() {
        let gateway = Gateway::from_config(&GatewayConfig::default()).await.unwrap();
        let stats = gateway.stats().await.unwrap();
        assert_eq!(stats.len(), 4);
        assert!(stats.iter().all(|s| s.active_requests == 0));
    }
}
