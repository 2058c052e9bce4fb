//! llmgate - Cross-process admission control for LLM provider calls
//!
//! Worker processes share QPM and concurrency quotas per provider through a
//! common counter store (Redis in production). A load balancer maps logical
//! model names onto provider-qualified models, steering pooled models away
//! from providers that are at capacity.

pub mod balancer;
pub mod config;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod ratelimit;
pub mod store;

pub use balancer::{LoadBalancer, LoadBalancerConfig, Route, Strategy};
pub use config::GatewayConfig;
pub use error::{GateError, Result};
pub use gateway::Gateway;
pub use provider::{ProviderEndpoint, ProviderRegistry};
pub use ratelimit::{Permit, QpmLimit, RateLimiter, RateLimiterConfig};
pub use store::{MemoryStore, RedisStore, SharedCounterStore};
