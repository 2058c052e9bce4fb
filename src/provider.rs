//! Known providers and their endpoints.
//!
//! Some providers address each deployed model through a named endpoint and
//! keep separate quotas per endpoint. The registry is the single place that
//! knows which `(provider, endpoint)` pairs exist; limiters refuse to be built
//! for anything else.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

pub const DASHSCOPE: &str = "dashscope";
pub const VOLCENGINE: &str = "volcengine";

/// Endpoints served under the Volcengine ARK provider.
pub const VOLCENGINE_ENDPOINTS: &[&str] = &["ark-deepseek", "ark-kimi", "ark-doubao"];

/// A validated provider, optionally narrowed to one of its endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl ProviderEndpoint {
    /// Build a pair without validation. Use [`ProviderRegistry::validate`]
    /// for anything that comes from configuration.
    pub fn new(provider: &str, endpoint: Option<&str>) -> Self {
        Self {
            provider: provider.to_string(),
            endpoint: endpoint.map(str::to_string),
        }
    }

    /// Stable store key fragment: `provider` or `provider:endpoint`.
    pub fn key(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}:{}", self.provider, endpoint),
            None => self.provider.clone(),
        }
    }
}

impl fmt::Display for ProviderEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(endpoint) => write!(f, "{}/{}", self.provider, endpoint),
            None => f.write_str(&self.provider),
        }
    }
}

/// Whether a provider is addressed through endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointPolicy {
    /// The provider takes no endpoint.
    Unqualified,
    /// An endpoint from this allow-list is required.
    Qualified(Vec<String>),
}

/// The finite set of supported providers.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, EndpointPolicy>,
}

impl ProviderRegistry {
    /// An empty registry that accepts nothing.
    pub fn empty() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// Dashscope (unqualified) and Volcengine with its three ARK endpoints.
    pub fn builtin() -> Self {
        Self::empty()
            .with_provider(DASHSCOPE, EndpointPolicy::Unqualified)
            .with_provider(
                VOLCENGINE,
                EndpointPolicy::Qualified(
                    VOLCENGINE_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
                ),
            )
    }

    pub fn with_provider(mut self, provider: &str, policy: EndpointPolicy) -> Self {
        self.providers.insert(provider.to_string(), policy);
        self
    }

    pub fn policy(&self, provider: &str) -> Option<&EndpointPolicy> {
        self.providers.get(provider)
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Check that `(provider, endpoint)` is a supported combination.
    pub fn validate(&self, provider: &str, endpoint: Option<&str>) -> Result<ProviderEndpoint> {
        let policy = self.providers.get(provider).ok_or_else(|| {
            GateError::Config(format!(
                "Unknown provider '{}' (supported: {})",
                provider,
                self.providers().collect::<Vec<_>>().join(", ")
            ))
        })?;

        match (policy, endpoint) {
            (EndpointPolicy::Unqualified, None) => Ok(ProviderEndpoint::new(provider, None)),
            (EndpointPolicy::Unqualified, Some(endpoint)) => Err(GateError::Config(format!(
                "Provider '{}' does not take an endpoint, got '{}'",
                provider, endpoint
            ))),
            (EndpointPolicy::Qualified(allowed), None) => Err(GateError::Config(format!(
                "Provider '{}' requires an endpoint (one of: {})",
                provider,
                allowed.join(", ")
            ))),
            (EndpointPolicy::Qualified(allowed), Some(endpoint)) => {
                if allowed.iter().any(|e| e == endpoint) {
                    Ok(ProviderEndpoint::new(provider, Some(endpoint)))
                } else {
                    Err(GateError::Config(format!(
                        "Invalid endpoint '{}' for provider '{}' (one of: {})",
                        endpoint,
                        provider,
                        allowed.join(", ")
                    )))
                }
            }
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
