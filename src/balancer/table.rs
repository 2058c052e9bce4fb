//! Logical model to provider mapping table.
//!
//! Each logical model either always resolves to one provider-qualified model
//! (`Fixed`) or to a pool of equivalent ones the balancer chooses between.
//!
//! The YAML form is a map of logical name to a single target or a list:
//!
//! ```yaml
//! qwen: { model: qwen, provider: dashscope }
//! deepseek:
//!   - { model: deepseek, provider: dashscope }
//!   - { model: ark-deepseek, provider: volcengine, endpoint: ark-deepseek }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::{GateError, Result};
use crate::provider::{ProviderEndpoint, ProviderRegistry, DASHSCOPE, VOLCENGINE};

/// A concrete model identifier and where it is served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Identifier the caller sends to the provider.
    pub model: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Target {
    pub fn new(model: &str, provider: &str, endpoint: Option<&str>) -> Self {
        Self {
            model: model.to_string(),
            provider: provider.to_string(),
            endpoint: endpoint.map(str::to_string),
        }
    }

    /// The limiter this target is admitted through.
    pub fn provider_endpoint(&self) -> ProviderEndpoint {
        ProviderEndpoint::new(&self.provider, self.endpoint.as_deref())
    }
}

/// How one logical model is served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelMapping {
    /// Never load-balanced.
    Fixed(Target),
    /// Two or more interchangeable targets.
    Pool(Vec<Target>),
}

impl ModelMapping {
    pub fn targets(&self) -> &[Target] {
        match self {
            ModelMapping::Fixed(target) => std::slice::from_ref(target),
            ModelMapping::Pool(targets) => targets,
        }
    }
}

/// The full mapping table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelTable {
    entries: BTreeMap<String, ModelMapping>,
}

impl ModelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Qwen on Dashscope, Kimi and Doubao on their ARK endpoints, and DeepSeek
    /// split between Dashscope and ARK.
    pub fn builtin() -> Self {
        Self::new()
            .with_fixed("qwen", Target::new("qwen", DASHSCOPE, None))
            .with_fixed(
                "kimi",
                Target::new("ark-kimi", VOLCENGINE, Some("ark-kimi")),
            )
            .with_fixed(
                "doubao",
                Target::new("ark-doubao", VOLCENGINE, Some("ark-doubao")),
            )
            .with_pool(
                "deepseek",
                vec![
                    Target::new("deepseek", DASHSCOPE, None),
                    Target::new("ark-deepseek", VOLCENGINE, Some("ark-deepseek")),
                ],
            )
    }

    pub fn with_fixed(mut self, logical: &str, target: Target) -> Self {
        self.entries
            .insert(logical.to_string(), ModelMapping::Fixed(target));
        self
    }

    pub fn with_pool(mut self, logical: &str, targets: Vec<Target>) -> Self {
        self.entries
            .insert(logical.to_string(), ModelMapping::Pool(targets));
        self
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading model mapping table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse model table: {}", e)))
    }

    pub fn get(&self, logical: &str) -> Option<&ModelMapping> {
        self.entries.get(logical)
    }

    pub fn logical_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject pools with fewer than two targets and targets whose
    /// provider/endpoint pair the registry does not know.
    pub fn validate(&self, registry: &ProviderRegistry) -> Result<()> {
        for (logical, mapping) in &self.entries {
            if let ModelMapping::Pool(targets) = mapping {
                if targets.len() < 2 {
                    return Err(GateError::Config(format!(
                        "Model '{}' is a pool with {} target(s); pools need at least two",
                        logical,
                        targets.len()
                    )));
                }
            }
            for target in mapping.targets() {
                registry
                    .validate(&target.provider, target.endpoint.as_deref())
                    .map_err(|e| {
                        GateError::Config(format!("Model '{}' -> '{}': {}", logical, target.model, e))
                    })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_is_valid() {
        let table = ModelTable::builtin();
        table.validate(&ProviderRegistry::builtin()).unwrap();
        assert_eq!(table.len(), 4);
        assert!(matches!(table.get("deepseek"), Some(ModelMapping::Pool(t)) if t.len() == 2));
        assert!(matches!(table.get("qwen"), Some(ModelMapping::Fixed(t)) if t.model == "qwen"));
    }

    #[test]
    fn test_parse_yaml_table() {
        let yaml = r#"
qwen: { model: qwen, provider: dashscope }
deepseek:
  - model: deepseek
    provider: dashscope
  - model: ark-deepseek
    provider: volcengine
    endpoint: ark-deepseek
"#;
        let table = ModelTable::from_yaml(yaml).unwrap();
        table.validate(&ProviderRegistry::builtin()).unwrap();

        match table.get("deepseek").unwrap() {
            ModelMapping::Pool(targets) => {
                assert_eq!(targets[1].endpoint.as_deref(), Some("ark-deepseek"));
            }
            other => panic!("expected pool, got {:?}", other),
        }
    }

    #[test]
    fn test_single_target_pool_rejected() {
        let table = ModelTable::new().with_pool(
            "solo",
            vec![Target::new("qwen", DASHSCOPE, None)],
        );
        let err = table.validate(&ProviderRegistry::builtin()).unwrap_err();
        assert!(err.to_string().contains("solo"));
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let table = ModelTable::new().with_fixed(
            "mystery",
            Target::new("ark-mystery", VOLCENGINE, Some("ark-mystery")),
        );
        let err = table.validate(&ProviderRegistry::builtin()).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("ark-mystery"));
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = ModelTable::from_yaml("qwen: [1, 2").unwrap_err();
        assert!(err.is_config());
    }
}
