//! Rotation strategies for pooled models.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GateError;
use crate::provider::{DASHSCOPE, VOLCENGINE};

/// How to pick between equivalent targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Advance a per-pool cursor shared by all workers.
    #[default]
    RoundRobin,
    /// Uniformly at random, per process.
    Random,
    /// At random, proportional to per-provider weights.
    Weighted,
}

impl Strategy {
    /// Identifier used in store keys and logs.
    pub fn id(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::Weighted => "weighted",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Strategy {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "weighted" => Ok(Strategy::Weighted),
            other => Err(GateError::Config(format!(
                "Unknown load balancing strategy '{}' (expected round_robin, random or weighted)",
                other
            ))),
        }
    }
}

pub const DEFAULT_WEIGHT: u32 = 50;
const MAX_WEIGHT: u32 = 100;

/// Per-provider weights for [`Strategy::Weighted`], each clamped to `0..=100`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u32>", into = "BTreeMap<String, u32>")]
pub struct Weights(BTreeMap<String, u32>);

impl Weights {
    pub fn new(weights: BTreeMap<String, u32>) -> Self {
        Self(
            weights
                .into_iter()
                .map(|(provider, w)| (provider, w.min(MAX_WEIGHT)))
                .collect(),
        )
    }

    /// Parse `"dashscope:50,volcengine:50"`.
    pub fn parse(input: &str) -> Result<Self, GateError> {
        let mut weights = BTreeMap::new();
        for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (provider, weight) = pair.split_once(':').ok_or_else(|| {
                GateError::Config(format!("Invalid weight '{}', expected provider:weight", pair))
            })?;
            let weight: u32 = weight.trim().parse().map_err(|_| {
                GateError::Config(format!("Invalid weight value in '{}'", pair))
            })?;
            weights.insert(provider.trim().to_string(), weight);
        }
        Ok(Self::new(weights))
    }

    pub fn weight_of(&self, provider: &str) -> u32 {
        self.0.get(provider).copied().unwrap_or(DEFAULT_WEIGHT)
    }
}

impl Default for Weights {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(DASHSCOPE.to_string(), DEFAULT_WEIGHT);
        weights.insert(VOLCENGINE.to_string(), DEFAULT_WEIGHT);
        Self(weights)
    }
}

impl From<BTreeMap<String, u32>> for Weights {
    fn from(weights: BTreeMap<String, u32>) -> Self {
        Self::new(weights)
    }
}

impl From<Weights> for BTreeMap<String, u32> {
    fn from(weights: Weights) -> Self {
        weights.0
    }
}

/// Index into `len` candidates from a 1-based cursor value.
pub fn round_robin_index(cursor: u64, len: usize) -> usize {
    debug_assert!(len > 0);
    (cursor.wrapping_sub(1) % len as u64) as usize
}

pub fn random_index(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

/// Weighted pick; falls back to uniform when every weight is zero.
pub fn weighted_index(weights: &[u32]) -> usize {
    match WeightedIndex::new(weights) {
        Ok(dist) => dist.sample(&mut rand::thread_rng()),
        Err(_) => random_index(weights.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("round_robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("Weighted".parse::<Strategy>().unwrap(), Strategy::Weighted);
        assert!("fastest".parse::<Strategy>().unwrap_err().is_config());
    }

    #[test]
    fn test_strategy_serde_names() {
        let strategy: Strategy = serde_yaml::from_str("round_robin").unwrap();
        assert_eq!(strategy, Strategy::RoundRobin);
        assert_eq!(Strategy::Random.to_string(), "random");
    }

    #[test]
    fn test_round_robin_index_cycles() {
        let picks: Vec<usize> = (1..=5).map(|c| round_robin_index(c, 2)).collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_weights_parse_and_clamp() {
        let weights = Weights::parse("dashscope:70, volcengine:300").unwrap();
        assert_eq!(weights.weight_of(DASHSCOPE), 70);
        assert_eq!(weights.weight_of(VOLCENGINE), 100);
        assert_eq!(weights.weight_of("other"), DEFAULT_WEIGHT);

        assert!(Weights::parse("dashscope=70").is_err());
        assert!(Weights::parse("dashscope:lots").is_err());
    }

    #[test]
    fn test_weighted_index_respects_zero_weight() {
        for _ in 0..50 {
            assert_eq!(weighted_index(&[0, 10]), 1);
        }
        // All zero falls back to uniform instead of failing.
        assert!(weighted_index(&[0, 0]) < 2);
    }
}
