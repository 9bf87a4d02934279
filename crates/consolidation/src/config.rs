//! Per-tenant consolidation configuration.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use kmapper_core::DomainError;

/// Weights controlling how similarity features combine into the final
/// score. Higher weight, more influence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeights {
    pub jaro_winkler: f64,
    pub normalized_exact: f64,
    pub type_match: f64,
    pub embedding_cosine: f64,
    pub graph_neighborhood: f64,
}

impl Default for FeatureWeights {
    fn default() -> Self {
        Self {
            jaro_winkler: 0.15,
            normalized_exact: 0.20,
            type_match: 0.10,
            embedding_cosine: 0.35,
            graph_neighborhood: 0.20,
        }
    }
}

impl FeatureWeights {
    fn as_pairs(&self) -> [(&'static str, f64); 5] {
        [
            ("jaro_winkler", self.jaro_winkler),
            ("normalized_exact", self.normalized_exact),
            ("type_match", self.type_match),
            ("embedding_cosine", self.embedding_cosine),
            ("graph_neighborhood", self.graph_neighborhood),
        ]
    }

    /// Normalized weights over the features that actually produced a value,
    /// summing to 1. All-zero enabled weights fall back to equal weights.
    pub fn normalize(&self, enabled: &HashSet<&str>) -> HashMap<&'static str, f64> {
        let enabled_weights: Vec<(&'static str, f64)> = self
            .as_pairs()
            .into_iter()
            .filter(|(name, _)| enabled.contains(name))
            .collect();

        if enabled_weights.is_empty() {
            return HashMap::new();
        }

        let total: f64 = enabled_weights.iter().map(|(_, w)| w).sum();
        if total == 0.0 {
            let equal = 1.0 / enabled_weights.len() as f64;
            return enabled_weights.into_iter().map(|(name, _)| (name, equal)).collect();
        }

        enabled_weights
            .into_iter()
            .map(|(name, w)| (name, w / total))
            .collect()
    }
}

/// Per-tenant consolidation thresholds and toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Combined score at or above this auto-merges.
    pub auto_merge_threshold: f64,
    /// Combined score at or above this (below auto) queues human review.
    pub review_threshold: f64,
    /// Scores below this are dropped outright.
    pub reject_threshold: f64,
    pub feature_weights: FeatureWeights,
    pub enable_embedding_similarity: bool,
    pub enable_graph_similarity: bool,
    /// Cap on candidates per blocking query.
    pub max_block_size: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            auto_merge_threshold: 0.90,
            review_threshold: 0.50,
            reject_threshold: 0.0,
            feature_weights: FeatureWeights::default(),
            enable_embedding_similarity: true,
            enable_graph_similarity: true,
            max_block_size: 500,
        }
    }
}

impl ConsolidationConfig {
    /// Enforce `auto_merge_threshold >= review_threshold >= reject_threshold`.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.auto_merge_threshold < self.review_threshold {
            return Err(DomainError::validation(format!(
                "auto_merge_threshold ({}) must be >= review_threshold ({})",
                self.auto_merge_threshold, self.review_threshold
            )));
        }
        if self.review_threshold < self.reject_threshold {
            return Err(DomainError::validation(format!(
                "review_threshold ({}) must be >= reject_threshold ({})",
                self.review_threshold, self.reject_threshold
            )));
        }
        for (name, value) in [
            ("auto_merge_threshold", self.auto_merge_threshold),
            ("review_threshold", self.review_threshold),
            ("reject_threshold", self.reject_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DomainError::validation(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        if self.max_block_size == 0 {
            return Err(DomainError::validation("max_block_size must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ConsolidationConfig::default().validate().unwrap();
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let config = ConsolidationConfig {
            auto_merge_threshold: 0.4,
            review_threshold: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalized_weights_sum_to_one() {
        let weights = FeatureWeights::default();
        let enabled: HashSet<&str> =
            ["jaro_winkler", "normalized_exact", "type_match"].into_iter().collect();

        let normalized = weights.normalize(&enabled);
        let sum: f64 = normalized.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(normalized.len(), 3);
    }

    #[test]
    fn all_zero_weights_fall_back_to_equal() {
        let weights = FeatureWeights {
            jaro_winkler: 0.0,
            normalized_exact: 0.0,
            type_match: 0.0,
            embedding_cosine: 0.0,
            graph_neighborhood: 0.0,
        };
        let enabled: HashSet<&str> = ["jaro_winkler", "type_match"].into_iter().collect();

        let normalized = weights.normalize(&enabled);
        assert_eq!(normalized["jaro_winkler"], 0.5);
        assert_eq!(normalized["type_match"], 0.5);
    }

    #[test]
    fn empty_enabled_set_yields_no_weights() {
        let normalized = FeatureWeights::default().normalize(&HashSet::new());
        assert!(normalized.is_empty());
    }
}
