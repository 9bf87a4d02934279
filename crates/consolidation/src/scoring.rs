//! Combined scoring: weighted feature combination + threshold routing.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use kmapper_core::EntityId;

use crate::config::ConsolidationConfig;
use crate::events::SimilarityScores;

/// Confidence band for a scored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

/// What to do with a scored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    AutoMerge,
    Review,
    Reject,
}

impl ConfidenceBand {
    pub fn decision(self) -> RouteDecision {
        match self {
            ConfidenceBand::High => RouteDecision::AutoMerge,
            ConfidenceBand::Medium => RouteDecision::Review,
            ConfidenceBand::Low => RouteDecision::Reject,
        }
    }
}

/// Result of combined similarity scoring for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub entity_a_id: EntityId,
    pub entity_b_id: EntityId,
    pub scores: SimilarityScores,
    pub combined_score: f64,
    pub classification: ConfidenceBand,
    pub weights_used: HashMap<String, f64>,
}

impl ScoringResult {
    pub fn decision(&self) -> RouteDecision {
        self.classification.decision()
    }
}

/// Combine whichever features produced a value into a single score.
///
/// Weights are renormalized over the active features so that omitting a
/// failed feature (embedding service down, graph unreachable) degrades the
/// signal rather than deflating it.
pub fn combine_scores(
    entity_a_id: EntityId,
    entity_b_id: EntityId,
    scores: SimilarityScores,
    config: &ConsolidationConfig,
) -> ScoringResult {
    let features: [(&'static str, Option<f64>); 5] = [
        ("jaro_winkler", scores.jaro_winkler),
        ("normalized_exact", scores.normalized_exact),
        ("type_match", scores.type_match),
        ("embedding_cosine", scores.embedding_cosine),
        ("graph_neighborhood", scores.graph_neighborhood),
    ];

    let enabled: HashSet<&str> = features
        .iter()
        .copied()
        .filter_map(|(name, value)| value.map(|_| name))
        .collect();

    let weights = config.feature_weights.normalize(&enabled);

    let combined: f64 = features
        .iter()
        .copied()
        .filter_map(|(name, value)| value.and_then(|v| weights.get(name).map(|w| v * w)))
        .sum();

    let classification = classify(combined, config);

    ScoringResult {
        entity_a_id,
        entity_b_id,
        scores,
        combined_score: combined,
        classification,
        weights_used: weights.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    }
}

fn classify(score: f64, config: &ConsolidationConfig) -> ConfidenceBand {
    if score >= config.auto_merge_threshold {
        ConfidenceBand::High
    } else if score >= config.review_threshold {
        ConfidenceBand::Medium
    } else {
        ConfidenceBand::Low
    }
}
