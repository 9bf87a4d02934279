//! Combined scoring pipeline (string + embedding + graph).
//!
//! String and contextual scores are computed synchronously; embedding and
//! graph signals are added when the tenant config enables them. A feature
//! whose computation fails is dropped from the weighted combination, the
//! remaining weights renormalize.

use std::sync::Arc;

use tracing::{debug, warn};

use kmapper_consolidation::{
    ConsolidationConfig, EntityView, ScoringResult, SimilarityScores, combine_scores,
    compute_string_scores,
};

use super::embedding::EmbeddingSimilarityService;
use super::graph_sim::GraphSimilarityService;

pub struct CombinedScoringPipeline {
    embedding: Option<Arc<EmbeddingSimilarityService>>,
    graph: Option<Arc<GraphSimilarityService>>,
    config: ConsolidationConfig,
}

impl CombinedScoringPipeline {
    pub fn new(config: ConsolidationConfig) -> Self {
        Self {
            embedding: None,
            graph: None,
            config,
        }
    }

    pub fn with_embedding(mut self, embedding: Arc<EmbeddingSimilarityService>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_graph(mut self, graph: Arc<GraphSimilarityService>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Score one pair.
    pub async fn score_pair(&self, a: &EntityView, b: &EntityView) -> ScoringResult {
        let string_scores = compute_string_scores(a, b);

        let mut scores = SimilarityScores {
            jaro_winkler: Some(string_scores.jaro_winkler),
            normalized_exact: Some(string_scores.normalized_exact),
            type_match: Some(string_scores.type_match),
            embedding_cosine: None,
            graph_neighborhood: None,
        };

        if self.config.enable_embedding_similarity {
            if let Some(embedding) = &self.embedding {
                match embedding.compute_similarity(a, b).await {
                    Ok(similarity) => scores.embedding_cosine = Some(similarity),
                    Err(err) => warn!(error = %err, "embedding similarity failed, omitting feature"),
                }
            }
        }

        if self.config.enable_graph_similarity {
            if let Some(graph) = &self.graph {
                match graph.compute_similarity(a.tenant_id, a.id, b.id).await {
                    Ok(similarity) => scores.graph_neighborhood = Some(similarity),
                    Err(err) => warn!(error = %err, "graph similarity failed, omitting feature"),
                }
            }
        }

        let result = combine_scores(a.id, b.id, scores, &self.config);
        debug!(
            a = %a.name,
            b = %b.name,
            combined = result.combined_score,
            classification = ?result.classification,
            "combined score"
        );
        result
    }

    /// Score one source against many candidates, prefetching embeddings and
    /// neighborhoods in bulk. Results are sorted by combined score
    /// descending.
    pub async fn score_candidates(
        &self,
        source: &EntityView,
        candidates: &[EntityView],
    ) -> Vec<ScoringResult> {
        if candidates.is_empty() {
            return vec![];
        }

        let embedding_scores = if self.config.enable_embedding_similarity {
            match &self.embedding {
                Some(embedding) => match embedding
                    .compute_similarities_batch(source, candidates)
                    .await
                {
                    Ok(scores) => scores,
                    Err(err) => {
                        warn!(error = %err, "batch embedding similarity failed, omitting feature");
                        Default::default()
                    }
                },
                None => Default::default(),
            }
        } else {
            Default::default()
        };

        let graph_scores = if self.config.enable_graph_similarity {
            match &self.graph {
                Some(graph) => {
                    let candidate_ids: Vec<_> = candidates.iter().map(|c| c.id).collect();
                    match graph
                        .compute_similarities_batch(source.tenant_id, source.id, &candidate_ids)
                        .await
                    {
                        Ok(scores) => scores,
                        Err(err) => {
                            warn!(error = %err, "batch graph similarity failed, omitting feature");
                            Default::default()
                        }
                    }
                }
                None => Default::default(),
            }
        } else {
            Default::default()
        };

        let mut results: Vec<ScoringResult> = candidates
            .iter()
            .map(|candidate| {
                let string_scores = compute_string_scores(source, candidate);
                let scores = SimilarityScores {
                    jaro_winkler: Some(string_scores.jaro_winkler),
                    normalized_exact: Some(string_scores.normalized_exact),
                    type_match: Some(string_scores.type_match),
                    embedding_cosine: embedding_scores.get(&candidate.id).copied(),
                    graph_neighborhood: graph_scores.get(&candidate.id).copied(),
                };
                combine_scores(source.id, candidate.id, scores, &self.config)
            })
            .collect();

        results.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmapper_consolidation::RouteDecision;
    use kmapper_core::{EntityId, TenantId};

    fn view(tenant: TenantId, name: &str, entity_type: &str) -> EntityView {
        EntityView {
            id: EntityId::new(),
            tenant_id: tenant,
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            entity_type: entity_type.to_string(),
            description: None,
            source_page_id: None,
            is_canonical: true,
        }
    }

    fn string_only_config() -> ConsolidationConfig {
        ConsolidationConfig {
            enable_embedding_similarity: false,
            enable_graph_similarity: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn identical_names_and_types_auto_merge() {
        let pipeline = CombinedScoringPipeline::new(string_only_config());
        let tenant = TenantId::new();

        let result = pipeline
            .score_pair(&view(tenant, "ACME Corp", "ORG"), &view(tenant, "ACME Corp", "ORG"))
            .await;

        assert!((result.combined_score - 1.0).abs() < 1e-9);
        assert_eq!(result.decision(), RouteDecision::AutoMerge);
    }

    #[tokio::test]
    async fn dissimilar_names_reject() {
        let pipeline = CombinedScoringPipeline::new(string_only_config());
        let tenant = TenantId::new();

        let result = pipeline
            .score_pair(
                &view(tenant, "Quantum Mechanics", "CONCEPT"),
                &view(tenant, "Xylophone", "INSTRUMENT"),
            )
            .await;

        assert_eq!(result.decision(), RouteDecision::Reject);
    }

    #[tokio::test]
    async fn disabled_features_do_not_appear_in_weights() {
        let pipeline = CombinedScoringPipeline::new(string_only_config());
        let tenant = TenantId::new();

        let result = pipeline
            .score_pair(&view(tenant, "A", "T"), &view(tenant, "B", "T"))
            .await;

        assert!(!result.weights_used.contains_key("embedding_cosine"));
        assert!(!result.weights_used.contains_key("graph_neighborhood"));
    }

    #[tokio::test]
    async fn batch_results_are_sorted_descending() {
        let pipeline = CombinedScoringPipeline::new(string_only_config());
        let tenant = TenantId::new();
        let source = view(tenant, "ACME Corporation", "ORG");
        let close = view(tenant, "ACME Corporatio", "ORG");
        let far = view(tenant, "Zenith Industries", "ORG");

        let results = pipeline.score_candidates(&source, &[far, close.clone()]).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].entity_b_id, close.id);
        assert!(results[0].combined_score >= results[1].combined_score);
    }
}
