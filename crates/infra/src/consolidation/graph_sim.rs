//! Graph-neighborhood similarity service.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use kmapper_consolidation::graph_similarity;
use kmapper_core::{EntityId, TenantId};
use kmapper_graph::{GraphError, GraphStore};

const DEFAULT_MAX_NEIGHBORS: usize = 100;

/// Structural similarity from shared neighbors and relationship patterns.
pub struct GraphSimilarityService {
    store: Arc<dyn GraphStore>,
    max_neighbors: usize,
}

impl GraphSimilarityService {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
        }
    }

    pub fn with_max_neighbors(mut self, max_neighbors: usize) -> Self {
        self.max_neighbors = max_neighbors;
        self
    }

    /// Combined graph score for a pair, in [0, 1]. Two entities without any
    /// relationships score the neutral 0.5.
    pub async fn compute_similarity(
        &self,
        tenant_id: TenantId,
        entity_a_id: EntityId,
        entity_b_id: EntityId,
    ) -> Result<f64, GraphError> {
        let neighborhood_a = self
            .store
            .get_neighborhood(tenant_id, entity_a_id, self.max_neighbors)
            .await?;
        let neighborhood_b = self
            .store
            .get_neighborhood(tenant_id, entity_b_id, self.max_neighbors)
            .await?;

        let combined = graph_similarity(&neighborhood_a, &neighborhood_b);
        debug!(%entity_a_id, %entity_b_id, combined, "graph similarity");
        Ok(combined)
    }

    /// Batch mode: one bulk neighborhood fetch for all candidates.
    pub async fn compute_similarities_batch(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        candidate_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, f64>, GraphError> {
        if candidate_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let source = self
            .store
            .get_neighborhood(tenant_id, entity_id, self.max_neighbors)
            .await?;
        let neighborhoods = self
            .store
            .get_neighborhoods(tenant_id, candidate_ids, self.max_neighbors)
            .await?;

        Ok(candidate_ids
            .iter()
            .map(|candidate_id| {
                let score = neighborhoods
                    .get(candidate_id)
                    .map_or(0.5, |n| graph_similarity(&source, n));
                (*candidate_id, score)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmapper_core::RelationshipId;
    use kmapper_graph::{EntityNode, GraphRelationship, InMemoryGraphStore};

    async fn node(store: &InMemoryGraphStore, tenant: TenantId, name: &str) -> EntityId {
        let id = EntityId::new();
        store
            .upsert_entity_node(&EntityNode {
                entity_id: id,
                tenant_id: tenant,
                name: name.to_string(),
                entity_type: "ORG".to_string(),
                description: None,
                properties: serde_json::json!({}),
            })
            .await
            .unwrap();
        id
    }

    async fn edge(store: &InMemoryGraphStore, tenant: TenantId, source: EntityId, target: EntityId) {
        store
            .create_relationship(&GraphRelationship {
                relationship_id: RelationshipId::new(),
                tenant_id: tenant,
                source_entity_id: source,
                target_entity_id: target,
                relationship_type: "RELATED_TO".to_string(),
                confidence: 0.9,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn isolated_entities_score_neutral() {
        let store = Arc::new(InMemoryGraphStore::new());
        let tenant = TenantId::new();
        let a = node(&store, tenant, "A").await;
        let b = node(&store, tenant, "B").await;

        let service = GraphSimilarityService::new(store);
        let score = service.compute_similarity(tenant, a, b).await.unwrap();
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn shared_neighbors_score_high() {
        let store = Arc::new(InMemoryGraphStore::new());
        let tenant = TenantId::new();
        let a = node(&store, tenant, "A").await;
        let b = node(&store, tenant, "B").await;
        let shared = node(&store, tenant, "Shared").await;

        edge(&store, tenant, a, shared).await;
        edge(&store, tenant, b, shared).await;

        let service = GraphSimilarityService::new(store);
        let score = service.compute_similarity(tenant, a, b).await.unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn batch_matches_single_pair_scores() {
        let store = Arc::new(InMemoryGraphStore::new());
        let tenant = TenantId::new();
        let source = node(&store, tenant, "S").await;
        let c1 = node(&store, tenant, "C1").await;
        let c2 = node(&store, tenant, "C2").await;
        let shared = node(&store, tenant, "Shared").await;

        edge(&store, tenant, source, shared).await;
        edge(&store, tenant, c1, shared).await;

        let service = GraphSimilarityService::new(store);
        let batch = service
            .compute_similarities_batch(tenant, source, &[c1, c2])
            .await
            .unwrap();

        let single_c1 = service.compute_similarity(tenant, source, c1).await.unwrap();
        let single_c2 = service.compute_similarity(tenant, source, c2).await.unwrap();

        assert!((batch[&c1] - single_c1).abs() < 1e-9);
        assert!((batch[&c2] - single_c2).abs() < 1e-9);
        assert!(batch[&c1] > batch[&c2]);
    }
}
