//! Relational read-model projection.
//!
//! Folds extraction and consolidation events into the denormalized tables.
//! Every write is an upsert keyed on ids carried by the event body, so
//! reapplying a handler on a current row is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use kmapper_consolidation::events::ConsolidationEvent;
use kmapper_consolidation::merge::canonical_pair;
use kmapper_consolidation::{ReviewStatus, SimilarityScores};
use kmapper_extraction::process::ExtractionEvent;

use crate::event_store::StoredEvent;
use crate::read_model::{
    EntityRecord, EntityStore, ReadModelError, RelationshipRecord, RelationshipStore,
    ReviewQueueRecord, ReviewStore,
};

use super::{ProjectionError, ProjectionHandler};

const PROJECTION_NAME: &str = "read_model.consolidated";

/// Maintains `extracted_entities`, `entity_relationships` and
/// `merge_review_queue`.
pub struct ReadModelProjection {
    entities: Arc<dyn EntityStore>,
    relationships: Arc<dyn RelationshipStore>,
    reviews: Arc<dyn ReviewStore>,
}

impl ReadModelProjection {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        relationships: Arc<dyn RelationshipStore>,
        reviews: Arc<dyn ReviewStore>,
    ) -> Self {
        Self {
            entities,
            relationships,
            reviews,
        }
    }

    async fn apply_extraction(&self, event: ExtractionEvent) -> Result<(), ProjectionError> {
        match event {
            ExtractionEvent::EntityExtracted(e) => {
                let now = Utc::now();
                self.entities
                    .upsert_entity(EntityRecord {
                        id: e.entity_id,
                        tenant_id: e.tenant_id,
                        source_page_id: Some(e.page_id),
                        entity_type: e.entity_type,
                        name: e.name,
                        normalized_name: e.normalized_name,
                        description: e.description,
                        properties: e.properties,
                        extraction_method: e.extraction_method,
                        confidence: e.confidence,
                        is_canonical: true,
                        is_alias_of: None,
                        graph_node_id: None,
                        synced_to_graph: false,
                        synced_at: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .await
                    .map_err(transient)?;
            }
            ExtractionEvent::RelationshipDiscovered(e) => {
                let source = self
                    .entities
                    .find_by_page_and_name(e.tenant_id, e.page_id, &e.source_entity_name)
                    .await
                    .map_err(transient)?;
                let target = self
                    .entities
                    .find_by_page_and_name(e.tenant_id, e.page_id, &e.target_entity_name)
                    .await
                    .map_err(transient)?;

                let (Some(source), Some(target)) = (source, target) else {
                    // Endpoints may not have been extracted (filtered by
                    // confidence) — skip, re-extraction can reintroduce.
                    warn!(
                        source = %e.source_entity_name,
                        target = %e.target_entity_name,
                        "skipping relationship with unresolved endpoints"
                    );
                    return Ok(());
                };

                if source.id == target.id {
                    return Ok(());
                }

                self.relationships
                    .upsert_relationship(RelationshipRecord {
                        id: e.relationship_id,
                        tenant_id: e.tenant_id,
                        source_entity_id: source.id,
                        target_entity_id: target.id,
                        relationship_type: e.relationship_type,
                        properties: match e.context {
                            Some(context) => json!({"context": context}),
                            None => json!({}),
                        },
                        confidence: e.confidence_score,
                        graph_relationship_id: None,
                        synced_to_graph: false,
                        created_at: Utc::now(),
                    })
                    .await
                    .map_err(transient)?;
            }
            // Process lifecycle events have no relational read model of
            // their own.
            _ => {}
        }
        Ok(())
    }

    async fn apply_consolidation(
        &self,
        stored: &StoredEvent,
        event: ConsolidationEvent,
    ) -> Result<(), ProjectionError> {
        match event {
            ConsolidationEvent::EntitiesMerged(e) => {
                self.entities
                    .mark_aliases(e.tenant_id, &e.merged_entity_ids, e.canonical_entity_id)
                    .await
                    .map_err(transient)?;

                self.entities
                    .merge_properties(
                        e.tenant_id,
                        e.canonical_entity_id,
                        json!({
                            "_merged_count": e.merged_entity_ids.len(),
                            "_last_merged_at": e.occurred_at.to_rfc3339(),
                            "_merge_event_id": stored.event_id.to_string(),
                        }),
                    )
                    .await
                    .map_err(transient)?;

                let mut affected = e.merged_entity_ids.clone();
                affected.push(e.canonical_entity_id);
                self.reviews
                    .expire_pending_for(e.tenant_id, &affected)
                    .await
                    .map_err(transient)?;
            }
            ConsolidationEvent::MergeUndone(e) => {
                // Row restoration is the merge service's job; the projection
                // only annotates the canonical entity.
                self.entities
                    .merge_properties(
                        e.tenant_id,
                        e.canonical_entity_id,
                        json!({
                            "_last_undo_at": e.occurred_at.to_rfc3339(),
                            "_undo_event_id": stored.event_id.to_string(),
                            "_last_restored_ids": e
                                .restored_entity_ids
                                .iter()
                                .map(|id| id.to_string())
                                .collect::<Vec<_>>(),
                        }),
                    )
                    .await
                    .map_err(transient)?;
            }
            ConsolidationEvent::EntitySplit(e) => {
                self.entities
                    .mark_split(
                        e.tenant_id,
                        e.original_entity_id,
                        json!({
                            "_split_into": e
                                .new_entity_ids
                                .iter()
                                .map(|id| id.to_string())
                                .collect::<Vec<_>>(),
                            "_split_at": e.occurred_at.to_rfc3339(),
                            "_split_event_id": stored.event_id.to_string(),
                            "_split_reason": e.split_reason,
                        }),
                    )
                    .await
                    .map_err(transient)?;

                self.reviews
                    .expire_pending_for(e.tenant_id, &[e.original_entity_id])
                    .await
                    .map_err(transient)?;
            }
            ConsolidationEvent::MergeQueuedForReview(e) => {
                let (entity_a_id, entity_b_id) = canonical_pair(e.entity_a_id, e.entity_b_id);
                let now = Utc::now();
                self.reviews
                    .upsert_pending(ReviewQueueRecord {
                        id: stored.event_id,
                        tenant_id: e.tenant_id,
                        entity_a_id,
                        entity_b_id,
                        confidence: e.confidence,
                        review_priority: e.review_priority,
                        similarity_scores: similarity_json(&e.similarity_scores),
                        status: ReviewStatus::Pending,
                        reviewed_by: None,
                        reviewed_at: None,
                        reviewer_notes: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .await
                    .map_err(transient)?;
            }
            ConsolidationEvent::MergeReviewDecision(e) => {
                let status = ReviewStatus::from_decision(e.decision);
                let updated = self
                    .reviews
                    .decide(
                        e.tenant_id,
                        e.review_item_id,
                        status,
                        e.reviewer_user_id,
                        e.reviewer_notes,
                    )
                    .await
                    .map_err(transient)?;

                if !updated {
                    warn!(review_item_id = %e.review_item_id, "no review item found to update");
                }
            }
            // Candidate, alias, batch progress and config events carry no
            // relational state of their own.
            _ => {}
        }
        Ok(())
    }
}

fn transient(err: ReadModelError) -> ProjectionError {
    ProjectionError::Transient(err.to_string())
}

fn similarity_json(scores: &SimilarityScores) -> serde_json::Value {
    serde_json::to_value(scores).unwrap_or_else(|_| json!({}))
}

#[async_trait]
impl ProjectionHandler for ReadModelProjection {
    fn name(&self) -> &str {
        PROJECTION_NAME
    }

    async fn handle(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        if event.event_type.starts_with("extraction.") {
            let typed: ExtractionEvent = serde_json::from_value(event.payload.clone())
                .map_err(|e| ProjectionError::Decode(e.to_string()))?;
            self.apply_extraction(typed).await
        } else if event.event_type.starts_with("consolidation.") {
            let typed: ConsolidationEvent = serde_json::from_value(event.payload.clone())
                .map_err(|e| ProjectionError::Decode(e.to_string()))?;
            self.apply_consolidation(event, typed).await
        } else {
            debug!(event_type = %event.event_type, "no read-model handler for event");
            Ok(())
        }
    }
}
