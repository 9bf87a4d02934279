//! Graph projection.
//!
//! Mirrors entity, relationship and consolidation events into the labeled-
//! property graph. Graph-write failures surface as transient errors so the
//! runtime retries and eventually dead-letters them; rows whose event ended
//! up dead-lettered stay flagged `synced_to_graph = false` and are found
//! via `list_unsynced` for reconciliation. Only two cases are non-fatal:
//! unresolved relationship endpoints (a business rule, skipped) and a
//! sync-flag update after the graph write already succeeded (redelivery
//! would just re-upsert the same node).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};
use uuid::Uuid;

use kmapper_consolidation::events::ConsolidationEvent;
use kmapper_core::EntityId;
use kmapper_extraction::process::ExtractionEvent;
use kmapper_graph::{EntityNode, GraphRelationship, GraphStore};

use crate::event_store::StoredEvent;
use crate::read_model::{EntityStore, RelationshipStore};

use super::{ProjectionError, ProjectionHandler};

const PROJECTION_NAME: &str = "graph.sync";

/// Maintains the graph store from the event stream.
pub struct GraphSyncProjection {
    graph: Arc<dyn GraphStore>,
    entities: Arc<dyn EntityStore>,
    relationships: Arc<dyn RelationshipStore>,
}

impl GraphSyncProjection {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        entities: Arc<dyn EntityStore>,
        relationships: Arc<dyn RelationshipStore>,
    ) -> Self {
        Self {
            graph,
            entities,
            relationships,
        }
    }

    async fn apply_extraction(&self, event: ExtractionEvent) -> Result<(), ProjectionError> {
        match event {
            ExtractionEvent::EntityExtracted(e) => {
                let node = EntityNode {
                    entity_id: e.entity_id,
                    tenant_id: e.tenant_id,
                    name: e.name.clone(),
                    entity_type: e.entity_type.to_uppercase(),
                    description: e.description.clone(),
                    properties: e.properties.clone(),
                };

                let node_id = self.graph.upsert_entity_node(&node).await.map_err(|err| {
                    error!(
                        entity_id = %e.entity_id,
                        entity_name = %e.name,
                        error = %err,
                        "failed to sync entity to graph"
                    );
                    ProjectionError::Transient(err.to_string())
                })?;

                // The node exists at this point; a failed flag update is
                // healed by redelivery re-upserting the same node.
                if let Err(err) = self
                    .entities
                    .set_graph_sync(e.tenant_id, e.entity_id, &node_id)
                    .await
                {
                    warn!(
                        entity_id = %e.entity_id,
                        error = %err,
                        "graph node created but sync flag update failed"
                    );
                }
            }
            ExtractionEvent::RelationshipDiscovered(e) => {
                let source = self
                    .entities
                    .find_by_page_and_name(e.tenant_id, e.page_id, &e.source_entity_name)
                    .await
                    .map_err(|err| ProjectionError::Transient(err.to_string()))?;
                let target = self
                    .entities
                    .find_by_page_and_name(e.tenant_id, e.page_id, &e.target_entity_name)
                    .await
                    .map_err(|err| ProjectionError::Transient(err.to_string()))?;

                let (Some(source), Some(target)) = (source, target) else {
                    warn!(
                        source = %e.source_entity_name,
                        target = %e.target_entity_name,
                        "skipping graph relationship with unresolved endpoints"
                    );
                    return Ok(());
                };

                let rel = GraphRelationship {
                    relationship_id: e.relationship_id,
                    tenant_id: e.tenant_id,
                    source_entity_id: source.id,
                    target_entity_id: target.id,
                    relationship_type: e.relationship_type.clone(),
                    confidence: e.confidence_score,
                };

                let rel_id = self.graph.create_relationship(&rel).await.map_err(|err| {
                    error!(
                        relationship_id = %e.relationship_id,
                        error = %err,
                        "failed to sync relationship to graph"
                    );
                    ProjectionError::Transient(err.to_string())
                })?;

                if let Err(err) = self
                    .relationships
                    .set_relationship_graph_sync(e.tenant_id, e.relationship_id, &rel_id)
                    .await
                {
                    warn!(
                        relationship_id = %e.relationship_id,
                        error = %err,
                        "graph edge created but sync flag update failed"
                    );
                }
            }
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
                let report = self
                    .graph
                    .apply_merge(
                        e.tenant_id,
                        e.canonical_entity_id,
                        &e.merged_entity_ids,
                        &e.merged_entity_names,
                        stored.event_id,
                    )
                    .await
                    .map_err(|err| ProjectionError::Transient(err.to_string()))?;

                debug!(
                    canonical = %e.canonical_entity_id,
                    ?report,
                    "graph merge sync applied"
                );
            }
            ConsolidationEvent::MergeUndone(e) => {
                self.graph
                    .apply_undo(
                        e.tenant_id,
                        e.canonical_entity_id,
                        &e.restored_entity_ids,
                        stored.event_id,
                    )
                    .await
                    .map_err(|err| ProjectionError::Transient(err.to_string()))?;
            }
            ConsolidationEvent::EntitySplit(e) => {
                let new_entities: Vec<(EntityId, String)> = e
                    .new_entity_ids
                    .iter()
                    .copied()
                    .zip(e.new_entity_names.iter().cloned())
                    .collect();

                let assignments: HashMap<Uuid, EntityId> =
                    e.relationship_assignments.unwrap_or_default();

                self.graph
                    .apply_split(
                        e.tenant_id,
                        e.original_entity_id,
                        &new_entities,
                        &assignments,
                        stored.event_id,
                    )
                    .await
                    .map_err(|err| ProjectionError::Transient(err.to_string()))?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectionHandler for GraphSyncProjection {
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
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kmapper_consolidation::SimilarityScores;
    use kmapper_consolidation::events::EntitiesMerged;
    use kmapper_core::{AggregateId, PageId, RelationshipId, TenantId};
    use kmapper_events::Event;
    use kmapper_extraction::process::{EntityExtracted, RelationshipDiscovered};
    use kmapper_graph::InMemoryGraphStore;
    use serde_json::json;

    use crate::read_model::{EntityRecord, InMemoryReadModel};

    fn wrap<E: Event + serde::Serialize>(event: &E) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::now_v7(),
            tenant_id: None,
            aggregate_id: AggregateId::new(),
            aggregate_type: "x".to_string(),
            aggregate_version: 1,
            global_position: 1,
            event_type: event.event_type().to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::to_value(event).unwrap(),
        }
    }

    fn entity_record(tenant: TenantId, page: PageId, name: &str) -> EntityRecord {
        EntityRecord {
            id: EntityId::new(),
            tenant_id: tenant,
            source_page_id: Some(page),
            entity_type: "ORG".to_string(),
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            description: None,
            properties: json!({}),
            extraction_method: "llm".to_string(),
            confidence: 0.9,
            is_canonical: true,
            is_alias_of: None,
            graph_node_id: None,
            synced_to_graph: false,
            synced_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn entity_extracted_creates_node_and_flags_row() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let read_model = Arc::new(InMemoryReadModel::new());
        let handler =
            GraphSyncProjection::new(graph.clone(), read_model.clone(), read_model.clone());

        let tenant = TenantId::new();
        let page = PageId::new();
        let entity_id = EntityId::new();

        // The relational row exists (written by the read-model projection).
        let mut row = entity_record(tenant, page, "ACME Corp");
        row.id = entity_id;
        read_model.upsert_entity(row).await.unwrap();

        let event = ExtractionEvent::EntityExtracted(EntityExtracted {
            entity_id,
            tenant_id: tenant,
            page_id: page,
            entity_type: "org".to_string(),
            name: "ACME Corp".to_string(),
            normalized_name: "acme corp".to_string(),
            properties: json!({}),
            description: None,
            confidence: 0.9,
            extraction_method: "llm".to_string(),
            source_text: None,
            occurred_at: Utc::now(),
        });

        handler.handle(&wrap(&event)).await.unwrap();

        let node = graph.node(tenant, entity_id).unwrap();
        assert_eq!(node.entity_type, "ORG");

        let row = read_model.get_entity(tenant, entity_id).await.unwrap().unwrap();
        assert!(row.synced_to_graph);
        assert!(row.graph_node_id.is_some());
        assert!(row.synced_at.is_some());
    }

    #[tokio::test]
    async fn relationship_connects_resolved_nodes() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let read_model = Arc::new(InMemoryReadModel::new());
        let handler =
            GraphSyncProjection::new(graph.clone(), read_model.clone(), read_model.clone());

        let tenant = TenantId::new();
        let page = PageId::new();
        let a = entity_record(tenant, page, "A");
        let b = entity_record(tenant, page, "B");
        read_model.upsert_entity(a.clone()).await.unwrap();
        read_model.upsert_entity(b.clone()).await.unwrap();

        for (id, name) in [(a.id, "A"), (b.id, "B")] {
            graph
                .upsert_entity_node(&EntityNode {
                    entity_id: id,
                    tenant_id: tenant,
                    name: name.to_string(),
                    entity_type: "ORG".to_string(),
                    description: None,
                    properties: json!({}),
                })
                .await
                .unwrap();
        }

        let event = ExtractionEvent::RelationshipDiscovered(RelationshipDiscovered {
            relationship_id: RelationshipId::new(),
            tenant_id: tenant,
            page_id: page,
            source_entity_name: "A".to_string(),
            target_entity_name: "B".to_string(),
            relationship_type: "works with".to_string(),
            confidence_score: 0.8,
            context: None,
            occurred_at: Utc::now(),
        });

        handler.handle(&wrap(&event)).await.unwrap();

        let edges = graph.edges(tenant);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].rel_type, "WORKS_WITH");
        assert_eq!(edges[0].source, a.id);
        assert_eq!(edges[0].target, b.id);
    }

    #[tokio::test]
    async fn graph_write_failure_is_surfaced_for_retry() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let read_model = Arc::new(InMemoryReadModel::new());
        let handler =
            GraphSyncProjection::new(graph.clone(), read_model.clone(), read_model.clone());

        let tenant = TenantId::new();
        let page = PageId::new();
        let a = entity_record(tenant, page, "A");
        let b = entity_record(tenant, page, "B");
        read_model.upsert_entity(a.clone()).await.unwrap();
        read_model.upsert_entity(b.clone()).await.unwrap();

        // The rows resolve but the graph nodes are absent, so the edge
        // write fails. That failure must reach the runtime (retry → DLQ),
        // not be swallowed.
        let event = ExtractionEvent::RelationshipDiscovered(RelationshipDiscovered {
            relationship_id: RelationshipId::new(),
            tenant_id: tenant,
            page_id: page,
            source_entity_name: "A".to_string(),
            target_entity_name: "B".to_string(),
            relationship_type: "RELATED_TO".to_string(),
            confidence_score: 0.8,
            context: None,
            occurred_at: Utc::now(),
        });

        let err = handler.handle(&wrap(&event)).await.unwrap_err();
        assert!(matches!(err, ProjectionError::Transient(_)));
        assert!(graph.edges(tenant).is_empty());
    }

    #[tokio::test]
    async fn merge_event_redirects_graph() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let read_model = Arc::new(InMemoryReadModel::new());
        let handler =
            GraphSyncProjection::new(graph.clone(), read_model.clone(), read_model.clone());

        let tenant = TenantId::new();
        let canonical = EntityId::new();
        let merged = EntityId::new();

        for (id, name) in [(canonical, "ACME Corp"), (merged, "ACME Corporation")] {
            graph
                .upsert_entity_node(&EntityNode {
                    entity_id: id,
                    tenant_id: tenant,
                    name: name.to_string(),
                    entity_type: "ORG".to_string(),
                    description: None,
                    properties: json!({}),
                })
                .await
                .unwrap();
        }

        let event = ConsolidationEvent::EntitiesMerged(EntitiesMerged {
            tenant_id: tenant,
            canonical_entity_id: canonical,
            merged_entity_ids: vec![merged],
            merged_entity_names: vec!["ACME Corporation".to_string()],
            merge_reason: "auto_merge".to_string(),
            similarity_scores: SimilarityScores::default(),
            property_merge_details: json!({}),
            relationship_transfer_count: 0,
            merged_by_user_id: None,
            occurred_at: Utc::now(),
        });

        handler.handle(&wrap(&event)).await.unwrap();

        assert!(graph.node(tenant, merged).is_none());
        let canonical_node = graph.node(tenant, canonical).unwrap();
        assert_eq!(canonical_node.merged_count, 1);
    }
}
