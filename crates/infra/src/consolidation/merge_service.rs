//! Merge / undo / split execution.
//!
//! Each operation validates against the current read model, then emits
//! events; projections converge both stores from there. The service itself
//! only touches rows where the original implementation did: restoring
//! demoted rows on undo and creating rows for split products.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use kmapper_consolidation::events::{
    AliasCreated, ConsolidationEvent, EntitiesMerged, EntitySplit, MergeUndone,
};
use kmapper_consolidation::merge::{
    MergeRequest, SplitRequest, UndoRequest, validate_merge, validate_split,
};
use kmapper_core::{AggregateId, DomainError, EntityId, ExpectedVersion};

use crate::event_store::{EventStore, EventStoreError, UncommittedEvent};
use crate::read_model::{
    EntityRecord, EntityStore, MergeHistoryRecord, MergeHistoryStore, ReadModelError,
    RelationshipStore,
};

/// Stream type for consolidation operation streams.
pub const CONSOLIDATION_AGGREGATE_TYPE: &str = "consolidation";

#[derive(Debug, Error)]
pub enum MergeServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    ReadModel(#[from] ReadModelError),
}

/// Outcome of a merge execution.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeExecution {
    pub merge_event_id: Uuid,
    pub canonical_entity_id: EntityId,
    pub merged_entity_ids: Vec<EntityId>,
    pub relationship_transfer_count: u32,
}

/// Outcome of a split execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitExecution {
    pub split_event_id: Uuid,
    pub new_entity_ids: Vec<EntityId>,
}

/// Executes consolidation decisions as events.
pub struct MergeService {
    event_store: Arc<dyn EventStore>,
    entities: Arc<dyn EntityStore>,
    relationships: Arc<dyn RelationshipStore>,
    history: Arc<dyn MergeHistoryStore>,
}

impl MergeService {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        entities: Arc<dyn EntityStore>,
        relationships: Arc<dyn RelationshipStore>,
        history: Arc<dyn MergeHistoryStore>,
    ) -> Self {
        Self {
            event_store,
            entities,
            relationships,
            history,
        }
    }

    /// Merge entities into a canonical survivor.
    ///
    /// Emits one `EntitiesMerged` followed by one `AliasCreated` per merged
    /// entity. Demotion of the merged rows and the graph redirection happen
    /// in the projections.
    #[instrument(skip(self, request), fields(canonical = %request.canonical_entity_id), err)]
    pub async fn merge(&self, request: MergeRequest) -> Result<MergeExecution, MergeServiceError> {
        let canonical = self
            .entities
            .get_entity(request.tenant_id, request.canonical_entity_id)
            .await?;
        let merged = self
            .entities
            .get_entities(request.tenant_id, &request.merged_entity_ids)
            .await?;

        let canonical_view = canonical.as_ref().map(EntityRecord::to_view);
        let merged_views: Vec<_> = merged
            .iter()
            .map(|m| m.as_ref().map(EntityRecord::to_view))
            .collect();
        validate_merge(&request, canonical_view.as_ref(), &merged_views)?;

        let merged_records: Vec<&EntityRecord> = merged.iter().flatten().collect();
        let merged_names: Vec<String> =
            merged_records.iter().map(|m| m.name.clone()).collect();

        let mut relationship_transfer_count = 0u32;
        for record in &merged_records {
            relationship_transfer_count += self
                .relationships
                .count_for_entity(request.tenant_id, record.id)
                .await? as u32;
        }

        let now = Utc::now();
        let merge_event_id = Uuid::now_v7();

        let merged_event = ConsolidationEvent::EntitiesMerged(EntitiesMerged {
            tenant_id: request.tenant_id,
            canonical_entity_id: request.canonical_entity_id,
            merged_entity_ids: request.merged_entity_ids.clone(),
            merged_entity_names: merged_names.clone(),
            merge_reason: request.merge_reason.clone(),
            similarity_scores: request.similarity_scores,
            property_merge_details: json!({ "merged_names": merged_names }),
            relationship_transfer_count,
            merged_by_user_id: request.merged_by_user_id,
            occurred_at: now,
        });

        let mut batch = vec![
            UncommittedEvent::from_typed(merge_event_id, Some(request.tenant_id), &merged_event)?,
        ];

        for record in &merged_records {
            let alias_event = ConsolidationEvent::AliasCreated(AliasCreated {
                tenant_id: request.tenant_id,
                alias_id: record.id,
                canonical_entity_id: request.canonical_entity_id,
                alias_name: record.name.clone(),
                original_entity_id: record.id,
                merge_event_id,
                occurred_at: now,
            });
            batch.push(UncommittedEvent::from_typed(
                Uuid::now_v7(),
                Some(request.tenant_id),
                &alias_event,
            )?);
        }

        self.event_store
            .append(
                AggregateId::from_uuid(merge_event_id),
                CONSOLIDATION_AGGREGATE_TYPE,
                batch,
                ExpectedVersion::NoStream,
            )
            .await?;

        self.history
            .record_merge(MergeHistoryRecord {
                merge_event_id,
                tenant_id: request.tenant_id,
                canonical_entity_id: request.canonical_entity_id,
                merged_entity_ids: request.merged_entity_ids.clone(),
                merge_reason: request.merge_reason,
                merged_by_user_id: request.merged_by_user_id,
                can_undo: true,
                undone: false,
                created_at: now,
            })
            .await?;

        info!(
            %merge_event_id,
            merged = request.merged_entity_ids.len(),
            relationship_transfer_count,
            "entities merged"
        );

        Ok(MergeExecution {
            merge_event_id,
            canonical_entity_id: request.canonical_entity_id,
            merged_entity_ids: request.merged_entity_ids,
            relationship_transfer_count,
        })
    }

    /// Undo a previous merge.
    ///
    /// The demoted rows are restored here (they were soft-demoted, not
    /// deleted); the projections handle graph placeholders and canonical
    /// metadata. Relationships are not restored automatically; a subsequent
    /// re-extraction reintroduces them.
    #[instrument(skip(self, request), fields(merge_event_id = %request.original_merge_event_id), err)]
    pub async fn undo(&self, request: UndoRequest) -> Result<Uuid, MergeServiceError> {
        let history = self
            .history
            .get_merge(request.tenant_id, request.original_merge_event_id)
            .await?
            .ok_or_else(|| {
                DomainError::not_found(format!(
                    "merge {} not found",
                    request.original_merge_event_id
                ))
            })?;

        if history.undone {
            return Err(DomainError::conflict(format!(
                "merge {} has already been undone",
                request.original_merge_event_id
            ))
            .into());
        }
        if !history.can_undo {
            return Err(DomainError::conflict(format!(
                "merge {} cannot be undone",
                request.original_merge_event_id
            ))
            .into());
        }

        for restored_id in &request.restore_entity_ids {
            if !history.merged_entity_ids.contains(restored_id) {
                return Err(DomainError::validation(format!(
                    "entity {restored_id} was not part of the original merge"
                ))
                .into());
            }
        }

        let undo_event_id = Uuid::now_v7();
        let event = ConsolidationEvent::MergeUndone(MergeUndone {
            tenant_id: request.tenant_id,
            original_merge_event_id: request.original_merge_event_id,
            canonical_entity_id: history.canonical_entity_id,
            restored_entity_ids: request.restore_entity_ids.clone(),
            original_entity_ids: history.merged_entity_ids.clone(),
            undo_reason: request.undo_reason,
            undone_by_user_id: request.undone_by_user_id,
            occurred_at: Utc::now(),
        });

        self.event_store
            .append(
                AggregateId::from_uuid(undo_event_id),
                CONSOLIDATION_AGGREGATE_TYPE,
                vec![UncommittedEvent::from_typed(
                    undo_event_id,
                    Some(request.tenant_id),
                    &event,
                )?],
                ExpectedVersion::NoStream,
            )
            .await?;

        self.entities
            .restore_canonical(request.tenant_id, &request.restore_entity_ids)
            .await?;
        self.history
            .mark_undone(request.tenant_id, request.original_merge_event_id)
            .await?;

        info!(%undo_event_id, restored = request.restore_entity_ids.len(), "merge undone");
        Ok(undo_event_id)
    }

    /// Split an entity into at least two new ones.
    ///
    /// New read-model rows are created here (canonical, inheriting type and
    /// source page); the projections mark the original and reassign graph
    /// edges.
    #[instrument(skip(self, request), fields(original = %request.original_entity_id), err)]
    pub async fn split(&self, request: SplitRequest) -> Result<SplitExecution, MergeServiceError> {
        let original = self
            .entities
            .get_entity(request.tenant_id, request.original_entity_id)
            .await?;
        let original_view = original.as_ref().map(EntityRecord::to_view);
        validate_split(&request, original_view.as_ref())?;

        let original = original.ok_or_else(|| {
            DomainError::not_found(format!("entity {} not found", request.original_entity_id))
        })?;

        let new_entity_ids: Vec<EntityId> = request
            .new_entity_names
            .iter()
            .map(|_| EntityId::new())
            .collect();

        // Index-based assignments become id-based for the event; stale
        // relationship ids are carried as-is and skipped downstream.
        let relationship_assignments = request.relationship_assignments.as_ref().map(|map| {
            map.iter()
                .map(|(rel_id, index)| (*rel_id, new_entity_ids[*index]))
                .collect::<std::collections::HashMap<Uuid, EntityId>>()
        });

        let split_event_id = Uuid::now_v7();
        let now = Utc::now();
        let event = ConsolidationEvent::EntitySplit(EntitySplit {
            tenant_id: request.tenant_id,
            original_entity_id: request.original_entity_id,
            new_entity_ids: new_entity_ids.clone(),
            new_entity_names: request.new_entity_names.clone(),
            relationship_assignments,
            property_assignments: None,
            split_reason: request.split_reason.clone(),
            split_by_user_id: request.split_by_user_id,
            occurred_at: now,
        });

        self.event_store
            .append(
                AggregateId::from_uuid(split_event_id),
                CONSOLIDATION_AGGREGATE_TYPE,
                vec![UncommittedEvent::from_typed(
                    split_event_id,
                    Some(request.tenant_id),
                    &event,
                )?],
                ExpectedVersion::NoStream,
            )
            .await?;

        for (index, (new_id, new_name)) in
            new_entity_ids.iter().zip(&request.new_entity_names).enumerate()
        {
            self.entities
                .upsert_entity(EntityRecord {
                    id: *new_id,
                    tenant_id: request.tenant_id,
                    source_page_id: original.source_page_id,
                    entity_type: original.entity_type.clone(),
                    name: new_name.clone(),
                    normalized_name: new_name.trim().to_lowercase(),
                    description: None,
                    properties: json!({
                        "_split_from": request.original_entity_id.to_string(),
                        "_split_index": index,
                        "_split_event_id": split_event_id.to_string(),
                    }),
                    extraction_method: original.extraction_method.clone(),
                    confidence: original.confidence,
                    is_canonical: true,
                    is_alias_of: None,
                    graph_node_id: None,
                    synced_to_graph: false,
                    synced_at: None,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
        }

        info!(%split_event_id, new_entities = new_entity_ids.len(), "entity split");
        Ok(SplitExecution {
            split_event_id,
            new_entity_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmapper_consolidation::SimilarityScores;
    use kmapper_core::{TenantId, UserId};

    use crate::event_store::InMemoryEventStore;
    use crate::read_model::InMemoryReadModel;

    struct Fixture {
        event_store: Arc<InMemoryEventStore>,
        read_model: Arc<InMemoryReadModel>,
        service: MergeService,
        tenant: TenantId,
    }

    fn fixture() -> Fixture {
        let event_store = Arc::new(InMemoryEventStore::new());
        let read_model = Arc::new(InMemoryReadModel::new());
        let service = MergeService::new(
            event_store.clone(),
            read_model.clone(),
            read_model.clone(),
            read_model.clone(),
        );
        Fixture {
            event_store,
            read_model,
            service,
            tenant: TenantId::new(),
        }
    }

    async fn seed_entity(fixture: &Fixture, name: &str) -> EntityId {
        let id = EntityId::new();
        fixture
            .read_model
            .upsert_entity(EntityRecord {
                id,
                tenant_id: fixture.tenant,
                source_page_id: None,
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
            })
            .await
            .unwrap();
        id
    }

    fn merge_request(fixture: &Fixture, canonical: EntityId, merged: Vec<EntityId>) -> MergeRequest {
        MergeRequest {
            tenant_id: fixture.tenant,
            canonical_entity_id: canonical,
            merged_entity_ids: merged,
            merge_reason: "auto_merge".to_string(),
            similarity_scores: SimilarityScores::default(),
            merged_by_user_id: None,
        }
    }

    #[tokio::test]
    async fn merge_emits_merged_and_alias_events() {
        let fixture = fixture();
        let canonical = seed_entity(&fixture, "ACME Corp").await;
        let merged = seed_entity(&fixture, "ACME Corporation").await;

        let execution = fixture
            .service
            .merge(merge_request(&fixture, canonical, vec![merged]))
            .await
            .unwrap();

        let events = fixture.event_store.read_from(0, 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "consolidation.entities.merged");
        assert_eq!(events[0].event_id, execution.merge_event_id);
        assert_eq!(events[1].event_type, "consolidation.alias.created");

        let history = fixture
            .read_model
            .get_merge(fixture.tenant, execution.merge_event_id)
            .await
            .unwrap()
            .unwrap();
        assert!(history.can_undo);
        assert!(!history.undone);
    }

    #[tokio::test]
    async fn merge_rejects_alias_targets() {
        let fixture = fixture();
        let canonical = seed_entity(&fixture, "A").await;
        let merged = seed_entity(&fixture, "B").await;

        // Demote B first.
        fixture
            .read_model
            .mark_aliases(fixture.tenant, &[merged], canonical)
            .await
            .unwrap();

        let other = seed_entity(&fixture, "C").await;
        let err = fixture
            .service
            .merge(merge_request(&fixture, other, vec![merged]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MergeServiceError::Domain(DomainError::AliasChain { .. })
        ));
    }

    #[tokio::test]
    async fn undo_restores_rows_and_marks_history() {
        let fixture = fixture();
        let canonical = seed_entity(&fixture, "ACME Corp").await;
        let merged = seed_entity(&fixture, "ACME Corporation").await;

        let execution = fixture
            .service
            .merge(merge_request(&fixture, canonical, vec![merged]))
            .await
            .unwrap();

        // Simulate the projection having demoted the row.
        fixture
            .read_model
            .mark_aliases(fixture.tenant, &[merged], canonical)
            .await
            .unwrap();

        fixture
            .service
            .undo(UndoRequest {
                tenant_id: fixture.tenant,
                original_merge_event_id: execution.merge_event_id,
                restore_entity_ids: vec![merged],
                undo_reason: "operator request".to_string(),
                undone_by_user_id: UserId::new(),
            })
            .await
            .unwrap();

        let row = fixture
            .read_model
            .get_entity(fixture.tenant, merged)
            .await
            .unwrap()
            .unwrap();
        assert!(row.is_canonical);
        assert_eq!(row.is_alias_of, None);

        // A second undo of the same merge is rejected.
        let err = fixture
            .service
            .undo(UndoRequest {
                tenant_id: fixture.tenant,
                original_merge_event_id: execution.merge_event_id,
                restore_entity_ids: vec![merged],
                undo_reason: "again".to_string(),
                undone_by_user_id: UserId::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MergeServiceError::Domain(DomainError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn undo_rejects_entities_outside_the_merge() {
        let fixture = fixture();
        let canonical = seed_entity(&fixture, "A").await;
        let merged = seed_entity(&fixture, "B").await;
        let stranger = seed_entity(&fixture, "C").await;

        let execution = fixture
            .service
            .merge(merge_request(&fixture, canonical, vec![merged]))
            .await
            .unwrap();

        let err = fixture
            .service
            .undo(UndoRequest {
                tenant_id: fixture.tenant,
                original_merge_event_id: execution.merge_event_id,
                restore_entity_ids: vec![stranger],
                undo_reason: "oops".to_string(),
                undone_by_user_id: UserId::new(),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MergeServiceError::Domain(DomainError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn split_creates_rows_and_emits_event() {
        let fixture = fixture();
        let original = seed_entity(&fixture, "Mercury").await;

        let execution = fixture
            .service
            .split(SplitRequest {
                tenant_id: fixture.tenant,
                original_entity_id: original,
                new_entity_names: vec![
                    "Mercury (planet)".to_string(),
                    "Mercury (element)".to_string(),
                ],
                relationship_assignments: None,
                split_reason: "ambiguous entity".to_string(),
                split_by_user_id: UserId::new(),
            })
            .await
            .unwrap();

        assert_eq!(execution.new_entity_ids.len(), 2);

        for new_id in &execution.new_entity_ids {
            let row = fixture
                .read_model
                .get_entity(fixture.tenant, *new_id)
                .await
                .unwrap()
                .unwrap();
            assert!(row.is_canonical);
            assert_eq!(
                row.properties["_split_from"],
                json!(original.to_string())
            );
        }

        let events = fixture.event_store.read_from(0, 100).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "consolidation.entity.split");
    }

    #[tokio::test]
    async fn split_requires_at_least_two_names() {
        let fixture = fixture();
        let original = seed_entity(&fixture, "Mercury").await;

        let err = fixture
            .service
            .split(SplitRequest {
                tenant_id: fixture.tenant,
                original_entity_id: original,
                new_entity_names: vec!["Only one".to_string()],
                relationship_assignments: None,
                split_reason: "nope".to_string(),
                split_by_user_id: UserId::new(),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MergeServiceError::Domain(DomainError::Validation(_))
        ));
    }
}
