//! Denormalized relational read models.
//!
//! Projections fold events into these tables; the consolidation services
//! query them. Every operation is tenant-scoped, and the alias invariant
//! (non-canonical rows point at exactly one canonical row of the same
//! tenant) is maintained by the merge/undo handlers.

pub mod in_memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use kmapper_consolidation::{EntityView, ReviewFilters, ReviewStatistics, ReviewStatus};
use kmapper_core::{EntityId, PageId, RelationshipId, TenantId, UserId};

pub use in_memory::InMemoryReadModel;
pub use postgres::PostgresReadModel;

#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error("read model storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// One extracted entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub source_page_id: Option<PageId>,
    pub entity_type: String,
    pub name: String,
    pub normalized_name: String,
    pub description: Option<String>,
    pub properties: JsonValue,
    pub extraction_method: String,
    pub confidence: f64,
    pub is_canonical: bool,
    pub is_alias_of: Option<EntityId>,
    pub graph_node_id: Option<String>,
    pub synced_to_graph: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn to_view(&self) -> EntityView {
        EntityView {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name.clone(),
            normalized_name: self.normalized_name.clone(),
            entity_type: self.entity_type.clone(),
            description: self.description.clone(),
            source_page_id: self.source_page_id,
            is_canonical: self.is_canonical,
        }
    }
}

/// One entity relationship row. Directional; `source != target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: RelationshipId,
    pub tenant_id: TenantId,
    pub source_entity_id: EntityId,
    pub target_entity_id: EntityId,
    pub relationship_type: String,
    pub properties: JsonValue,
    pub confidence: f64,
    pub graph_relationship_id: Option<String>,
    pub synced_to_graph: bool,
    pub created_at: DateTime<Utc>,
}

/// One merge-review queue row. `entity_a_id < entity_b_id` under the
/// canonical pair ordering, unique per `(tenant_id, entity_a_id,
/// entity_b_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub entity_a_id: EntityId,
    pub entity_b_id: EntityId,
    pub confidence: f64,
    pub review_priority: i32,
    pub similarity_scores: JsonValue,
    pub status: ReviewStatus,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One merge-history row, keyed by the `EntitiesMerged` event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeHistoryRecord {
    pub merge_event_id: Uuid,
    pub tenant_id: TenantId,
    pub canonical_entity_id: EntityId,
    pub merged_entity_ids: Vec<EntityId>,
    pub merge_reason: String,
    pub merged_by_user_id: Option<UserId>,
    pub can_undo: bool,
    pub undone: bool,
    pub created_at: DateTime<Utc>,
}

/// OR-combined blocking predicates. `None` disables a strategy for this
/// query; `limit` should be `max_block_size + 1` so truncation is
/// detectable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockingQuery {
    pub prefix: Option<String>,
    pub entity_type: Option<String>,
    pub soundex: Option<String>,
    pub trigram_of: Option<String>,
    pub exclude_id: Option<EntityId>,
    pub limit: usize,
}

impl BlockingQuery {
    pub fn is_empty(&self) -> bool {
        self.prefix.is_none()
            && self.entity_type.is_none()
            && self.soundex.is_none()
            && self.trigram_of.is_none()
    }
}

/// Extracted-entity table operations.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert_entity(&self, record: EntityRecord) -> Result<(), ReadModelError>;

    async fn get_entity(
        &self,
        tenant_id: TenantId,
        id: EntityId,
    ) -> Result<Option<EntityRecord>, ReadModelError>;

    /// Bulk get preserving input order; misses are `None`.
    async fn get_entities(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
    ) -> Result<Vec<Option<EntityRecord>>, ReadModelError>;

    /// Resolve an entity by its extraction identity (used to wire
    /// relationships whose endpoints are names).
    async fn find_by_page_and_name(
        &self,
        tenant_id: TenantId,
        page_id: PageId,
        name: &str,
    ) -> Result<Option<EntityRecord>, ReadModelError>;

    async fn set_graph_sync(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        graph_node_id: &str,
    ) -> Result<(), ReadModelError>;

    /// Demote entities to aliases of `canonical_id`.
    async fn mark_aliases(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
        canonical_id: EntityId,
    ) -> Result<(), ReadModelError>;

    /// Re-promote previously demoted entities to canonical.
    async fn restore_canonical(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
    ) -> Result<(), ReadModelError>;

    /// Shallow-merge JSON keys into `properties` (jsonb `||` semantics).
    async fn merge_properties(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        properties: JsonValue,
    ) -> Result<(), ReadModelError>;

    /// Mark an entity split: non-canonical plus provenance properties.
    async fn mark_split(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        split_properties: JsonValue,
    ) -> Result<(), ReadModelError>;

    async fn list_canonical(
        &self,
        tenant_id: TenantId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EntityRecord>, ReadModelError>;

    async fn count_canonical(&self, tenant_id: TenantId) -> Result<u64, ReadModelError>;

    async fn count_canonical_by_type(
        &self,
        tenant_id: TenantId,
    ) -> Result<HashMap<String, u64>, ReadModelError>;

    async fn distinct_soundex_count(&self, tenant_id: TenantId) -> Result<u64, ReadModelError>;

    /// Rows flagged `synced_to_graph = false`, for operational reconciliation.
    async fn list_unsynced(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<EntityRecord>, ReadModelError>;

    /// Canonical same-tenant candidates matching any enabled blocking
    /// predicate, excluding the source entity.
    async fn find_blocking_candidates(
        &self,
        tenant_id: TenantId,
        query: &BlockingQuery,
    ) -> Result<Vec<EntityRecord>, ReadModelError>;
}

/// Entity-relationship table operations.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    async fn upsert_relationship(&self, record: RelationshipRecord) -> Result<(), ReadModelError>;

    async fn set_relationship_graph_sync(
        &self,
        tenant_id: TenantId,
        id: RelationshipId,
        graph_relationship_id: &str,
    ) -> Result<(), ReadModelError>;

    async fn count_for_entity(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<u64, ReadModelError>;

    async fn list_for_entity(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<Vec<RelationshipRecord>, ReadModelError>;
}

/// Merge-review queue operations.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Insert or refresh a pending row keyed by the canonical pair.
    async fn upsert_pending(&self, record: ReviewQueueRecord) -> Result<(), ReadModelError>;

    async fn get_review(
        &self,
        tenant_id: TenantId,
        id: Uuid,
    ) -> Result<Option<ReviewQueueRecord>, ReadModelError>;

    /// Apply a reviewer decision; returns false when no row matched.
    async fn decide(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        status: ReviewStatus,
        reviewed_by: UserId,
        notes: Option<String>,
    ) -> Result<bool, ReadModelError>;

    /// Expire every pending row referencing any of the given entities.
    async fn expire_pending_for(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
    ) -> Result<u64, ReadModelError>;

    /// Filtered listing ordered by `review_priority` desc, then confidence
    /// desc.
    async fn list_reviews(
        &self,
        tenant_id: TenantId,
        filters: &ReviewFilters,
    ) -> Result<Vec<ReviewQueueRecord>, ReadModelError>;

    async fn statistics(&self, tenant_id: TenantId) -> Result<ReviewStatistics, ReadModelError>;
}

/// Merge-history table operations.
#[async_trait]
pub trait MergeHistoryStore: Send + Sync {
    async fn record_merge(&self, record: MergeHistoryRecord) -> Result<(), ReadModelError>;

    async fn get_merge(
        &self,
        tenant_id: TenantId,
        merge_event_id: Uuid,
    ) -> Result<Option<MergeHistoryRecord>, ReadModelError>;

    /// Returns false when the merge was already undone or does not exist.
    async fn mark_undone(
        &self,
        tenant_id: TenantId,
        merge_event_id: Uuid,
    ) -> Result<bool, ReadModelError>;

    async fn list_merges(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<MergeHistoryRecord>, ReadModelError>;
}
