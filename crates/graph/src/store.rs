//! Graph store contract.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use kmapper_consolidation::GraphNeighborhood;
use kmapper_core::{EntityId, RelationshipId, TenantId};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),

    #[error("graph query failed: {0}")]
    Query(String),

    #[error("graph node not found: entity {entity_id} (tenant {tenant_id})")]
    NodeNotFound {
        tenant_id: TenantId,
        entity_id: EntityId,
    },
}

/// An entity node as stored in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub entity_id: EntityId,
    pub tenant_id: TenantId,
    pub name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub properties: JsonValue,
}

/// A typed, directed relationship between two entity nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub relationship_id: RelationshipId,
    pub tenant_id: TenantId,
    pub source_entity_id: EntityId,
    pub target_entity_id: EntityId,
    pub relationship_type: String,
    pub confidence: f64,
}

/// Counters from a merge sync; informational, surfaced in logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSyncReport {
    pub outgoing_transferred: u64,
    pub incoming_transferred: u64,
    pub self_loops_removed: u64,
    pub duplicates_removed: u64,
    pub nodes_deleted: u64,
}

/// Mutations and reads the projections and similarity services need.
///
/// Every operation is tenant-scoped; implementations must make cross-tenant
/// reads impossible.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create or update a node keyed by `(entity_id, tenant_id)`. Returns
    /// the graph-native node identifier.
    async fn upsert_entity_node(&self, node: &EntityNode) -> Result<String, GraphError>;

    /// Create a relationship labeled by `relationship_type` between two
    /// existing nodes. Returns the graph-native relationship identifier.
    async fn create_relationship(&self, rel: &GraphRelationship) -> Result<String, GraphError>;

    async fn node_exists(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<bool, GraphError>;

    /// Outgoing + incoming neighbors with relationship types, capped per
    /// direction.
    async fn get_neighborhood(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        max_neighbors: usize,
    ) -> Result<GraphNeighborhood, GraphError>;

    /// Bulk neighborhood fetch for batch scoring.
    async fn get_neighborhoods(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
        max_neighbors: usize,
    ) -> Result<HashMap<EntityId, GraphNeighborhood>, GraphError>;

    /// Apply a merge: redirect outgoing then incoming edges from every
    /// merged node to the canonical node, drop self-loops, deduplicate
    /// parallel edges keeping the highest confidence, delete the merged
    /// nodes, then update the canonical node's merge metadata.
    ///
    /// Each sub-step is its own statement; a failure in the redirection
    /// steps is logged and the remaining steps still run (the event is the
    /// source of truth, convergence is eventual).
    async fn apply_merge(
        &self,
        tenant_id: TenantId,
        canonical_id: EntityId,
        merged_ids: &[EntityId],
        merged_names: &[String],
        merge_event_id: Uuid,
    ) -> Result<MergeSyncReport, GraphError>;

    /// Apply a merge undo: create placeholder nodes for the restored
    /// entities (full properties arrive via later entity syncs) and update
    /// the canonical node's undo metadata.
    async fn apply_undo(
        &self,
        tenant_id: TenantId,
        canonical_id: EntityId,
        restored_ids: &[EntityId],
        undo_event_id: Uuid,
    ) -> Result<(), GraphError>;

    /// Apply a split: create one node per new entity with provenance,
    /// reassign edges per the explicit assignments, move the remainder to
    /// the first new entity, and mark the original as split.
    async fn apply_split(
        &self,
        tenant_id: TenantId,
        original_id: EntityId,
        new_entities: &[(EntityId, String)],
        relationship_assignments: &HashMap<Uuid, EntityId>,
        split_event_id: Uuid,
    ) -> Result<(), GraphError>;
}

/// Restrict a dynamic relationship label to `[A-Z0-9_]`, defaulting to
/// `RELATED_TO`. Labels cannot be parameterized in Cypher, so anything
/// interpolated into a query goes through here.
pub fn sanitize_rel_type(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .to_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() || !trimmed.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        "RELATED_TO".to_string()
    } else {
        trimmed.to_string()
    }
}
