//! In-memory graph store for tests and development.
//!
//! Semantics mirror the Neo4j implementation closely enough that
//! projection and similarity tests exercise the same behavior: upsert by
//! `(id, tenant_id)`, edge redirection on merge, dedup by highest
//! confidence, placeholder nodes on undo, provenance on split.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use kmapper_consolidation::GraphNeighborhood;
use kmapper_core::{EntityId, TenantId};

use crate::store::{
    EntityNode, GraphError, GraphRelationship, GraphStore, MergeSyncReport, sanitize_rel_type,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    pub entity_id: EntityId,
    pub tenant_id: TenantId,
    pub name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub properties: JsonValue,
    pub aliases: Vec<String>,
    pub merged_count: u64,
    pub merge_event_id: Option<Uuid>,
    pub undo_count: u64,
    pub last_undo_event_id: Option<Uuid>,
    pub restored_from_merge: bool,
    pub split_from: Option<EntityId>,
    pub split_event_id: Option<Uuid>,
    pub is_split: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEdge {
    pub id: String,
    pub tenant_id: TenantId,
    pub source: EntityId,
    pub target: EntityId,
    pub rel_type: String,
    pub confidence: f64,
    pub original_type: Option<String>,
    pub transferred_from: Option<EntityId>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub split_from: Option<EntityId>,
}

#[derive(Debug, Default)]
struct GraphData {
    nodes: HashMap<(TenantId, EntityId), StoredNode>,
    edges: Vec<StoredEdge>,
}

/// Process-local graph store.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    data: Mutex<GraphData>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a node (tests).
    pub fn node(&self, tenant_id: TenantId, entity_id: EntityId) -> Option<StoredNode> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.nodes.get(&(tenant_id, entity_id)).cloned()
    }

    /// Snapshot of all edges for a tenant (tests).
    pub fn edges(&self, tenant_id: TenantId) -> Vec<StoredEdge> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.edges
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn node_count(&self, tenant_id: TenantId) -> usize {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.nodes.keys().filter(|(t, _)| *t == tenant_id).count()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_entity_node(&self, node: &EntityNode) -> Result<String, GraphError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let key = (node.tenant_id, node.entity_id);

        match data.nodes.get_mut(&key) {
            Some(existing) => {
                existing.name = node.name.clone();
                existing.entity_type = node.entity_type.clone();
                existing.description = node.description.clone();
                existing.properties = node.properties.clone();
                existing.restored_from_merge = false;
                existing.updated_at = Utc::now();
            }
            None => {
                data.nodes.insert(
                    key,
                    StoredNode {
                        entity_id: node.entity_id,
                        tenant_id: node.tenant_id,
                        name: node.name.clone(),
                        entity_type: node.entity_type.clone(),
                        description: node.description.clone(),
                        properties: node.properties.clone(),
                        aliases: vec![],
                        merged_count: 0,
                        merge_event_id: None,
                        undo_count: 0,
                        last_undo_event_id: None,
                        restored_from_merge: false,
                        split_from: None,
                        split_event_id: None,
                        is_split: false,
                        updated_at: Utc::now(),
                    },
                );
            }
        }

        Ok(format!("node:{}:{}", node.tenant_id, node.entity_id))
    }

    async fn create_relationship(&self, rel: &GraphRelationship) -> Result<String, GraphError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());

        for endpoint in [rel.source_entity_id, rel.target_entity_id] {
            if !data.nodes.contains_key(&(rel.tenant_id, endpoint)) {
                return Err(GraphError::NodeNotFound {
                    tenant_id: rel.tenant_id,
                    entity_id: endpoint,
                });
            }
        }

        // MERGE semantics keyed on the relational id, matching the Neo4j
        // implementation: replays update rather than duplicate.
        let id = format!("rel:{}", rel.relationship_id);
        match data.edges.iter_mut().find(|e| e.id == id) {
            Some(existing) => {
                existing.confidence = rel.confidence;
            }
            None => {
                data.edges.push(StoredEdge {
                    id: id.clone(),
                    tenant_id: rel.tenant_id,
                    source: rel.source_entity_id,
                    target: rel.target_entity_id,
                    rel_type: sanitize_rel_type(&rel.relationship_type),
                    confidence: rel.confidence,
                    original_type: None,
                    transferred_from: None,
                    transferred_at: None,
                    split_from: None,
                });
            }
        }

        Ok(id)
    }

    async fn node_exists(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<bool, GraphError> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data.nodes.contains_key(&(tenant_id, entity_id)))
    }

    async fn get_neighborhood(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        max_neighbors: usize,
    ) -> Result<GraphNeighborhood, GraphError> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(neighborhood_of(&data, tenant_id, entity_id, max_neighbors))
    }

    async fn get_neighborhoods(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
        max_neighbors: usize,
    ) -> Result<HashMap<EntityId, GraphNeighborhood>, GraphError> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entity_ids
            .iter()
            .map(|id| (*id, neighborhood_of(&data, tenant_id, *id, max_neighbors)))
            .collect())
    }

    async fn apply_merge(
        &self,
        tenant_id: TenantId,
        canonical_id: EntityId,
        merged_ids: &[EntityId],
        merged_names: &[String],
        merge_event_id: Uuid,
    ) -> Result<MergeSyncReport, GraphError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let mut report = MergeSyncReport::default();
        let now = Utc::now();

        // Steps 1-2: redirect outgoing and incoming edges to the canonical.
        for edge in data.edges.iter_mut().filter(|e| e.tenant_id == tenant_id) {
            if merged_ids.contains(&edge.source) {
                edge.original_type = Some(edge.rel_type.clone());
                edge.transferred_from = Some(edge.source);
                edge.transferred_at = Some(now);
                edge.source = canonical_id;
                report.outgoing_transferred += 1;
            }
            if merged_ids.contains(&edge.target) {
                edge.original_type.get_or_insert_with(|| edge.rel_type.clone());
                edge.transferred_from = Some(edge.target);
                edge.transferred_at = Some(now);
                edge.target = canonical_id;
                report.incoming_transferred += 1;
            }
        }

        // Step 3: drop self-loops introduced by redirection.
        let before = data.edges.len();
        data.edges
            .retain(|e| !(e.tenant_id == tenant_id && e.source == e.target));
        report.self_loops_removed = (before - data.edges.len()) as u64;

        // Step 4: deduplicate parallel edges, keeping the highest confidence.
        let mut best: HashMap<(EntityId, EntityId, String), usize> = HashMap::new();
        let mut keep = vec![true; data.edges.len()];
        for (i, edge) in data.edges.iter().enumerate() {
            if edge.tenant_id != tenant_id {
                continue;
            }
            let key = (edge.source, edge.target, edge.rel_type.clone());
            match best.get(&key) {
                Some(&j) => {
                    if edge.confidence > data.edges[j].confidence {
                        keep[j] = false;
                        best.insert(key, i);
                    } else {
                        keep[i] = false;
                    }
                }
                None => {
                    best.insert(key, i);
                }
            }
        }
        let mut kept_iter = keep.into_iter();
        let before = data.edges.len();
        data.edges.retain(|_| kept_iter.next().unwrap_or(true));
        report.duplicates_removed = (before - data.edges.len()) as u64;

        // Step 5: delete merged nodes.
        for merged_id in merged_ids {
            if data.nodes.remove(&(tenant_id, *merged_id)).is_some() {
                report.nodes_deleted += 1;
            }
        }

        // Step 6: update canonical metadata.
        if let Some(canonical) = data.nodes.get_mut(&(tenant_id, canonical_id)) {
            canonical.aliases.extend(merged_names.iter().cloned());
            canonical.merged_count += merged_ids.len() as u64;
            canonical.merge_event_id = Some(merge_event_id);
            canonical.updated_at = now;
        }

        debug!(?report, %canonical_id, "in-memory graph merge applied");
        Ok(report)
    }

    async fn apply_undo(
        &self,
        tenant_id: TenantId,
        canonical_id: EntityId,
        restored_ids: &[EntityId],
        undo_event_id: Uuid,
    ) -> Result<(), GraphError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        for restored_id in restored_ids {
            data.nodes
                .entry((tenant_id, *restored_id))
                .or_insert_with(|| StoredNode {
                    entity_id: *restored_id,
                    tenant_id,
                    name: String::new(),
                    entity_type: String::new(),
                    description: None,
                    properties: JsonValue::Null,
                    aliases: vec![],
                    merged_count: 0,
                    merge_event_id: None,
                    undo_count: 0,
                    last_undo_event_id: None,
                    restored_from_merge: true,
                    split_from: None,
                    split_event_id: None,
                    is_split: false,
                    updated_at: now,
                });
        }

        if let Some(canonical) = data.nodes.get_mut(&(tenant_id, canonical_id)) {
            canonical.undo_count += 1;
            canonical.last_undo_event_id = Some(undo_event_id);
            canonical.updated_at = now;
        }

        Ok(())
    }

    async fn apply_split(
        &self,
        tenant_id: TenantId,
        original_id: EntityId,
        new_entities: &[(EntityId, String)],
        relationship_assignments: &HashMap<Uuid, EntityId>,
        split_event_id: Uuid,
    ) -> Result<(), GraphError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        for (new_id, new_name) in new_entities {
            data.nodes.entry((tenant_id, *new_id)).or_insert_with(|| StoredNode {
                entity_id: *new_id,
                tenant_id,
                name: new_name.clone(),
                entity_type: String::new(),
                description: None,
                properties: JsonValue::Null,
                aliases: vec![],
                merged_count: 0,
                merge_event_id: None,
                undo_count: 0,
                last_undo_event_id: None,
                restored_from_merge: false,
                split_from: Some(original_id),
                split_event_id: Some(split_event_id),
                is_split: false,
                updated_at: now,
            });
        }

        let by_edge_id: HashMap<String, EntityId> = relationship_assignments
            .iter()
            .map(|(rel_id, target)| (format!("rel:{rel_id}"), *target))
            .collect();

        let fallback = new_entities.first().map(|(id, _)| *id);

        for edge in data.edges.iter_mut().filter(|e| e.tenant_id == tenant_id) {
            let touches_original = edge.source == original_id || edge.target == original_id;
            if !touches_original {
                continue;
            }

            // Stale assignments simply fall through to the first new entity.
            let assignee = by_edge_id.get(&edge.id).copied().or(fallback);
            let Some(assignee) = assignee else { continue };

            edge.original_type.get_or_insert_with(|| edge.rel_type.clone());
            edge.split_from = Some(original_id);
            if edge.source == original_id {
                edge.source = assignee;
            }
            if edge.target == original_id {
                edge.target = assignee;
            }
        }

        if let Some(original) = data.nodes.get_mut(&(tenant_id, original_id)) {
            original.is_split = true;
            original.split_event_id = Some(split_event_id);
            original.updated_at = now;
        }

        Ok(())
    }
}

fn neighborhood_of(
    data: &GraphData,
    tenant_id: TenantId,
    entity_id: EntityId,
    max_neighbors: usize,
) -> GraphNeighborhood {
    let mut neighborhood = GraphNeighborhood {
        entity_id: Some(entity_id),
        ..Default::default()
    };

    for edge in data.edges.iter().filter(|e| e.tenant_id == tenant_id) {
        if edge.source == entity_id && neighborhood.outgoing_neighbors.len() < max_neighbors {
            neighborhood.outgoing_neighbors.insert(edge.target);
            neighborhood
                .relationship_types
                .entry(edge.target)
                .or_insert_with(|| edge.rel_type.clone());
        }
        if edge.target == entity_id && neighborhood.incoming_neighbors.len() < max_neighbors {
            neighborhood.incoming_neighbors.insert(edge.source);
            neighborhood
                .relationship_types
                .entry(edge.source)
                .or_insert_with(|| edge.rel_type.clone());
        }
    }

    neighborhood
}
