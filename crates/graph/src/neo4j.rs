//! Neo4j-backed graph store.
//!
//! Cypher notes:
//! - Nodes are `MERGE`d on `(id, tenant_id)` so replays are idempotent.
//! - Relationship labels cannot be parameterized; dynamic types go through
//!   `sanitize_rel_type` before interpolation.
//! - Transferred edges are recreated as `RELATED_TO` carrying
//!   `original_type`, `transferred_from` and `transferred_at`.

use std::collections::HashMap;

use async_trait::async_trait;
use neo4rs::{Graph, query};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use kmapper_consolidation::GraphNeighborhood;
use kmapper_core::{EntityId, TenantId};

use crate::store::{
    EntityNode, GraphError, GraphRelationship, GraphStore, MergeSyncReport, sanitize_rel_type,
};

/// Graph store speaking Bolt to a Neo4j instance.
#[derive(Clone)]
pub struct Neo4jGraphStore {
    graph: Graph,
}

impl Neo4jGraphStore {
    pub async fn connect(
        uri: impl AsRef<str>,
        user: impl AsRef<str>,
        password: impl AsRef<str>,
    ) -> Result<Self, GraphError> {
        let graph = Graph::new(uri.as_ref(), user.as_ref(), password.as_ref())
            .await
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;
        Ok(Self { graph })
    }

    pub fn from_graph(graph: Graph) -> Self {
        Self { graph }
    }

    /// Create the indexes the read paths rely on. Idempotent.
    pub async fn ensure_indexes(&self) -> Result<(), GraphError> {
        for statement in [
            "CREATE INDEX entity_id IF NOT EXISTS FOR (e:Entity) ON (e.id)",
            "CREATE INDEX entity_tenant IF NOT EXISTS FOR (e:Entity) ON (e.tenant_id)",
            "CREATE FULLTEXT INDEX entity_text IF NOT EXISTS FOR (e:Entity) ON EACH [e.name, e.description]",
        ] {
            self.graph
                .run(query(statement))
                .await
                .map_err(|e| GraphError::Query(e.to_string()))?;
        }
        Ok(())
    }

    fn map_err(e: neo4rs::Error) -> GraphError {
        GraphError::Query(e.to_string())
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    #[instrument(skip(self, node), fields(entity_id = %node.entity_id, tenant_id = %node.tenant_id), err)]
    async fn upsert_entity_node(&self, node: &EntityNode) -> Result<String, GraphError> {
        let properties_json =
            serde_json::to_string(&node.properties).unwrap_or_else(|_| "{}".to_string());

        let mut result = self
            .graph
            .execute(
                query(
                    "MERGE (e:Entity {id: $id, tenant_id: $tenant_id})
                     SET e.name = $name,
                         e.type = $entity_type,
                         e.description = $description,
                         e.properties_json = $properties_json,
                         e.restored_from_merge = false,
                         e.updated_at = datetime()
                     RETURN elementId(e) AS node_id",
                )
                .param("id", node.entity_id.to_string())
                .param("tenant_id", node.tenant_id.to_string())
                .param("name", node.name.clone())
                .param("entity_type", node.entity_type.to_uppercase())
                .param("description", node.description.clone().unwrap_or_default())
                .param("properties_json", properties_json),
            )
            .await
            .map_err(Self::map_err)?;

        let row = result
            .next()
            .await
            .map_err(Self::map_err)?
            .ok_or_else(|| GraphError::Query("MERGE returned no row".to_string()))?;
        row.get::<String>("node_id")
            .map_err(|e| GraphError::Query(e.to_string()))
    }

    #[instrument(skip(self, rel), fields(relationship_id = %rel.relationship_id), err)]
    async fn create_relationship(&self, rel: &GraphRelationship) -> Result<String, GraphError> {
        let rel_type = sanitize_rel_type(&rel.relationship_type);
        let statement = format!(
            "MATCH (source:Entity {{id: $source_id, tenant_id: $tenant_id}})
             MATCH (target:Entity {{id: $target_id, tenant_id: $tenant_id}})
             MERGE (source)-[r:{rel_type} {{pg_id: $pg_id}}]->(target)
             SET r.confidence = $confidence,
                 r.tenant_id = $tenant_id
             RETURN elementId(r) AS rel_id"
        );

        let mut result = self
            .graph
            .execute(
                query(&statement)
                    .param("source_id", rel.source_entity_id.to_string())
                    .param("target_id", rel.target_entity_id.to_string())
                    .param("tenant_id", rel.tenant_id.to_string())
                    .param("pg_id", rel.relationship_id.to_string())
                    .param("confidence", rel.confidence),
            )
            .await
            .map_err(Self::map_err)?;

        match result.next().await.map_err(Self::map_err)? {
            Some(row) => row
                .get::<String>("rel_id")
                .map_err(|e| GraphError::Query(e.to_string())),
            None => Err(GraphError::NodeNotFound {
                tenant_id: rel.tenant_id,
                entity_id: rel.source_entity_id,
            }),
        }
    }

    async fn node_exists(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<bool, GraphError> {
        let mut result = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {id: $id, tenant_id: $tenant_id})
                     RETURN count(e) AS n",
                )
                .param("id", entity_id.to_string())
                .param("tenant_id", tenant_id.to_string()),
            )
            .await
            .map_err(Self::map_err)?;

        let row = result.next().await.map_err(Self::map_err)?;
        Ok(row
            .map(|r| r.get::<i64>("n").unwrap_or(0) > 0)
            .unwrap_or(false))
    }

    async fn get_neighborhood(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        max_neighbors: usize,
    ) -> Result<GraphNeighborhood, GraphError> {
        let mut neighborhood = GraphNeighborhood {
            entity_id: Some(entity_id),
            ..Default::default()
        };

        let mut outgoing = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {id: $id, tenant_id: $tenant_id})-[r]->(n:Entity)
                     WHERE n.tenant_id = $tenant_id
                     RETURN n.id AS neighbor_id, type(r) AS rel_type
                     LIMIT $limit",
                )
                .param("id", entity_id.to_string())
                .param("tenant_id", tenant_id.to_string())
                .param("limit", max_neighbors as i64),
            )
            .await
            .map_err(Self::map_err)?;

        while let Some(row) = outgoing.next().await.map_err(Self::map_err)? {
            let Ok(raw_id) = row.get::<String>("neighbor_id") else { continue };
            let Ok(neighbor_id) = raw_id.parse::<EntityId>() else { continue };
            neighborhood.outgoing_neighbors.insert(neighbor_id);
            if let Ok(rel_type) = row.get::<String>("rel_type") {
                neighborhood
                    .relationship_types
                    .entry(neighbor_id)
                    .or_insert(rel_type);
            }
        }

        let mut incoming = self
            .graph
            .execute(
                query(
                    "MATCH (n:Entity)-[r]->(e:Entity {id: $id, tenant_id: $tenant_id})
                     WHERE n.tenant_id = $tenant_id
                     RETURN n.id AS neighbor_id, type(r) AS rel_type
                     LIMIT $limit",
                )
                .param("id", entity_id.to_string())
                .param("tenant_id", tenant_id.to_string())
                .param("limit", max_neighbors as i64),
            )
            .await
            .map_err(Self::map_err)?;

        while let Some(row) = incoming.next().await.map_err(Self::map_err)? {
            let Ok(raw_id) = row.get::<String>("neighbor_id") else { continue };
            let Ok(neighbor_id) = raw_id.parse::<EntityId>() else { continue };
            neighborhood.incoming_neighbors.insert(neighbor_id);
            if let Ok(rel_type) = row.get::<String>("rel_type") {
                neighborhood
                    .relationship_types
                    .entry(neighbor_id)
                    .or_insert(rel_type);
            }
        }

        Ok(neighborhood)
    }

    async fn get_neighborhoods(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
        max_neighbors: usize,
    ) -> Result<HashMap<EntityId, GraphNeighborhood>, GraphError> {
        let mut out = HashMap::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            out.insert(
                *entity_id,
                self.get_neighborhood(tenant_id, *entity_id, max_neighbors)
                    .await?,
            );
        }
        Ok(out)
    }

    #[instrument(skip(self, merged_ids, merged_names), fields(canonical_id = %canonical_id, merged = merged_ids.len()), err)]
    async fn apply_merge(
        &self,
        tenant_id: TenantId,
        canonical_id: EntityId,
        merged_ids: &[EntityId],
        merged_names: &[String],
        merge_event_id: Uuid,
    ) -> Result<MergeSyncReport, GraphError> {
        let tenant = tenant_id.to_string();
        let canonical = canonical_id.to_string();
        let merged: Vec<String> = merged_ids.iter().map(EntityId::to_string).collect();
        let mut report = MergeSyncReport::default();

        // Step 1: transfer outgoing relationships from merged to canonical.
        let transfer_outgoing = query(
            "UNWIND $merged_ids AS merged_id
             MATCH (merged:Entity {id: merged_id, tenant_id: $tenant_id})-[r]->(target)
             WHERE target.id <> $canonical_id
             WITH merged, r, target, type(r) AS rel_type, properties(r) AS rel_props
             MATCH (canonical:Entity {id: $canonical_id, tenant_id: $tenant_id})
             CREATE (canonical)-[new_r:RELATED_TO]->(target)
             SET new_r = rel_props,
                 new_r.original_type = rel_type,
                 new_r.transferred_from = merged.id,
                 new_r.transferred_at = datetime()
             DELETE r
             RETURN count(new_r) AS transferred",
        )
        .param("merged_ids", merged.clone())
        .param("canonical_id", canonical.clone())
        .param("tenant_id", tenant.clone());

        match self.graph.execute(transfer_outgoing).await {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    report.outgoing_transferred = row.get::<i64>("transferred").unwrap_or(0) as u64;
                }
            }
            Err(e) => {
                // Remaining steps still run; the event can be replayed.
                warn!(error = %e, "failed to transfer outgoing relationships");
            }
        }

        // Step 2: transfer incoming relationships.
        let transfer_incoming = query(
            "UNWIND $merged_ids AS merged_id
             MATCH (source)-[r]->(merged:Entity {id: merged_id, tenant_id: $tenant_id})
             WHERE source.id <> $canonical_id
             WITH source, r, merged, type(r) AS rel_type, properties(r) AS rel_props
             MATCH (canonical:Entity {id: $canonical_id, tenant_id: $tenant_id})
             CREATE (source)-[new_r:RELATED_TO]->(canonical)
             SET new_r = rel_props,
                 new_r.original_type = rel_type,
                 new_r.transferred_from = merged.id,
                 new_r.transferred_at = datetime()
             DELETE r
             RETURN count(new_r) AS transferred",
        )
        .param("merged_ids", merged.clone())
        .param("canonical_id", canonical.clone())
        .param("tenant_id", tenant.clone());

        match self.graph.execute(transfer_incoming).await {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    report.incoming_transferred = row.get::<i64>("transferred").unwrap_or(0) as u64;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to transfer incoming relationships");
            }
        }

        // Step 3: remove self-referential relationships.
        let mut rows = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity {id: $canonical_id, tenant_id: $tenant_id})-[r]->(e)
                     DELETE r
                     RETURN count(r) AS deleted",
                )
                .param("canonical_id", canonical.clone())
                .param("tenant_id", tenant.clone()),
            )
            .await
            .map_err(Self::map_err)?;
        if let Ok(Some(row)) = rows.next().await {
            report.self_loops_removed = row.get::<i64>("deleted").unwrap_or(0) as u64;
        }

        // Step 4: deduplicate parallel edges, keeping the highest confidence.
        let mut rows = self
            .graph
            .execute(
                query(
                    "MATCH (canonical:Entity {id: $canonical_id, tenant_id: $tenant_id})-[r]->(target)
                     WITH canonical, target, type(r) AS rel_type, collect(r) AS rels
                     WHERE size(rels) > 1
                     WITH rels, reduce(best = head(rels), r IN tail(rels) |
                         CASE WHEN coalesce(r.confidence, 0) > coalesce(best.confidence, 0)
                         THEN r ELSE best END
                     ) AS keeper
                     FOREACH (r IN [rel IN rels WHERE rel <> keeper] | DELETE r)
                     RETURN count(*) AS deduplicated",
                )
                .param("canonical_id", canonical.clone())
                .param("tenant_id", tenant.clone()),
            )
            .await
            .map_err(Self::map_err)?;
        if let Ok(Some(row)) = rows.next().await {
            report.duplicates_removed = row.get::<i64>("deduplicated").unwrap_or(0) as u64;
        }

        // Step 5: delete merged nodes.
        let mut rows = self
            .graph
            .execute(
                query(
                    "UNWIND $merged_ids AS merged_id
                     MATCH (merged:Entity {id: merged_id, tenant_id: $tenant_id})
                     DETACH DELETE merged
                     RETURN count(merged) AS deleted",
                )
                .param("merged_ids", merged)
                .param("tenant_id", tenant.clone()),
            )
            .await
            .map_err(Self::map_err)?;
        if let Ok(Some(row)) = rows.next().await {
            report.nodes_deleted = row.get::<i64>("deleted").unwrap_or(0) as u64;
        }

        // Step 6: update canonical node metadata.
        self.graph
            .run(
                query(
                    "MATCH (e:Entity {id: $canonical_id, tenant_id: $tenant_id})
                     SET e.aliases = coalesce(e.aliases, []) + $merged_names,
                         e.merged_count = coalesce(e.merged_count, 0) + $merge_count,
                         e.last_merged_at = datetime(),
                         e.merge_event_id = $merge_event_id",
                )
                .param("canonical_id", canonical_id.to_string())
                .param("tenant_id", tenant)
                .param("merged_names", merged_names.to_vec())
                .param("merge_count", merged_ids.len() as i64)
                .param("merge_event_id", merge_event_id.to_string()),
            )
            .await
            .map_err(Self::map_err)?;

        info!(?report, "neo4j merge sync completed");
        Ok(report)
    }

    async fn apply_undo(
        &self,
        tenant_id: TenantId,
        canonical_id: EntityId,
        restored_ids: &[EntityId],
        undo_event_id: Uuid,
    ) -> Result<(), GraphError> {
        let restored: Vec<String> = restored_ids.iter().map(EntityId::to_string).collect();

        self.graph
            .run(
                query(
                    "UNWIND $restored_ids AS restored_id
                     MERGE (e:Entity {id: restored_id, tenant_id: $tenant_id})
                     ON CREATE SET
                         e.created_at = datetime(),
                         e.restored_from_merge = true,
                         e.restored_at = datetime(),
                         e.undo_event_id = $undo_event_id",
                )
                .param("restored_ids", restored)
                .param("tenant_id", tenant_id.to_string())
                .param("undo_event_id", undo_event_id.to_string()),
            )
            .await
            .map_err(Self::map_err)?;

        self.graph
            .run(
                query(
                    "MATCH (e:Entity {id: $canonical_id, tenant_id: $tenant_id})
                     SET e.undo_count = coalesce(e.undo_count, 0) + 1,
                         e.last_undo_at = datetime(),
                         e.last_undo_event_id = $undo_event_id",
                )
                .param("canonical_id", canonical_id.to_string())
                .param("tenant_id", tenant_id.to_string())
                .param("undo_event_id", undo_event_id.to_string()),
            )
            .await
            .map_err(Self::map_err)?;

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
        let tenant = tenant_id.to_string();
        let original = original_id.to_string();

        // Step 1: create the new entity nodes with provenance.
        for (index, (new_id, new_name)) in new_entities.iter().enumerate() {
            self.graph
                .run(
                    query(
                        "MERGE (e:Entity {id: $new_id, tenant_id: $tenant_id})
                         ON CREATE SET
                             e.name = $name,
                             e.created_at = datetime(),
                             e.split_from = $original_id,
                             e.split_index = $index,
                             e.split_event_id = $split_event_id",
                    )
                    .param("new_id", new_id.to_string())
                    .param("tenant_id", tenant.clone())
                    .param("name", new_name.clone())
                    .param("original_id", original.clone())
                    .param("index", index as i64)
                    .param("split_event_id", split_event_id.to_string()),
                )
                .await
                .map_err(Self::map_err)?;
        }

        // Step 2: explicit assignments; stale ids match nothing and are
        // silently skipped.
        for (rel_id, target_entity_id) in relationship_assignments {
            for statement in [
                "MATCH (original:Entity {id: $original_id, tenant_id: $tenant_id})-[r]->(target)
                 WHERE r.pg_id = $rel_id
                 MATCH (new_entity:Entity {id: $new_entity_id, tenant_id: $tenant_id})
                 WITH r, target, new_entity, type(r) AS rel_type, properties(r) AS props
                 CREATE (new_entity)-[new_r:RELATED_TO]->(target)
                 SET new_r = props,
                     new_r.original_type = rel_type,
                     new_r.split_from = $original_id
                 DELETE r",
                "MATCH (source)-[r]->(original:Entity {id: $original_id, tenant_id: $tenant_id})
                 WHERE r.pg_id = $rel_id
                 MATCH (new_entity:Entity {id: $new_entity_id, tenant_id: $tenant_id})
                 WITH source, r, new_entity, type(r) AS rel_type, properties(r) AS props
                 CREATE (source)-[new_r:RELATED_TO]->(new_entity)
                 SET new_r = props,
                     new_r.original_type = rel_type,
                     new_r.split_from = $original_id
                 DELETE r",
            ] {
                self.graph
                    .run(
                        query(statement)
                            .param("original_id", original.clone())
                            .param("tenant_id", tenant.clone())
                            .param("rel_id", rel_id.to_string())
                            .param("new_entity_id", target_entity_id.to_string()),
                    )
                    .await
                    .map_err(Self::map_err)?;
            }
        }

        // Step 3: everything still attached to the original moves to the
        // first new entity.
        if let Some((first_new_id, _)) = new_entities.first() {
            for statement in [
                "MATCH (original:Entity {id: $original_id, tenant_id: $tenant_id})-[r]->(target)
                 MATCH (new_entity:Entity {id: $first_new_id, tenant_id: $tenant_id})
                 WITH r, target, new_entity, type(r) AS rel_type, properties(r) AS props
                 CREATE (new_entity)-[new_r:RELATED_TO]->(target)
                 SET new_r = props,
                     new_r.original_type = rel_type,
                     new_r.split_from = $original_id
                 DELETE r",
                "MATCH (source)-[r]->(original:Entity {id: $original_id, tenant_id: $tenant_id})
                 MATCH (new_entity:Entity {id: $first_new_id, tenant_id: $tenant_id})
                 WITH source, r, new_entity, type(r) AS rel_type, properties(r) AS props
                 CREATE (source)-[new_r:RELATED_TO]->(new_entity)
                 SET new_r = props,
                     new_r.original_type = rel_type,
                     new_r.split_from = $original_id
                 DELETE r",
            ] {
                self.graph
                    .run(
                        query(statement)
                            .param("original_id", original.clone())
                            .param("tenant_id", tenant.clone())
                            .param("first_new_id", first_new_id.to_string()),
                    )
                    .await
                    .map_err(Self::map_err)?;
            }
        }

        // Step 4: mark the original as split.
        self.graph
            .run(
                query(
                    "MATCH (e:Entity {id: $original_id, tenant_id: $tenant_id})
                     SET e.is_split = true,
                         e.split_event_id = $split_event_id,
                         e.updated_at = datetime()",
                )
                .param("original_id", original)
                .param("tenant_id", tenant)
                .param("split_event_id", split_event_id.to_string()),
            )
            .await
            .map_err(Self::map_err)?;

        Ok(())
    }
}
