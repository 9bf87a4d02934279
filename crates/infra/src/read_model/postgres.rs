//! Postgres-backed read model.
//!
//! Blocking relies on the indexes from the migrations: `(tenant_id,
//! normalized_name)`, `(tenant_id, entity_type)`, a trigram GIN on
//! `normalized_name` and the generated `name_soundex` column.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use kmapper_consolidation::{ReviewFilters, ReviewStatistics, ReviewStatus};
use kmapper_core::{EntityId, PageId, RelationshipId, TenantId, UserId};

use super::{
    BlockingQuery, EntityRecord, EntityStore, MergeHistoryRecord, MergeHistoryStore,
    ReadModelError, RelationshipRecord, RelationshipStore, ReviewQueueRecord, ReviewStore,
};

#[derive(Debug, Clone)]
pub struct PostgresReadModel {
    pool: Arc<PgPool>,
}

impl PostgresReadModel {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage_err(e: impl std::fmt::Display) -> ReadModelError {
    ReadModelError::Storage(e.to_string())
}

fn entity_from_row(row: &sqlx::postgres::PgRow) -> Result<EntityRecord, ReadModelError> {
    Ok(EntityRecord {
        id: EntityId::from_uuid(row.try_get("id").map_err(storage_err)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(storage_err)?),
        source_page_id: row
            .try_get::<Option<Uuid>, _>("source_page_id")
            .map_err(storage_err)?
            .map(PageId::from_uuid),
        entity_type: row.try_get("entity_type").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        normalized_name: row.try_get("normalized_name").map_err(storage_err)?,
        description: row.try_get("description").map_err(storage_err)?,
        properties: row.try_get("properties").map_err(storage_err)?,
        extraction_method: row.try_get("extraction_method").map_err(storage_err)?,
        confidence: row.try_get("confidence").map_err(storage_err)?,
        is_canonical: row.try_get("is_canonical").map_err(storage_err)?,
        is_alias_of: row
            .try_get::<Option<Uuid>, _>("is_alias_of")
            .map_err(storage_err)?
            .map(EntityId::from_uuid),
        graph_node_id: row.try_get("graph_node_id").map_err(storage_err)?,
        synced_to_graph: row.try_get("synced_to_graph").map_err(storage_err)?,
        synced_at: row.try_get("synced_at").map_err(storage_err)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
    })
}

const ENTITY_COLUMNS: &str = r#"
    id, tenant_id, source_page_id, entity_type, name, normalized_name,
    description, properties, extraction_method, confidence, is_canonical,
    is_alias_of, graph_node_id, synced_to_graph, synced_at, created_at,
    updated_at
"#;

fn review_from_row(row: &sqlx::postgres::PgRow) -> Result<ReviewQueueRecord, ReadModelError> {
    let status_raw: String = row.try_get("status").map_err(storage_err)?;
    let status = ReviewStatus::parse(&status_raw)
        .ok_or_else(|| ReadModelError::Storage(format!("unknown review status '{status_raw}'")))?;

    Ok(ReviewQueueRecord {
        id: row.try_get("id").map_err(storage_err)?,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(storage_err)?),
        entity_a_id: EntityId::from_uuid(row.try_get("entity_a_id").map_err(storage_err)?),
        entity_b_id: EntityId::from_uuid(row.try_get("entity_b_id").map_err(storage_err)?),
        confidence: row.try_get("confidence").map_err(storage_err)?,
        review_priority: row.try_get("review_priority").map_err(storage_err)?,
        similarity_scores: row.try_get("similarity_scores").map_err(storage_err)?,
        status,
        reviewed_by: row
            .try_get::<Option<Uuid>, _>("reviewed_by")
            .map_err(storage_err)?
            .map(UserId::from_uuid),
        reviewed_at: row.try_get("reviewed_at").map_err(storage_err)?,
        reviewer_notes: row.try_get("reviewer_notes").map_err(storage_err)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
    })
}

const REVIEW_COLUMNS: &str = r#"
    id, tenant_id, entity_a_id, entity_b_id, confidence, review_priority,
    similarity_scores, status, reviewed_by, reviewed_at, reviewer_notes,
    created_at, updated_at
"#;

#[async_trait]
impl EntityStore for PostgresReadModel {
    async fn upsert_entity(&self, record: EntityRecord) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            INSERT INTO extracted_entities (
                id, tenant_id, source_page_id, entity_type, name,
                normalized_name, description, properties, extraction_method,
                confidence, is_canonical, is_alias_of, graph_node_id,
                synced_to_graph, synced_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                entity_type = EXCLUDED.entity_type,
                name = EXCLUDED.name,
                normalized_name = EXCLUDED.normalized_name,
                description = EXCLUDED.description,
                properties = EXCLUDED.properties,
                extraction_method = EXCLUDED.extraction_method,
                confidence = EXCLUDED.confidence,
                is_canonical = EXCLUDED.is_canonical,
                is_alias_of = EXCLUDED.is_alias_of,
                updated_at = NOW()
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.tenant_id.as_uuid())
        .bind(record.source_page_id.map(|p| *p.as_uuid()))
        .bind(&record.entity_type)
        .bind(&record.name)
        .bind(&record.normalized_name)
        .bind(&record.description)
        .bind(&record.properties)
        .bind(&record.extraction_method)
        .bind(record.confidence)
        .bind(record.is_canonical)
        .bind(record.is_alias_of.map(|a| *a.as_uuid()))
        .bind(&record.graph_node_id)
        .bind(record.synced_to_graph)
        .bind(record.synced_at)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn get_entity(
        &self,
        tenant_id: TenantId,
        id: EntityId,
    ) -> Result<Option<EntityRecord>, ReadModelError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM extracted_entities WHERE tenant_id = $1 AND id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_err)?;

        row.as_ref().map(entity_from_row).transpose()
    }

    async fn get_entities(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
    ) -> Result<Vec<Option<EntityRecord>>, ReadModelError> {
        let uuids: Vec<Uuid> = ids.iter().map(|i| *i.as_uuid()).collect();
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM extracted_entities WHERE tenant_id = $1 AND id = ANY($2)"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(&uuids)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = entity_from_row(row)?;
            by_id.insert(record.id, record);
        }

        Ok(ids.iter().map(|id| by_id.remove(id)).collect())
    }

    async fn find_by_page_and_name(
        &self,
        tenant_id: TenantId,
        page_id: PageId,
        name: &str,
    ) -> Result<Option<EntityRecord>, ReadModelError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM extracted_entities
             WHERE tenant_id = $1 AND source_page_id = $2 AND name = $3
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(page_id.as_uuid())
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_err)?;

        row.as_ref().map(entity_from_row).transpose()
    }

    async fn set_graph_sync(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        graph_node_id: &str,
    ) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            UPDATE extracted_entities
            SET graph_node_id = $3,
                synced_to_graph = TRUE,
                synced_at = NOW(),
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(graph_node_id)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn mark_aliases(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
        canonical_id: EntityId,
    ) -> Result<(), ReadModelError> {
        let uuids: Vec<Uuid> = ids.iter().map(|i| *i.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE extracted_entities
            SET is_canonical = FALSE,
                is_alias_of = $3,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&uuids)
        .bind(canonical_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn restore_canonical(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
    ) -> Result<(), ReadModelError> {
        let uuids: Vec<Uuid> = ids.iter().map(|i| *i.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE extracted_entities
            SET is_canonical = TRUE,
                is_alias_of = NULL,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&uuids)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn merge_properties(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        properties: serde_json::Value,
    ) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            UPDATE extracted_entities
            SET properties = properties || $3,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(&properties)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn mark_split(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        split_properties: serde_json::Value,
    ) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            UPDATE extracted_entities
            SET is_canonical = FALSE,
                properties = properties || $3,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(&split_properties)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn list_canonical(
        &self,
        tenant_id: TenantId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EntityRecord>, ReadModelError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM extracted_entities
             WHERE tenant_id = $1 AND is_canonical = TRUE
             ORDER BY created_at ASC, id ASC
             LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter().map(entity_from_row).collect()
    }

    async fn count_canonical(&self, tenant_id: TenantId) -> Result<u64, ReadModelError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM extracted_entities WHERE tenant_id = $1 AND is_canonical = TRUE",
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.try_get::<i64, _>("n").map_err(storage_err)? as u64)
    }

    async fn count_canonical_by_type(
        &self,
        tenant_id: TenantId,
    ) -> Result<HashMap<String, u64>, ReadModelError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, COUNT(*) AS n
            FROM extracted_entities
            WHERE tenant_id = $1 AND is_canonical = TRUE
            GROUP BY entity_type
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_err)?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            let entity_type: String = row.try_get("entity_type").map_err(storage_err)?;
            let n: i64 = row.try_get("n").map_err(storage_err)?;
            counts.insert(entity_type, n as u64);
        }
        Ok(counts)
    }

    async fn distinct_soundex_count(&self, tenant_id: TenantId) -> Result<u64, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(DISTINCT name_soundex) AS n
            FROM extracted_entities
            WHERE tenant_id = $1 AND is_canonical = TRUE
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.try_get::<i64, _>("n").map_err(storage_err)? as u64)
    }

    async fn list_unsynced(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<EntityRecord>, ReadModelError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM extracted_entities
             WHERE tenant_id = $1 AND synced_to_graph = FALSE
             ORDER BY created_at ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter().map(entity_from_row).collect()
    }

    async fn find_blocking_candidates(
        &self,
        tenant_id: TenantId,
        query: &BlockingQuery,
    ) -> Result<Vec<EntityRecord>, ReadModelError> {
        if query.is_empty() {
            return Ok(vec![]);
        }

        // OR of the enabled predicates; NULL parameters disable a strategy.
        // `normalized_name % $6` uses the pg_trgm GIN index, `name_soundex`
        // is the generated column.
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM extracted_entities
             WHERE tenant_id = $1
               AND is_canonical = TRUE
               AND ($2::uuid IS NULL OR id <> $2)
               AND (
                    ($3::text IS NOT NULL AND normalized_name LIKE $3 || '%')
                 OR ($4::text IS NOT NULL AND entity_type = $4)
                 OR ($5::text IS NOT NULL AND name_soundex = $5)
                 OR ($6::text IS NOT NULL AND normalized_name % $6)
               )
             LIMIT $7"
        );

        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(query.exclude_id.map(|i| *i.as_uuid()))
            .bind(query.prefix.as_deref())
            .bind(query.entity_type.as_deref())
            .bind(query.soundex.as_deref())
            .bind(query.trigram_of.as_deref())
            .bind(query.limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter().map(entity_from_row).collect()
    }
}

#[async_trait]
impl RelationshipStore for PostgresReadModel {
    async fn upsert_relationship(&self, record: RelationshipRecord) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            INSERT INTO entity_relationships (
                id, tenant_id, source_entity_id, target_entity_id,
                relationship_type, properties, confidence,
                graph_relationship_id, synced_to_graph
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                relationship_type = EXCLUDED.relationship_type,
                properties = EXCLUDED.properties,
                confidence = EXCLUDED.confidence
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.tenant_id.as_uuid())
        .bind(record.source_entity_id.as_uuid())
        .bind(record.target_entity_id.as_uuid())
        .bind(&record.relationship_type)
        .bind(&record.properties)
        .bind(record.confidence)
        .bind(&record.graph_relationship_id)
        .bind(record.synced_to_graph)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn set_relationship_graph_sync(
        &self,
        tenant_id: TenantId,
        id: RelationshipId,
        graph_relationship_id: &str,
    ) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            UPDATE entity_relationships
            SET graph_relationship_id = $3,
                synced_to_graph = TRUE
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(graph_relationship_id)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn count_for_entity(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<u64, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM entity_relationships
            WHERE tenant_id = $1 AND (source_entity_id = $2 OR target_entity_id = $2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(entity_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.try_get::<i64, _>("n").map_err(storage_err)? as u64)
    }

    async fn list_for_entity(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<Vec<RelationshipRecord>, ReadModelError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, source_entity_id, target_entity_id,
                   relationship_type, properties, confidence,
                   graph_relationship_id, synced_to_graph, created_at
            FROM entity_relationships
            WHERE tenant_id = $1 AND (source_entity_id = $2 OR target_entity_id = $2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(entity_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(RelationshipRecord {
                    id: RelationshipId::from_uuid(row.try_get("id").map_err(storage_err)?),
                    tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(storage_err)?),
                    source_entity_id: EntityId::from_uuid(
                        row.try_get("source_entity_id").map_err(storage_err)?,
                    ),
                    target_entity_id: EntityId::from_uuid(
                        row.try_get("target_entity_id").map_err(storage_err)?,
                    ),
                    relationship_type: row.try_get("relationship_type").map_err(storage_err)?,
                    properties: row.try_get("properties").map_err(storage_err)?,
                    confidence: row.try_get("confidence").map_err(storage_err)?,
                    graph_relationship_id: row
                        .try_get("graph_relationship_id")
                        .map_err(storage_err)?,
                    synced_to_graph: row.try_get("synced_to_graph").map_err(storage_err)?,
                    created_at: row.try_get("created_at").map_err(storage_err)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ReviewStore for PostgresReadModel {
    async fn upsert_pending(&self, record: ReviewQueueRecord) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            INSERT INTO merge_review_queue (
                id, tenant_id, entity_a_id, entity_b_id, confidence,
                review_priority, similarity_scores, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            ON CONFLICT (tenant_id, entity_a_id, entity_b_id) DO UPDATE SET
                confidence = EXCLUDED.confidence,
                review_priority = EXCLUDED.review_priority,
                similarity_scores = EXCLUDED.similarity_scores,
                status = 'pending',
                updated_at = NOW()
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id.as_uuid())
        .bind(record.entity_a_id.as_uuid())
        .bind(record.entity_b_id.as_uuid())
        .bind(record.confidence)
        .bind(record.review_priority)
        .bind(&record.similarity_scores)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn get_review(
        &self,
        tenant_id: TenantId,
        id: Uuid,
    ) -> Result<Option<ReviewQueueRecord>, ReadModelError> {
        let sql = format!(
            "SELECT {REVIEW_COLUMNS} FROM merge_review_queue WHERE tenant_id = $1 AND id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage_err)?;

        row.as_ref().map(review_from_row).transpose()
    }

    async fn decide(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        status: ReviewStatus,
        reviewed_by: UserId,
        notes: Option<String>,
    ) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            UPDATE merge_review_queue
            SET status = $3,
                reviewed_by = $4,
                reviewed_at = NOW(),
                reviewer_notes = $5,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id)
        .bind(status.as_str())
        .bind(reviewed_by.as_uuid())
        .bind(&notes)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn expire_pending_for(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
    ) -> Result<u64, ReadModelError> {
        let uuids: Vec<Uuid> = entity_ids.iter().map(|i| *i.as_uuid()).collect();
        let result = sqlx::query(
            r#"
            UPDATE merge_review_queue
            SET status = 'expired',
                updated_at = NOW()
            WHERE tenant_id = $1
              AND status = 'pending'
              AND (entity_a_id = ANY($2) OR entity_b_id = ANY($2))
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&uuids)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn list_reviews(
        &self,
        tenant_id: TenantId,
        filters: &ReviewFilters,
    ) -> Result<Vec<ReviewQueueRecord>, ReadModelError> {
        let rows = sqlx::query(
            r#"
            SELECT q.id, q.tenant_id, q.entity_a_id, q.entity_b_id, q.confidence,
                   q.review_priority, q.similarity_scores, q.status, q.reviewed_by,
                   q.reviewed_at, q.reviewer_notes, q.created_at, q.updated_at
            FROM merge_review_queue q
            LEFT JOIN extracted_entities a
              ON a.tenant_id = q.tenant_id AND a.id = q.entity_a_id
            WHERE q.tenant_id = $1
              AND ($2::text IS NULL OR q.status = $2)
              AND ($3::double precision IS NULL OR q.confidence >= $3)
              AND ($4::double precision IS NULL OR q.confidence <= $4)
              AND ($5::text IS NULL OR a.entity_type = $5)
            ORDER BY q.review_priority DESC, q.confidence DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(filters.status.map(|s| s.as_str()))
        .bind(filters.min_confidence)
        .bind(filters.max_confidence)
        .bind(filters.entity_type.as_deref())
        .bind(filters.limit.map(|l| l as i64).unwrap_or(i64::MAX))
        .bind(filters.offset.unwrap_or(0) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(review_from_row).collect()
    }

    async fn statistics(&self, tenant_id: TenantId) -> Result<ReviewStatistics, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'approved') AS approved,
                COUNT(*) FILTER (WHERE status = 'rejected') AS rejected,
                COUNT(*) FILTER (WHERE status = 'deferred') AS deferred,
                COUNT(*) FILTER (WHERE status = 'expired') AS expired,
                AVG(confidence) AS average_confidence,
                EXTRACT(EPOCH FROM (NOW() - MIN(created_at) FILTER (WHERE status = 'pending')))::bigint
                    AS oldest_pending_age_seconds
            FROM merge_review_queue
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_err)?;

        let mut stats = ReviewStatistics {
            total: row.try_get::<i64, _>("total").map_err(storage_err)? as u64,
            pending: row.try_get::<i64, _>("pending").map_err(storage_err)? as u64,
            approved: row.try_get::<i64, _>("approved").map_err(storage_err)? as u64,
            rejected: row.try_get::<i64, _>("rejected").map_err(storage_err)? as u64,
            deferred: row.try_get::<i64, _>("deferred").map_err(storage_err)? as u64,
            expired: row.try_get::<i64, _>("expired").map_err(storage_err)? as u64,
            average_confidence: row.try_get("average_confidence").map_err(storage_err)?,
            oldest_pending_age_seconds: row
                .try_get("oldest_pending_age_seconds")
                .map_err(storage_err)?,
            by_entity_type: HashMap::new(),
        };

        let rows = sqlx::query(
            r#"
            SELECT a.entity_type, COUNT(*) AS n
            FROM merge_review_queue q
            JOIN extracted_entities a
              ON a.tenant_id = q.tenant_id AND a.id = q.entity_a_id
            WHERE q.tenant_id = $1
            GROUP BY a.entity_type
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_err)?;

        for row in rows {
            let entity_type: String = row.try_get("entity_type").map_err(storage_err)?;
            let n: i64 = row.try_get("n").map_err(storage_err)?;
            stats.by_entity_type.insert(entity_type, n as u64);
        }

        Ok(stats)
    }
}

#[async_trait]
impl MergeHistoryStore for PostgresReadModel {
    async fn record_merge(&self, record: MergeHistoryRecord) -> Result<(), ReadModelError> {
        let merged: Vec<Uuid> = record.merged_entity_ids.iter().map(|i| *i.as_uuid()).collect();
        sqlx::query(
            r#"
            INSERT INTO merge_history (
                merge_event_id, tenant_id, canonical_entity_id,
                merged_entity_ids, merge_reason, merged_by_user_id,
                can_undo, undone
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (merge_event_id) DO NOTHING
            "#,
        )
        .bind(record.merge_event_id)
        .bind(record.tenant_id.as_uuid())
        .bind(record.canonical_entity_id.as_uuid())
        .bind(&merged)
        .bind(&record.merge_reason)
        .bind(record.merged_by_user_id.map(|u| *u.as_uuid()))
        .bind(record.can_undo)
        .bind(record.undone)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    async fn get_merge(
        &self,
        tenant_id: TenantId,
        merge_event_id: Uuid,
    ) -> Result<Option<MergeHistoryRecord>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT merge_event_id, tenant_id, canonical_entity_id,
                   merged_entity_ids, merge_reason, merged_by_user_id,
                   can_undo, undone, created_at
            FROM merge_history
            WHERE tenant_id = $1 AND merge_event_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(merge_event_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let merged: Vec<Uuid> = row.try_get("merged_entity_ids").map_err(storage_err)?;
        Ok(Some(MergeHistoryRecord {
            merge_event_id: row.try_get("merge_event_id").map_err(storage_err)?,
            tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(storage_err)?),
            canonical_entity_id: EntityId::from_uuid(
                row.try_get("canonical_entity_id").map_err(storage_err)?,
            ),
            merged_entity_ids: merged.into_iter().map(EntityId::from_uuid).collect(),
            merge_reason: row.try_get("merge_reason").map_err(storage_err)?,
            merged_by_user_id: row
                .try_get::<Option<Uuid>, _>("merged_by_user_id")
                .map_err(storage_err)?
                .map(UserId::from_uuid),
            can_undo: row.try_get("can_undo").map_err(storage_err)?,
            undone: row.try_get("undone").map_err(storage_err)?,
            created_at: row.try_get("created_at").map_err(storage_err)?,
        }))
    }

    async fn mark_undone(
        &self,
        tenant_id: TenantId,
        merge_event_id: Uuid,
    ) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            UPDATE merge_history
            SET undone = TRUE
            WHERE tenant_id = $1 AND merge_event_id = $2
              AND can_undo = TRUE AND undone = FALSE
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(merge_event_id)
        .execute(&*self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_merges(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<MergeHistoryRecord>, ReadModelError> {
        let rows = sqlx::query(
            r#"
            SELECT merge_event_id, tenant_id, canonical_entity_id,
                   merged_entity_ids, merge_reason, merged_by_user_id,
                   can_undo, undone, created_at
            FROM merge_history
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                let merged: Vec<Uuid> = row.try_get("merged_entity_ids").map_err(storage_err)?;
                Ok(MergeHistoryRecord {
                    merge_event_id: row.try_get("merge_event_id").map_err(storage_err)?,
                    tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(storage_err)?),
                    canonical_entity_id: EntityId::from_uuid(
                        row.try_get("canonical_entity_id").map_err(storage_err)?,
                    ),
                    merged_entity_ids: merged.into_iter().map(EntityId::from_uuid).collect(),
                    merge_reason: row.try_get("merge_reason").map_err(storage_err)?,
                    merged_by_user_id: row
                        .try_get::<Option<Uuid>, _>("merged_by_user_id")
                        .map_err(storage_err)?
                        .map(UserId::from_uuid),
                    can_undo: row.try_get("can_undo").map_err(storage_err)?,
                    undone: row.try_get("undone").map_err(storage_err)?,
                    created_at: row.try_get("created_at").map_err(storage_err)?,
                })
            })
            .collect()
    }
}
