//! In-memory read model for tests and development.
//!
//! One state blob behind a mutex implements all four store traits, so
//! statistics and filters can join across tables the way the SQL
//! implementation does.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use kmapper_consolidation::{
    ReviewFilters, ReviewStatistics, ReviewStatus, soundex, trigram_similarity,
};
use kmapper_core::{EntityId, PageId, RelationshipId, TenantId, UserId};

use super::{
    BlockingQuery, EntityRecord, EntityStore, MergeHistoryRecord, MergeHistoryStore,
    ReadModelError, RelationshipRecord, RelationshipStore, ReviewQueueRecord, ReviewStore,
};

/// pg_trgm's default similarity threshold for the `%` operator.
const TRIGRAM_MATCH_THRESHOLD: f64 = 0.3;

#[derive(Debug, Default)]
struct State {
    entities: HashMap<(TenantId, EntityId), EntityRecord>,
    relationships: HashMap<(TenantId, RelationshipId), RelationshipRecord>,
    reviews: HashMap<(TenantId, Uuid), ReviewQueueRecord>,
    history: HashMap<(TenantId, Uuid), MergeHistoryRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryReadModel {
    state: Mutex<State>,
}

impl InMemoryReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// All relationship rows for a tenant (tests).
    pub fn relationships_snapshot(&self, tenant_id: TenantId) -> Vec<RelationshipRecord> {
        self.with_state(|state| {
            state
                .relationships
                .values()
                .filter(|r| r.tenant_id == tenant_id)
                .cloned()
                .collect()
        })
    }
}

fn merge_json(into: &mut JsonValue, from: &JsonValue) {
    match (into.as_object_mut(), from.as_object()) {
        (Some(target), Some(source)) => {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => {
            if from.is_object() {
                *into = from.clone();
            }
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryReadModel {
    async fn upsert_entity(&self, record: EntityRecord) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            state.entities.insert((record.tenant_id, record.id), record);
        });
        Ok(())
    }

    async fn get_entity(
        &self,
        tenant_id: TenantId,
        id: EntityId,
    ) -> Result<Option<EntityRecord>, ReadModelError> {
        Ok(self.with_state(|state| state.entities.get(&(tenant_id, id)).cloned()))
    }

    async fn get_entities(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
    ) -> Result<Vec<Option<EntityRecord>>, ReadModelError> {
        Ok(self.with_state(|state| {
            ids.iter()
                .map(|id| state.entities.get(&(tenant_id, *id)).cloned())
                .collect()
        }))
    }

    async fn find_by_page_and_name(
        &self,
        tenant_id: TenantId,
        page_id: PageId,
        name: &str,
    ) -> Result<Option<EntityRecord>, ReadModelError> {
        Ok(self.with_state(|state| {
            state
                .entities
                .values()
                .find(|e| {
                    e.tenant_id == tenant_id
                        && e.source_page_id == Some(page_id)
                        && e.name == name
                })
                .cloned()
        }))
    }

    async fn set_graph_sync(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        graph_node_id: &str,
    ) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            if let Some(entity) = state.entities.get_mut(&(tenant_id, id)) {
                entity.graph_node_id = Some(graph_node_id.to_string());
                entity.synced_to_graph = true;
                entity.synced_at = Some(Utc::now());
                entity.updated_at = Utc::now();
            }
        });
        Ok(())
    }

    async fn mark_aliases(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
        canonical_id: EntityId,
    ) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            for id in ids {
                if let Some(entity) = state.entities.get_mut(&(tenant_id, *id)) {
                    entity.is_canonical = false;
                    entity.is_alias_of = Some(canonical_id);
                    entity.updated_at = Utc::now();
                }
            }
        });
        Ok(())
    }

    async fn restore_canonical(
        &self,
        tenant_id: TenantId,
        ids: &[EntityId],
    ) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            for id in ids {
                if let Some(entity) = state.entities.get_mut(&(tenant_id, *id)) {
                    entity.is_canonical = true;
                    entity.is_alias_of = None;
                    entity.updated_at = Utc::now();
                }
            }
        });
        Ok(())
    }

    async fn merge_properties(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        properties: JsonValue,
    ) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            if let Some(entity) = state.entities.get_mut(&(tenant_id, id)) {
                merge_json(&mut entity.properties, &properties);
                entity.updated_at = Utc::now();
            }
        });
        Ok(())
    }

    async fn mark_split(
        &self,
        tenant_id: TenantId,
        id: EntityId,
        split_properties: JsonValue,
    ) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            if let Some(entity) = state.entities.get_mut(&(tenant_id, id)) {
                entity.is_canonical = false;
                merge_json(&mut entity.properties, &split_properties);
                entity.updated_at = Utc::now();
            }
        });
        Ok(())
    }

    async fn list_canonical(
        &self,
        tenant_id: TenantId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EntityRecord>, ReadModelError> {
        Ok(self.with_state(|state| {
            let mut canonical: Vec<EntityRecord> = state
                .entities
                .values()
                .filter(|e| e.tenant_id == tenant_id && e.is_canonical)
                .cloned()
                .collect();
            canonical.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            canonical.into_iter().skip(offset).take(limit).collect()
        }))
    }

    async fn count_canonical(&self, tenant_id: TenantId) -> Result<u64, ReadModelError> {
        Ok(self.with_state(|state| {
            state
                .entities
                .values()
                .filter(|e| e.tenant_id == tenant_id && e.is_canonical)
                .count() as u64
        }))
    }

    async fn count_canonical_by_type(
        &self,
        tenant_id: TenantId,
    ) -> Result<HashMap<String, u64>, ReadModelError> {
        Ok(self.with_state(|state| {
            let mut counts: HashMap<String, u64> = HashMap::new();
            for entity in state
                .entities
                .values()
                .filter(|e| e.tenant_id == tenant_id && e.is_canonical)
            {
                *counts.entry(entity.entity_type.clone()).or_default() += 1;
            }
            counts
        }))
    }

    async fn distinct_soundex_count(&self, tenant_id: TenantId) -> Result<u64, ReadModelError> {
        Ok(self.with_state(|state| {
            state
                .entities
                .values()
                .filter(|e| e.tenant_id == tenant_id && e.is_canonical)
                .map(|e| soundex(&e.name))
                .filter(|code| !code.is_empty())
                .collect::<std::collections::HashSet<_>>()
                .len() as u64
        }))
    }

    async fn list_unsynced(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<EntityRecord>, ReadModelError> {
        Ok(self.with_state(|state| {
            state
                .entities
                .values()
                .filter(|e| e.tenant_id == tenant_id && !e.synced_to_graph)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn find_blocking_candidates(
        &self,
        tenant_id: TenantId,
        query: &BlockingQuery,
    ) -> Result<Vec<EntityRecord>, ReadModelError> {
        if query.is_empty() {
            return Ok(vec![]);
        }

        Ok(self.with_state(|state| {
            let mut matches: Vec<EntityRecord> = state
                .entities
                .values()
                .filter(|e| e.tenant_id == tenant_id && e.is_canonical)
                .filter(|e| Some(e.id) != query.exclude_id)
                .filter(|e| {
                    let prefix_hit = query
                        .prefix
                        .as_deref()
                        .is_some_and(|p| e.normalized_name.starts_with(p));
                    let type_hit = query
                        .entity_type
                        .as_deref()
                        .is_some_and(|t| e.entity_type == t);
                    let soundex_hit = query
                        .soundex
                        .as_deref()
                        .is_some_and(|s| !s.is_empty() && soundex(&e.name) == s);
                    let trigram_hit = query.trigram_of.as_deref().is_some_and(|t| {
                        trigram_similarity(&e.normalized_name, t) >= TRIGRAM_MATCH_THRESHOLD
                    });
                    prefix_hit || type_hit || soundex_hit || trigram_hit
                })
                .cloned()
                .collect();

            matches.sort_by(|a, b| a.id.cmp(&b.id));
            matches.truncate(query.limit);
            matches
        }))
    }
}

#[async_trait]
impl RelationshipStore for InMemoryReadModel {
    async fn upsert_relationship(&self, record: RelationshipRecord) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            state
                .relationships
                .insert((record.tenant_id, record.id), record);
        });
        Ok(())
    }

    async fn set_relationship_graph_sync(
        &self,
        tenant_id: TenantId,
        id: RelationshipId,
        graph_relationship_id: &str,
    ) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            if let Some(rel) = state.relationships.get_mut(&(tenant_id, id)) {
                rel.graph_relationship_id = Some(graph_relationship_id.to_string());
                rel.synced_to_graph = true;
            }
        });
        Ok(())
    }

    async fn count_for_entity(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<u64, ReadModelError> {
        Ok(self.with_state(|state| {
            state
                .relationships
                .values()
                .filter(|r| {
                    r.tenant_id == tenant_id
                        && (r.source_entity_id == entity_id || r.target_entity_id == entity_id)
                })
                .count() as u64
        }))
    }

    async fn list_for_entity(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<Vec<RelationshipRecord>, ReadModelError> {
        Ok(self.with_state(|state| {
            state
                .relationships
                .values()
                .filter(|r| {
                    r.tenant_id == tenant_id
                        && (r.source_entity_id == entity_id || r.target_entity_id == entity_id)
                })
                .cloned()
                .collect()
        }))
    }
}

#[async_trait]
impl ReviewStore for InMemoryReadModel {
    async fn upsert_pending(&self, record: ReviewQueueRecord) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            // Uniqueness is on the pair, not the id: a replayed event for a
            // known pair refreshes the existing row.
            let existing_id = state
                .reviews
                .values()
                .find(|r| {
                    r.tenant_id == record.tenant_id
                        && r.entity_a_id == record.entity_a_id
                        && r.entity_b_id == record.entity_b_id
                })
                .map(|r| r.id);

            match existing_id {
                Some(id) => {
                    if let Some(existing) = state.reviews.get_mut(&(record.tenant_id, id)) {
                        existing.confidence = record.confidence;
                        existing.review_priority = record.review_priority;
                        existing.similarity_scores = record.similarity_scores.clone();
                        existing.status = ReviewStatus::Pending;
                        existing.updated_at = Utc::now();
                    }
                }
                None => {
                    state.reviews.insert((record.tenant_id, record.id), record);
                }
            }
        });
        Ok(())
    }

    async fn get_review(
        &self,
        tenant_id: TenantId,
        id: Uuid,
    ) -> Result<Option<ReviewQueueRecord>, ReadModelError> {
        Ok(self.with_state(|state| state.reviews.get(&(tenant_id, id)).cloned()))
    }

    async fn decide(
        &self,
        tenant_id: TenantId,
        id: Uuid,
        status: ReviewStatus,
        reviewed_by: UserId,
        notes: Option<String>,
    ) -> Result<bool, ReadModelError> {
        Ok(self.with_state(|state| {
            match state.reviews.get_mut(&(tenant_id, id)) {
                Some(review) => {
                    review.status = status;
                    review.reviewed_by = Some(reviewed_by);
                    review.reviewed_at = Some(Utc::now());
                    review.reviewer_notes = notes;
                    review.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        }))
    }

    async fn expire_pending_for(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
    ) -> Result<u64, ReadModelError> {
        Ok(self.with_state(|state| {
            let mut expired = 0u64;
            for review in state.reviews.values_mut().filter(|r| {
                r.tenant_id == tenant_id
                    && r.status == ReviewStatus::Pending
                    && (entity_ids.contains(&r.entity_a_id) || entity_ids.contains(&r.entity_b_id))
            }) {
                review.status = ReviewStatus::Expired;
                review.updated_at = Utc::now();
                expired += 1;
            }
            expired
        }))
    }

    async fn list_reviews(
        &self,
        tenant_id: TenantId,
        filters: &ReviewFilters,
    ) -> Result<Vec<ReviewQueueRecord>, ReadModelError> {
        Ok(self.with_state(|state| {
            let mut matches: Vec<ReviewQueueRecord> = state
                .reviews
                .values()
                .filter(|r| r.tenant_id == tenant_id)
                .filter(|r| filters.status.is_none_or(|s| r.status == s))
                .filter(|r| filters.min_confidence.is_none_or(|m| r.confidence >= m))
                .filter(|r| filters.max_confidence.is_none_or(|m| r.confidence <= m))
                .filter(|r| match &filters.entity_type {
                    Some(entity_type) => state
                        .entities
                        .get(&(tenant_id, r.entity_a_id))
                        .is_some_and(|e| &e.entity_type == entity_type),
                    None => true,
                })
                .cloned()
                .collect();

            matches.sort_by(|a, b| {
                b.review_priority.cmp(&a.review_priority).then(
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
            });

            let offset = filters.offset.unwrap_or(0);
            let limit = filters.limit.unwrap_or(usize::MAX);
            matches.into_iter().skip(offset).take(limit).collect()
        }))
    }

    async fn statistics(&self, tenant_id: TenantId) -> Result<ReviewStatistics, ReadModelError> {
        Ok(self.with_state(|state| {
            let mut stats = ReviewStatistics::default();
            let mut confidence_sum = 0.0;
            let now = Utc::now();

            for review in state.reviews.values().filter(|r| r.tenant_id == tenant_id) {
                stats.total += 1;
                confidence_sum += review.confidence;
                match review.status {
                    ReviewStatus::Pending => {
                        stats.pending += 1;
                        let age = (now - review.created_at).num_seconds();
                        stats.oldest_pending_age_seconds = Some(
                            stats.oldest_pending_age_seconds.map_or(age, |m: i64| m.max(age)),
                        );
                    }
                    ReviewStatus::Approved => stats.approved += 1,
                    ReviewStatus::Rejected => stats.rejected += 1,
                    ReviewStatus::Deferred => stats.deferred += 1,
                    ReviewStatus::Expired => stats.expired += 1,
                }

                if let Some(entity) = state.entities.get(&(tenant_id, review.entity_a_id)) {
                    *stats.by_entity_type.entry(entity.entity_type.clone()).or_default() += 1;
                }
            }

            if stats.total > 0 {
                stats.average_confidence = Some(confidence_sum / stats.total as f64);
            }
            stats
        }))
    }
}

#[async_trait]
impl MergeHistoryStore for InMemoryReadModel {
    async fn record_merge(&self, record: MergeHistoryRecord) -> Result<(), ReadModelError> {
        self.with_state(|state| {
            state
                .history
                .insert((record.tenant_id, record.merge_event_id), record);
        });
        Ok(())
    }

    async fn get_merge(
        &self,
        tenant_id: TenantId,
        merge_event_id: Uuid,
    ) -> Result<Option<MergeHistoryRecord>, ReadModelError> {
        Ok(self.with_state(|state| state.history.get(&(tenant_id, merge_event_id)).cloned()))
    }

    async fn mark_undone(
        &self,
        tenant_id: TenantId,
        merge_event_id: Uuid,
    ) -> Result<bool, ReadModelError> {
        Ok(self.with_state(|state| {
            match state.history.get_mut(&(tenant_id, merge_event_id)) {
                Some(record) if record.can_undo && !record.undone => {
                    record.undone = true;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn list_merges(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<MergeHistoryRecord>, ReadModelError> {
        Ok(self.with_state(|state| {
            let mut merges: Vec<MergeHistoryRecord> = state
                .history
                .values()
                .filter(|h| h.tenant_id == tenant_id)
                .cloned()
                .collect();
            merges.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            merges.truncate(limit);
            merges
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(tenant_id: TenantId, name: &str, entity_type: &str) -> EntityRecord {
        EntityRecord {
            id: EntityId::new(),
            tenant_id,
            source_page_id: None,
            entity_type: entity_type.to_string(),
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            description: None,
            properties: serde_json::json!({}),
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
    async fn blocking_candidates_respect_tenant_and_exclude_source() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        let source = entity(tenant, "ACME Corp", "ORG");
        let candidate = entity(tenant, "ACME Corporation", "ORG");
        let foreign = entity(TenantId::new(), "ACME Corp", "ORG");

        for e in [&source, &candidate, &foreign] {
            store.upsert_entity(e.clone()).await.unwrap();
        }

        let query = BlockingQuery {
            prefix: Some("acme ".to_string()),
            entity_type: Some("ORG".to_string()),
            soundex: Some(soundex("ACME Corp")),
            trigram_of: Some("acme corp".to_string()),
            exclude_id: Some(source.id),
            limit: 10,
        };

        let hits = store.find_blocking_candidates(tenant, &query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, candidate.id);
    }

    #[tokio::test]
    async fn aliases_are_excluded_from_blocking() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        let canonical = entity(tenant, "ACME Corp", "ORG");
        let mut alias = entity(tenant, "ACME Corporation", "ORG");
        alias.is_canonical = false;
        alias.is_alias_of = Some(canonical.id);

        store.upsert_entity(canonical.clone()).await.unwrap();
        store.upsert_entity(alias).await.unwrap();

        let query = BlockingQuery {
            entity_type: Some("ORG".to_string()),
            exclude_id: Some(canonical.id),
            limit: 10,
            ..Default::default()
        };

        let hits = store.find_blocking_candidates(tenant, &query).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn mark_aliases_and_restore_round_trip() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        let canonical = entity(tenant, "A", "ORG");
        let merged = entity(tenant, "A2", "ORG");
        store.upsert_entity(canonical.clone()).await.unwrap();
        store.upsert_entity(merged.clone()).await.unwrap();

        store
            .mark_aliases(tenant, &[merged.id], canonical.id)
            .await
            .unwrap();
        let row = store.get_entity(tenant, merged.id).await.unwrap().unwrap();
        assert!(!row.is_canonical);
        assert_eq!(row.is_alias_of, Some(canonical.id));

        store.restore_canonical(tenant, &[merged.id]).await.unwrap();
        let row = store.get_entity(tenant, merged.id).await.unwrap().unwrap();
        assert!(row.is_canonical);
        assert_eq!(row.is_alias_of, None);
    }

    #[tokio::test]
    async fn review_upsert_is_keyed_on_pair() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        let a = EntityId::new();
        let b = EntityId::new();

        let mk = |id: Uuid, confidence: f64| ReviewQueueRecord {
            id,
            tenant_id: tenant,
            entity_a_id: a,
            entity_b_id: b,
            confidence,
            review_priority: 50,
            similarity_scores: serde_json::json!({}),
            status: ReviewStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            reviewer_notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let first = Uuid::now_v7();
        store.upsert_pending(mk(first, 0.6)).await.unwrap();
        store.upsert_pending(mk(Uuid::now_v7(), 0.8)).await.unwrap();

        let reviews = store
            .list_reviews(tenant, &ReviewFilters::default())
            .await
            .unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, first);
        assert_eq!(reviews[0].confidence, 0.8);
    }

    #[tokio::test]
    async fn expire_pending_only_touches_pending_rows() {
        let store = InMemoryReadModel::new();
        let tenant = TenantId::new();
        let a = EntityId::new();
        let b = EntityId::new();
        let c = EntityId::new();

        let mk = |x: EntityId, y: EntityId, status: ReviewStatus| ReviewQueueRecord {
            id: Uuid::now_v7(),
            tenant_id: tenant,
            entity_a_id: x,
            entity_b_id: y,
            confidence: 0.7,
            review_priority: 10,
            similarity_scores: serde_json::json!({}),
            status,
            reviewed_by: None,
            reviewed_at: None,
            reviewer_notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        store.upsert_pending(mk(a, b, ReviewStatus::Pending)).await.unwrap();
        store.upsert_pending(mk(a, c, ReviewStatus::Approved)).await.unwrap();

        let expired = store.expire_pending_for(tenant, &[a]).await.unwrap();
        assert_eq!(expired, 1);

        let stats = store.statistics(tenant).await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.approved, 1);
    }
}
