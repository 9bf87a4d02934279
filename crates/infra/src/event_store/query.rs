//! Read-side event queries (audit browsing, debugging).
//!
//! Separate from the replay path: filtered and paginated, always
//! tenant-scoped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use kmapper_core::{AggregateId, TenantId};

use super::postgres::PostgresEventStore;
use super::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent};

/// Optional filters; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub aggregate_id: Option<AggregateId>,
    pub aggregate_type: Option<String>,
    pub event_type: Option<String>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventQueryResult {
    pub events: Vec<StoredEvent>,
    pub total: u64,
    pub has_more: bool,
}

/// Tenant-scoped event browsing.
#[async_trait]
pub trait EventQuery: Send + Sync {
    async fn query_events(
        &self,
        tenant_id: TenantId,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError>;

    async fn get_event_by_id(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
    ) -> Result<Option<StoredEvent>, EventStoreError>;
}

fn matches(event: &StoredEvent, tenant_id: TenantId, filter: &EventFilter) -> bool {
    event.tenant_id == Some(tenant_id)
        && filter.aggregate_id.is_none_or(|id| event.aggregate_id == id)
        && filter
            .aggregate_type
            .as_deref()
            .is_none_or(|t| event.aggregate_type == t)
        && filter
            .event_type
            .as_deref()
            .is_none_or(|t| event.event_type == t)
        && filter.occurred_after.is_none_or(|t| event.occurred_at >= t)
        && filter.occurred_before.is_none_or(|t| event.occurred_at <= t)
}

#[async_trait]
impl EventQuery for InMemoryEventStore {
    async fn query_events(
        &self,
        tenant_id: TenantId,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        // The in-memory log is small by construction; a scan is fine.
        let all = self.read_from(0, usize::MAX).await?;
        let hits: Vec<StoredEvent> = all
            .into_iter()
            .filter(|e| matches(e, tenant_id, &filter))
            .collect();

        let total = hits.len() as u64;
        let events: Vec<StoredEvent> = hits
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect();
        let has_more = total > (pagination.offset + pagination.limit) as u64;

        Ok(EventQueryResult {
            events,
            total,
            has_more,
        })
    }

    async fn get_event_by_id(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        let all = self.read_from(0, usize::MAX).await?;
        Ok(all
            .into_iter()
            .find(|e| e.event_id == event_id && e.tenant_id == Some(tenant_id)))
    }
}

#[async_trait]
impl EventQuery for PostgresEventStore {
    async fn query_events(
        &self,
        tenant_id: TenantId,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        let aggregate_id = filter.aggregate_id.map(|id| *id.as_uuid());

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM events
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR aggregate_id = $2)
              AND ($3::text IS NULL OR aggregate_type = $3)
              AND ($4::text IS NULL OR event_type = $4)
              AND ($5::timestamptz IS NULL OR occurred_at >= $5)
              AND ($6::timestamptz IS NULL OR occurred_at <= $6)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id)
        .bind(filter.aggregate_type.as_deref())
        .bind(filter.event_type.as_deref())
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
        .fetch_one(self.pool())
        .await
        .map_err(|e| EventStoreError::Storage(e.to_string()))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| EventStoreError::Storage(e.to_string()))?;

        let rows = sqlx::query(
            r#"
            SELECT
                event_id, tenant_id, aggregate_id, aggregate_type,
                aggregate_version, global_position, event_type,
                event_version, occurred_at, payload
            FROM events
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR aggregate_id = $2)
              AND ($3::text IS NULL OR aggregate_type = $3)
              AND ($4::text IS NULL OR event_type = $4)
              AND ($5::timestamptz IS NULL OR occurred_at >= $5)
              AND ($6::timestamptz IS NULL OR occurred_at <= $6)
            ORDER BY global_position ASC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id)
        .bind(filter.aggregate_type.as_deref())
        .bind(filter.event_type.as_deref())
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| EventStoreError::Storage(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(super::postgres::stored_event_from_row(row)?);
        }

        let has_more = total > (pagination.offset + pagination.limit) as i64;
        Ok(EventQueryResult {
            events,
            total: total as u64,
            has_more,
        })
    }

    async fn get_event_by_id(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                event_id, tenant_id, aggregate_id, aggregate_type,
                aggregate_version, global_position, event_type,
                event_version, occurred_at, payload
            FROM events
            WHERE tenant_id = $1 AND event_id = $2
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(event_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| EventStoreError::Storage(e.to_string()))?;

        row.as_ref()
            .map(super::postgres::stored_event_from_row)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmapper_core::ExpectedVersion;

    use crate::event_store::{EventStore, UncommittedEvent};

    fn event(tenant: TenantId, event_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id: Some(tenant),
            event_type: event_type.to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn queries_are_tenant_scoped_and_filtered() {
        let store = InMemoryEventStore::new();
        let tenant = TenantId::new();
        let other = TenantId::new();

        store
            .append(
                AggregateId::new(),
                "extraction_process",
                vec![event(tenant, "extraction.process.requested"), event(tenant, "extraction.process.started")],
                ExpectedVersion::Any,
            )
            .await
            .unwrap();
        store
            .append(
                AggregateId::new(),
                "extraction_process",
                vec![event(other, "extraction.process.requested")],
                ExpectedVersion::Any,
            )
            .await
            .unwrap();

        let result = store
            .query_events(tenant, EventFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(result.total, 2);

        let filtered = store
            .query_events(
                tenant,
                EventFilter {
                    event_type: Some("extraction.process.started".to_string()),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(filtered.total, 1);
    }

    #[tokio::test]
    async fn pagination_reports_has_more() {
        let store = InMemoryEventStore::new();
        let tenant = TenantId::new();
        let id = AggregateId::new();

        for _ in 0..3 {
            store
                .append(id, "x", vec![event(tenant, "e")], ExpectedVersion::Any)
                .await
                .unwrap();
        }

        let page = store
            .query_events(
                tenant,
                EventFilter::default(),
                Pagination { limit: 2, offset: 0 },
            )
            .await
            .unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.has_more);

        let rest = store
            .query_events(
                tenant,
                EventFilter::default(),
                Pagination { limit: 2, offset: 2 },
            )
            .await
            .unwrap();
        assert_eq!(rest.events.len(), 1);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn get_event_by_id_respects_tenant() {
        let store = InMemoryEventStore::new();
        let tenant = TenantId::new();
        let e = event(tenant, "e");
        let event_id = e.event_id;

        store
            .append(AggregateId::new(), "x", vec![e], ExpectedVersion::Any)
            .await
            .unwrap();

        assert!(store.get_event_by_id(tenant, event_id).await.unwrap().is_some());
        assert!(
            store
                .get_event_by_id(TenantId::new(), event_id)
                .await
                .unwrap()
                .is_none()
        );
    }
}
