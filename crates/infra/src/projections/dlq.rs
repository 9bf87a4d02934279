//! Dead-letter queue for events whose handler exhausted retries.
//!
//! Unique on `(event_id, projection_name)`: redelivery of a poison event
//! updates the existing entry instead of duplicating it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::event_store::StoredEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    Failed,
    Retrying,
    Resolved,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Failed => "failed",
            DeadLetterStatus::Retrying => "retrying",
            DeadLetterStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "failed" => Some(DeadLetterStatus::Failed),
            "retrying" => Some(DeadLetterStatus::Retrying),
            "resolved" => Some(DeadLetterStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub projection_name: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: JsonValue,
    pub error_message: String,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead letter storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Record a failed event (upsert on `(event_id, projection_name)`).
    async fn record(
        &self,
        projection_name: &str,
        event: &StoredEvent,
        error_message: &str,
        retry_count: u32,
    ) -> Result<(), DeadLetterError>;

    async fn list(
        &self,
        projection_name: &str,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    /// Mark an entry resolved after operator intervention.
    async fn resolve(
        &self,
        projection_name: &str,
        event_id: Uuid,
        resolved_by: &str,
    ) -> Result<bool, DeadLetterError>;
}

/// In-memory DLQ for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<HashMap<(Uuid, String), DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(
        &self,
        projection_name: &str,
        event: &StoredEvent,
        error_message: &str,
        retry_count: u32,
    ) -> Result<(), DeadLetterError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = (event.event_id, projection_name.to_string());
        let now = Utc::now();

        entries
            .entry(key)
            .and_modify(|entry| {
                entry.error_message = error_message.to_string();
                entry.retry_count += 1;
                entry.last_failed_at = now;
                entry.status = DeadLetterStatus::Failed;
            })
            .or_insert_with(|| DeadLetterEntry {
                projection_name: projection_name.to_string(),
                event_id: event.event_id,
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
                error_message: error_message.to_string(),
                retry_count,
                first_failed_at: now,
                last_failed_at: now,
                status: DeadLetterStatus::Failed,
                resolved_by: None,
            });
        Ok(())
    }

    async fn list(
        &self,
        projection_name: &str,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<DeadLetterEntry> = entries
            .values()
            .filter(|e| e.projection_name == projection_name)
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.first_failed_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn resolve(
        &self,
        projection_name: &str,
        event_id: Uuid,
        resolved_by: &str,
    ) -> Result<bool, DeadLetterError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(&(event_id, projection_name.to_string())) {
            Some(entry) => {
                entry.status = DeadLetterStatus::Resolved;
                entry.resolved_by = Some(resolved_by.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Postgres-backed DLQ.
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: Arc<PgPool>,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn record(
        &self,
        projection_name: &str,
        event: &StoredEvent,
        error_message: &str,
        retry_count: u32,
    ) -> Result<(), DeadLetterError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (
                event_id, projection_name, event_type, payload,
                error_message, retry_count, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'failed')
            ON CONFLICT (event_id, projection_name) DO UPDATE SET
                error_message = EXCLUDED.error_message,
                retry_count = dead_letter_queue.retry_count + 1,
                last_failed_at = NOW(),
                status = 'failed'
            "#,
        )
        .bind(event.event_id)
        .bind(projection_name)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(error_message)
        .bind(retry_count as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn list(
        &self,
        projection_name: &str,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let rows = sqlx::query(
            r#"
            SELECT projection_name, event_id, event_type, payload,
                   error_message, retry_count, first_failed_at,
                   last_failed_at, status, resolved_by
            FROM dead_letter_queue
            WHERE projection_name = $1
              AND ($2::text IS NULL OR status = $2)
            ORDER BY first_failed_at ASC
            LIMIT $3
            "#,
        )
        .bind(projection_name)
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        let decode = |e: sqlx::Error| DeadLetterError::Storage(e.to_string());
        rows.iter()
            .map(|row| {
                let status_raw: String = row.try_get("status").map_err(decode)?;
                let status = DeadLetterStatus::parse(&status_raw).ok_or_else(|| {
                    DeadLetterError::Storage(format!("unknown dlq status '{status_raw}'"))
                })?;
                Ok(DeadLetterEntry {
                    projection_name: row.try_get("projection_name").map_err(decode)?,
                    event_id: row.try_get("event_id").map_err(decode)?,
                    event_type: row.try_get("event_type").map_err(decode)?,
                    payload: row.try_get("payload").map_err(decode)?,
                    error_message: row.try_get("error_message").map_err(decode)?,
                    retry_count: row.try_get::<i32, _>("retry_count").map_err(decode)? as u32,
                    first_failed_at: row.try_get("first_failed_at").map_err(decode)?,
                    last_failed_at: row.try_get("last_failed_at").map_err(decode)?,
                    status,
                    resolved_by: row.try_get("resolved_by").map_err(decode)?,
                })
            })
            .collect()
    }

    async fn resolve(
        &self,
        projection_name: &str,
        event_id: Uuid,
        resolved_by: &str,
    ) -> Result<bool, DeadLetterError> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_queue
            SET status = 'resolved', resolved_at = NOW(), resolved_by = $3
            WHERE event_id = $1 AND projection_name = $2
            "#,
        )
        .bind(event_id)
        .bind(projection_name)
        .bind(resolved_by)
        .execute(&*self.pool)
        .await
        .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmapper_core::AggregateId;

    fn stored(event_type: &str) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::now_v7(),
            tenant_id: None,
            aggregate_id: AggregateId::new(),
            aggregate_type: "x".to_string(),
            aggregate_version: 1,
            global_position: 1,
            event_type: event_type.to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn record_is_unique_per_event_and_projection() {
        let store = InMemoryDeadLetterStore::new();
        let event = stored("poison");

        store.record("p", &event, "first", 3).await.unwrap();
        store.record("p", &event, "second", 3).await.unwrap();
        store.record("q", &event, "other projection", 3).await.unwrap();

        let p_entries = store.list("p", None, 10).await.unwrap();
        assert_eq!(p_entries.len(), 1);
        assert_eq!(p_entries[0].error_message, "second");
        assert_eq!(p_entries[0].retry_count, 4);

        assert_eq!(store.list("q", None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolve_marks_entry() {
        let store = InMemoryDeadLetterStore::new();
        let event = stored("poison");
        store.record("p", &event, "err", 1).await.unwrap();

        assert!(store.resolve("p", event.event_id, "operator").await.unwrap());

        let resolved = store
            .list("p", Some(DeadLetterStatus::Resolved), 10)
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolved_by.as_deref(), Some("operator"));
    }
}
