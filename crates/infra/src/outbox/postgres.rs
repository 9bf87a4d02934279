//! Postgres-backed outbox store.
//!
//! Rows are inserted by the event store inside the append transaction;
//! this store only polls and marks. A partial index on `status = 'pending'`
//! keeps the poll cheap.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use kmapper_core::{AggregateId, TenantId};

use super::{OutboxEntry, OutboxError, OutboxStatus, OutboxStore};

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, OutboxError> {
    let decode = |e: sqlx::Error| OutboxError::Storage(format!("failed to decode outbox row: {e}"));

    let status_raw: String = row.try_get("status").map_err(decode)?;
    let status = OutboxStatus::parse(&status_raw)
        .ok_or_else(|| OutboxError::Storage(format!("unknown outbox status '{status_raw}'")))?;

    Ok(OutboxEntry {
        id: row.try_get("id").map_err(decode)?,
        event_id: row.try_get("event_id").map_err(decode)?,
        event_type: row.try_get("event_type").map_err(decode)?,
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(decode)?),
        aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
        aggregate_version: row.try_get::<i64, _>("aggregate_version").map_err(decode)? as u64,
        global_position: row.try_get::<i64, _>("global_position").map_err(decode)? as u64,
        tenant_id: row
            .try_get::<Option<Uuid>, _>("tenant_id")
            .map_err(decode)?
            .map(TenantId::from_uuid),
        payload: row.try_get("payload").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        published_at: row.try_get("published_at").map_err(decode)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(decode)? as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        status,
    })
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn poll(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, event_id, event_type, aggregate_id, aggregate_type,
                aggregate_version, global_position, tenant_id, payload,
                created_at, published_at, retry_count, last_error, status
            FROM event_outbox
            WHERE status = 'pending'
            ORDER BY created_at ASC, global_position ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'published', published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        permanent: bool,
    ) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET retry_count = retry_count + 1,
                last_error = $2,
                status = CASE WHEN $3 THEN 'failed' ELSE status END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(permanent)
        .execute(&*self.pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, OutboxError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM event_outbox WHERE status = 'pending'")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;

        let n: i64 = row
            .try_get("n")
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(n as u64)
    }
}
