//! Postgres-backed event store.
//!
//! Enforces append-only semantics, tenant isolation and optimistic
//! concurrency at the database level. `global_position` is a `BIGSERIAL`
//! assigned at commit, so cross-stream ordering reflects commit order and
//! may contain gaps.
//!
//! ## Error mapping
//!
//! | PostgreSQL error | Constraint | Mapped to |
//! |---|---|---|
//! | `23505` unique violation | `uq_events_event_id` | `DuplicateEvent` |
//! | `23505` unique violation | stream key | `OptimisticLock` |
//! | other database errors | — | `Storage` |
//!
//! The outbox row for every event is inserted inside the append
//! transaction; a committed event without its outbox row cannot exist.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use kmapper_core::{AggregateId, ExpectedVersion, TenantId};

use super::{EventStore, EventStoreError, EventStream, Snapshot, StoredEvent, UncommittedEvent};

#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(aggregate_version), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: Option<i64> = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Storage(format!("failed to read current_version: {e}")))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| EventStoreError::Storage(format!("failed to read aggregate_type: {e}")))?;

    Ok((current_version.unwrap_or(0) as u64, aggregate_type))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => EventStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn unique_violation_constraint(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return Some(db_err.constraint().unwrap_or("").to_string());
        }
    }
    None
}

pub(super) fn stored_event_from_row(
    row: &sqlx::postgres::PgRow,
) -> Result<StoredEvent, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Storage(format!("failed to decode event row: {e}"));

    Ok(StoredEvent {
        event_id: row.try_get("event_id").map_err(decode)?,
        tenant_id: row
            .try_get::<Option<Uuid>, _>("tenant_id")
            .map_err(decode)?
            .map(TenantId::from_uuid),
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(decode)?),
        aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
        aggregate_version: row.try_get::<i64, _>("aggregate_version").map_err(decode)? as u64,
        global_position: row.try_get::<i64, _>("global_position").map_err(decode)? as u64,
        event_type: row.try_get("event_type").map_err(decode)?,
        event_version: row.try_get::<i32, _>("event_version").map_err(decode)? as u32,
        occurred_at: row.try_get("occurred_at").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
    })
}

const SELECT_EVENT_COLUMNS: &str = r#"
    SELECT
        event_id,
        tenant_id,
        aggregate_id,
        aggregate_type,
        aggregate_version,
        global_position,
        event_type,
        event_version,
        occurred_at,
        payload
    FROM events
"#;

#[async_trait::async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, events),
        fields(
            aggregate_id = %aggregate_id,
            aggregate_type,
            event_count = events.len(),
            expected_version = ?expected_version
        ),
        err
    )]
    async fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_type) = check_stream_version(&mut tx, aggregate_id).await?;

        if let Some(existing) = &existing_type {
            if existing != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        if !expected_version.matches(current_version) {
            let expected = match expected_version {
                ExpectedVersion::Exact(v) => v,
                ExpectedVersion::NoStream => 0,
                ExpectedVersion::Any => current_version,
            };
            return Err(EventStoreError::OptimisticLock {
                expected,
                actual: current_version,
            });
        }

        let mut stored_batch = Vec::with_capacity(events.len());
        let mut next_version = current_version + 1;

        for event in events {
            let row = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    tenant_id,
                    aggregate_id,
                    aggregate_type,
                    aggregate_version,
                    event_type,
                    event_version,
                    occurred_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING global_position
                "#,
            )
            .bind(event.event_id)
            .bind(event.tenant_id.map(|t| *t.as_uuid()))
            .bind(aggregate_id.as_uuid())
            .bind(aggregate_type)
            .bind(next_version as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match unique_violation_constraint(&e) {
                Some(constraint) if constraint.contains("event_id") => {
                    EventStoreError::DuplicateEvent(event.event_id)
                }
                Some(_) => EventStoreError::OptimisticLock {
                    expected: next_version - 1,
                    actual: next_version,
                },
                None => map_sqlx_error("insert_event", e),
            })?;

            let global_position = row
                .try_get::<i64, _>("global_position")
                .map_err(|e| EventStoreError::Storage(format!("failed to read global_position: {e}")))?
                as u64;

            // Outbox row in the same transaction (invariant: a committed
            // event without an outbox row is a bug).
            sqlx::query(
                r#"
                INSERT INTO event_outbox (
                    id,
                    event_id,
                    event_type,
                    aggregate_id,
                    aggregate_type,
                    aggregate_version,
                    global_position,
                    tenant_id,
                    payload,
                    status
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
                "#,
            )
            .bind(event.event_id)
            .bind(event.event_id)
            .bind(&event.event_type)
            .bind(aggregate_id.as_uuid())
            .bind(aggregate_type)
            .bind(next_version as i64)
            .bind(global_position as i64)
            .bind(event.tenant_id.map(|t| *t.as_uuid()))
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_outbox", e))?;

            stored_batch.push(StoredEvent {
                event_id: event.event_id,
                tenant_id: event.tenant_id,
                aggregate_id,
                aggregate_type: aggregate_type.to_string(),
                aggregate_version: next_version,
                global_position,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload,
            });
            next_version += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored_batch)
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn load(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<EventStream, EventStoreError> {
        let sql = format!(
            "{SELECT_EVENT_COLUMNS} WHERE aggregate_id = $1 AND aggregate_type = $2 ORDER BY aggregate_version ASC"
        );

        let rows = sqlx::query(&sql)
            .bind(aggregate_id.as_uuid())
            .bind(aggregate_type)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_stream", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(stored_event_from_row(row)?);
        }

        let version = events.len() as u64;
        Ok(EventStream { events, version })
    }

    async fn event_exists(&self, event_id: Uuid) -> Result<bool, EventStoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM events WHERE event_id = $1) AS present")
            .bind(event_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("event_exists", e))?;

        row.try_get("present")
            .map_err(|e| EventStoreError::Storage(format!("failed to read existence flag: {e}")))
    }

    async fn read_from(
        &self,
        after_global_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let sql = format!(
            "{SELECT_EVENT_COLUMNS} WHERE global_position > $1 ORDER BY global_position ASC LIMIT $2"
        );

        let rows = sqlx::query(&sql)
            .bind(after_global_position as i64)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_from", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(stored_event_from_row(row)?);
        }
        Ok(events)
    }

    async fn load_snapshot(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, state, created_at
            FROM snapshots
            WHERE aggregate_id = $1 AND aggregate_type = $2
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(aggregate_type)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode =
            |e: sqlx::Error| EventStoreError::Storage(format!("failed to decode snapshot row: {e}"));

        Ok(Some(Snapshot {
            aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(decode)?),
            aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
            version: row.try_get::<i64, _>("version").map_err(decode)? as u64,
            state: row.try_get("state").map_err(decode)?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        }))
    }

    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, version, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id, aggregate_type, version)
            DO UPDATE SET state = EXCLUDED.state, created_at = NOW()
            "#,
        )
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version as i64)
        .bind(&snapshot.state)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_snapshot", e))?;

        Ok(())
    }
}
