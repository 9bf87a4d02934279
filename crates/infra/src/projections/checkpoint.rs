//! Projection checkpoints: one row per projection, advancing monotonically
//! in `global_position`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionCheckpoint {
    pub projection_name: String,
    pub last_global_position: u64,
    pub last_event_id: Option<Uuid>,
    pub events_processed: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(
        &self,
        projection_name: &str,
    ) -> Result<Option<ProjectionCheckpoint>, CheckpointError>;

    /// Move the checkpoint forward. Positions never move backwards; a stale
    /// advance is a no-op.
    async fn advance(
        &self,
        projection_name: &str,
        global_position: u64,
        event_id: Uuid,
    ) -> Result<(), CheckpointError>;

    /// Drop the checkpoint (projection rebuild).
    async fn reset(&self, projection_name: &str) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, ProjectionCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(
        &self,
        projection_name: &str,
    ) -> Result<Option<ProjectionCheckpoint>, CheckpointError> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        Ok(checkpoints.get(projection_name).cloned())
    }

    async fn advance(
        &self,
        projection_name: &str,
        global_position: u64,
        event_id: Uuid,
    ) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let entry = checkpoints
            .entry(projection_name.to_string())
            .or_insert_with(|| ProjectionCheckpoint {
                projection_name: projection_name.to_string(),
                last_global_position: 0,
                last_event_id: None,
                events_processed: 0,
                updated_at: Utc::now(),
            });

        if global_position > entry.last_global_position {
            entry.last_global_position = global_position;
            entry.last_event_id = Some(event_id);
            entry.events_processed += 1;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset(&self, projection_name: &str) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        checkpoints.remove(projection_name);
        Ok(())
    }
}

/// Postgres-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn get(
        &self,
        projection_name: &str,
    ) -> Result<Option<ProjectionCheckpoint>, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT projection_name, global_position, last_event_id,
                   events_processed, updated_at
            FROM projection_checkpoints
            WHERE projection_name = $1
            "#,
        )
        .bind(projection_name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |e: sqlx::Error| CheckpointError::Storage(e.to_string());
        Ok(Some(ProjectionCheckpoint {
            projection_name: row.try_get("projection_name").map_err(decode)?,
            last_global_position: row.try_get::<i64, _>("global_position").map_err(decode)? as u64,
            last_event_id: row.try_get("last_event_id").map_err(decode)?,
            events_processed: row.try_get::<i64, _>("events_processed").map_err(decode)? as u64,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        }))
    }

    async fn advance(
        &self,
        projection_name: &str,
        global_position: u64,
        event_id: Uuid,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (
                projection_name, global_position, last_event_id, events_processed
            )
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (projection_name) DO UPDATE SET
                global_position = GREATEST(projection_checkpoints.global_position, EXCLUDED.global_position),
                last_event_id = CASE
                    WHEN EXCLUDED.global_position > projection_checkpoints.global_position
                    THEN EXCLUDED.last_event_id
                    ELSE projection_checkpoints.last_event_id
                END,
                events_processed = projection_checkpoints.events_processed + 1,
                updated_at = NOW()
            "#,
        )
        .bind(projection_name)
        .bind(global_position as i64)
        .bind(event_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn reset(&self, projection_name: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM projection_checkpoints WHERE projection_name = $1")
            .bind(projection_name)
            .execute(&*self.pool)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(())
    }
}
