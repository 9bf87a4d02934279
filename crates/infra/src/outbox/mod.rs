//! Transactional outbox.
//!
//! One row per committed event, written in the same transaction as the
//! event. A single-writer publisher drains pending rows to the downstream
//! transport; consumers are idempotent in `event_id`, so delivery is
//! at-least-once.

pub mod in_memory;
pub mod postgres;
pub mod publisher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use kmapper_core::{AggregateId, TenantId};
use kmapper_events::EventEnvelope;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use publisher::{OutboxPublisher, PublisherConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// One outbox row, mirroring its event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub aggregate_version: u64,
    pub global_position: u64,
    pub tenant_id: Option<TenantId>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: OutboxStatus,
}

impl OutboxEntry {
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.aggregate_version,
            self.global_position,
            self.payload.clone(),
        )
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox storage error: {0}")]
    Storage(String),

    #[error("outbox entry {0} not found")]
    NotFound(Uuid),
}

/// Durable buffer for events awaiting publication.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending rows ordered by `created_at` ascending.
    async fn poll(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn mark_published(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Record a failed publication attempt. Once `retry_count` exceeds the
    /// publisher's limit the row is marked permanently failed.
    async fn mark_failed(&self, id: Uuid, error: &str, permanent: bool)
    -> Result<(), OutboxError>;

    async fn pending_count(&self) -> Result<u64, OutboxError>;
}
