//! Append-only event store with per-aggregate optimistic locking.
//!
//! The store is a pure log: streams keyed by `(aggregate_id,
//! aggregate_type)` with dense 1-based `aggregate_version`s, plus a
//! commit-ordered `global_position` across all streams for projection
//! replay. The outbox row for each event is written in the same
//! transaction as the event itself.

pub mod in_memory;
pub mod postgres;
pub mod query;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use kmapper_core::{AggregateId, ExpectedVersion, TenantId};
use kmapper_events::EventEnvelope;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{EventFilter, EventQuery, EventQueryResult, Pagination};

/// An event ready to be appended (not yet assigned stream or global
/// positions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: Option<TenantId>,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Build from a typed domain event, capturing its metadata.
    pub fn from_typed<E>(
        event_id: Uuid,
        tenant_id: Option<TenantId>,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: kmapper_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            tenant_id,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// A committed event with stream and global positions assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: Option<TenantId>,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    /// 1-based, dense per stream.
    pub aggregate_version: u64,
    /// Strictly increasing across streams; may contain gaps.
    pub global_position: u64,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl StoredEvent {
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

/// A loaded stream: all events for one aggregate in version order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventStream {
    pub events: Vec<StoredEvent>,
    /// Equals the count of events (0 for an absent stream).
    pub version: u64,
}

/// Aggregate snapshot for fast rehydration.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: u64,
    pub state: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Stream version did not match the expectation. Retry by reloading the
    /// aggregate and re-emitting fresh events.
    #[error("optimistic lock failed: expected version {expected}, actual {actual}")]
    OptimisticLock { expected: u64, actual: u64 },

    /// An `event_id` in the batch already exists (idempotent retry is the
    /// caller's concern).
    #[error("duplicate event {0}")]
    DuplicateEvent(Uuid),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Append-only event store.
///
/// Appends are serializable within a stream (the unique key on
/// `(aggregate_id, aggregate_type, aggregate_version)` enforces it);
/// readers never block. Every implementation writes the outbox row for
/// each event in the same transaction as the event.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch atomically, assigning versions `current + 1 ..`.
    async fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load a full stream in `aggregate_version` order. An absent stream is
    /// an empty `EventStream` with version 0.
    async fn load(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<EventStream, EventStoreError>;

    async fn event_exists(&self, event_id: Uuid) -> Result<bool, EventStoreError>;

    /// Events with `global_position > after`, ordered ascending; the
    /// projection runtime's read primitive.
    async fn read_from(
        &self,
        after_global_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn load_snapshot(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, EventStoreError>;

    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> EventStore for std::sync::Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self)
            .append(aggregate_id, aggregate_type, events, expected_version)
            .await
    }

    async fn load(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<EventStream, EventStoreError> {
        (**self).load(aggregate_id, aggregate_type).await
    }

    async fn event_exists(&self, event_id: Uuid) -> Result<bool, EventStoreError> {
        (**self).event_exists(event_id).await
    }

    async fn read_from(
        &self,
        after_global_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read_from(after_global_position, limit).await
    }

    async fn load_snapshot(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        (**self).load_snapshot(aggregate_id, aggregate_type).await
    }

    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError> {
        (**self).store_snapshot(snapshot).await
    }
}
