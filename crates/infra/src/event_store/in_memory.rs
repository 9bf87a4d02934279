//! In-memory event store for tests and development.
//!
//! Mirrors the postgres implementation's semantics: optimistic locking on
//! the stream version, duplicate `event_id` detection, monotonically
//! increasing global positions assigned at "commit", and outbox rows
//! recorded together with the events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use kmapper_core::{AggregateId, ExpectedVersion};

use crate::outbox::{InMemoryOutboxStore, OutboxEntry, OutboxStatus};

use super::{EventStore, EventStoreError, EventStream, Snapshot, StoredEvent, UncommittedEvent};

#[derive(Debug, Default)]
struct StoreState {
    /// All events in commit order.
    log: Vec<StoredEvent>,
    /// (aggregate_id, aggregate_type) → indexes into `log`.
    streams: HashMap<(AggregateId, String), Vec<usize>>,
    /// aggregate_id → aggregate_type, for type-mismatch detection.
    stream_types: HashMap<AggregateId, String>,
    event_ids: HashMap<Uuid, usize>,
    snapshots: HashMap<(AggregateId, String), Snapshot>,
    next_position: u64,
}

/// Process-local event store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: Mutex<StoreState>,
    outbox: Option<Arc<InMemoryOutboxStore>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an outbox; every appended event then gets a pending outbox
    /// entry recorded atomically with the append.
    pub fn with_outbox(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            outbox: Some(outbox),
        }
    }

    /// Total number of committed events (tests).
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
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

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing_type) = state.stream_types.get(&aggregate_id) {
            if existing_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing_type}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        let key = (aggregate_id, aggregate_type.to_string());
        let current_version = state.streams.get(&key).map_or(0, |s| s.len() as u64);

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

        for event in &events {
            if state.event_ids.contains_key(&event.event_id) {
                return Err(EventStoreError::DuplicateEvent(event.event_id));
            }
        }

        let mut stored_batch = Vec::with_capacity(events.len());
        let mut next_version = current_version + 1;

        for event in events {
            state.next_position += 1;
            let stored = StoredEvent {
                event_id: event.event_id,
                tenant_id: event.tenant_id,
                aggregate_id,
                aggregate_type: aggregate_type.to_string(),
                aggregate_version: next_version,
                global_position: state.next_position,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload,
            };

            let index = state.log.len();
            state.event_ids.insert(stored.event_id, index);
            state.streams.entry(key.clone()).or_default().push(index);
            state.log.push(stored.clone());
            stored_batch.push(stored);
            next_version += 1;
        }

        state
            .stream_types
            .insert(aggregate_id, aggregate_type.to_string());

        // Same-"transaction" outbox write: still under the state lock, so a
        // committed event is never observable without its outbox row.
        if let Some(outbox) = &self.outbox {
            for stored in &stored_batch {
                outbox.insert_sync(OutboxEntry {
                    id: stored.event_id,
                    event_id: stored.event_id,
                    event_type: stored.event_type.clone(),
                    aggregate_id: stored.aggregate_id,
                    aggregate_type: stored.aggregate_type.clone(),
                    aggregate_version: stored.aggregate_version,
                    global_position: stored.global_position,
                    tenant_id: stored.tenant_id,
                    payload: stored.payload.clone(),
                    created_at: Utc::now(),
                    published_at: None,
                    retry_count: 0,
                    last_error: None,
                    status: OutboxStatus::Pending,
                });
            }
        }

        Ok(stored_batch)
    }

    async fn load(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<EventStream, EventStoreError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = (aggregate_id, aggregate_type.to_string());

        let events: Vec<StoredEvent> = state
            .streams
            .get(&key)
            .map(|indexes| indexes.iter().map(|&i| state.log[i].clone()).collect())
            .unwrap_or_default();

        let version = events.len() as u64;
        Ok(EventStream { events, version })
    }

    async fn event_exists(&self, event_id: Uuid) -> Result<bool, EventStoreError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.event_ids.contains_key(&event_id))
    }

    async fn read_from(
        &self,
        after_global_position: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .log
            .iter()
            .filter(|e| e.global_position > after_global_position)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_snapshot(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .snapshots
            .get(&(aggregate_id, aggregate_type.to_string()))
            .cloned())
    }

    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.snapshots.insert(
            (snapshot.aggregate_id, snapshot.aggregate_type.clone()),
            snapshot.clone(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxStore;
    use serde_json::json;

    fn event(event_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id: None,
            event_type: event_type.to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({"k": event_type}),
        }
    }

    #[tokio::test]
    async fn append_assigns_dense_versions() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let stored = store
            .append(id, "extraction", vec![event("a"), event("b")], ExpectedVersion::NoStream)
            .await
            .unwrap();

        assert_eq!(stored[0].aggregate_version, 1);
        assert_eq!(stored[1].aggregate_version, 2);

        let stream = store.load(id, "extraction").await.unwrap();
        assert_eq!(stream.version, 2);
    }

    #[tokio::test]
    async fn optimistic_lock_rejects_stale_appends() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(id, "extraction", vec![event("a")], ExpectedVersion::NoStream)
            .await
            .unwrap();

        let err = store
            .append(id, "extraction", vec![event("b")], ExpectedVersion::Exact(0))
            .await
            .unwrap_err();

        match err {
            EventStoreError::OptimisticLock { expected, actual } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected OptimisticLock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_rejected() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let e = event("a");

        store
            .append(id, "extraction", vec![e.clone()], ExpectedVersion::Any)
            .await
            .unwrap();

        let err = store
            .append(id, "extraction", vec![e], ExpectedVersion::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::DuplicateEvent(_)));
    }

    #[tokio::test]
    async fn global_positions_increase_across_streams() {
        let store = InMemoryEventStore::new();

        store
            .append(AggregateId::new(), "extraction", vec![event("a")], ExpectedVersion::Any)
            .await
            .unwrap();
        store
            .append(AggregateId::new(), "consolidation", vec![event("b")], ExpectedVersion::Any)
            .await
            .unwrap();

        let all = store.read_from(0, 100).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].global_position < all[1].global_position);
    }

    #[tokio::test]
    async fn read_from_is_exclusive_of_position() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(id, "extraction", vec![event("a"), event("b"), event("c")], ExpectedVersion::Any)
            .await
            .unwrap();

        let all = store.read_from(0, 100).await.unwrap();
        let rest = store.read_from(all[0].global_position, 100).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn aggregate_type_mismatch_is_rejected() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(id, "extraction", vec![event("a")], ExpectedVersion::Any)
            .await
            .unwrap();

        let err = store
            .append(id, "consolidation", vec![event("b")], ExpectedVersion::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }

    #[tokio::test]
    async fn outbox_rows_are_written_with_events() {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = InMemoryEventStore::with_outbox(outbox.clone());

        store
            .append(AggregateId::new(), "extraction", vec![event("a"), event("b")], ExpectedVersion::Any)
            .await
            .unwrap();

        let pending = outbox.poll(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|e| e.status == OutboxStatus::Pending));
    }

    #[tokio::test]
    async fn snapshots_round_trip() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let snapshot = Snapshot {
            aggregate_id: id,
            aggregate_type: "extraction".to_string(),
            version: 5,
            state: json!({"phase": "in_progress"}),
            created_at: Utc::now(),
        };

        store.store_snapshot(&snapshot).await.unwrap();
        let loaded = store.load_snapshot(id, "extraction").await.unwrap().unwrap();
        assert_eq!(loaded.version, 5);
    }
}
