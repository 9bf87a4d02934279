//! Aggregate repository: load streams, replay state, save new events.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use kmapper_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ExpectedVersion, TenantId};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Glue between a domain aggregate and the event store.
pub trait EventSourced: Aggregate<Error = DomainError> + AggregateRoot + Send + Sync
where
    Self::Event: kmapper_events::Event + Serialize + DeserializeOwned,
{
    /// Stream type discriminator (e.g. "extraction_process").
    const AGGREGATE_TYPE: &'static str;

    /// Fresh zero-version instance for rehydration.
    fn new_empty(id: AggregateId) -> Self;

    /// Tenant carried by an event (`None` only for tenant-global events).
    fn event_tenant(event: &Self::Event) -> Option<TenantId>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("aggregate {0} not found")]
    AggregateNotFound(AggregateId),

    /// Replay hit an event this aggregate cannot decode. Unknown events are
    /// never skipped silently, that would desynchronize state.
    #[error("unknown or undecodable event '{event_type}' at version {version}: {message}")]
    UnknownEvent {
        event_type: String,
        version: u64,
        message: String,
    },

    #[error("event serialization failed: {0}")]
    Serialize(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// An aggregate plus its uncommitted events.
///
/// Commands validate and emit through the aggregate, then apply locally so
/// later commands in the same unit of work observe the new state. Nothing
/// persists until `AggregateRepository::save`.
#[derive(Debug)]
pub struct AggregateContext<A>
where
    A: EventSourced,
    A::Event: kmapper_events::Event + Serialize + DeserializeOwned,
{
    aggregate_id: AggregateId,
    aggregate: A,
    uncommitted: Vec<A::Event>,
}

impl<A> AggregateContext<A>
where
    A: EventSourced,
    A::Event: kmapper_events::Event + Serialize + DeserializeOwned,
{
    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate(&self) -> &A {
        &self.aggregate
    }

    pub fn version(&self) -> u64 {
        self.aggregate.version()
    }

    pub fn uncommitted_events(&self) -> &[A::Event] {
        &self.uncommitted
    }

    /// Run a command: validate, emit, apply.
    ///
    /// A command that violates an invariant fails before any event is
    /// emitted, leaving the context untouched.
    pub fn execute(&mut self, command: &A::Command) -> Result<&[A::Event], DomainError> {
        let events = self.aggregate.handle(command)?;
        let start = self.uncommitted.len();
        for event in &events {
            self.aggregate.apply(event);
        }
        self.uncommitted.extend(events);
        Ok(&self.uncommitted[start..])
    }
}

/// Loads, replays and saves one aggregate type.
pub struct AggregateRepository<A, S> {
    store: S,
    _marker: PhantomData<fn() -> A>,
}

impl<A, S> AggregateRepository<A, S>
where
    A: EventSourced,
    A::Event: kmapper_events::Event + Serialize + DeserializeOwned,
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Load an existing aggregate; absent streams are an error.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE), err)]
    pub async fn load(&self, id: AggregateId) -> Result<AggregateContext<A>, RepositoryError> {
        let context = self.load_or_create(id).await?;
        if context.version() == 0 {
            return Err(RepositoryError::AggregateNotFound(id));
        }
        Ok(context)
    }

    /// Load an aggregate, returning a zero-version instance when the stream
    /// does not exist yet.
    pub async fn load_or_create(
        &self,
        id: AggregateId,
    ) -> Result<AggregateContext<A>, RepositoryError> {
        let stream = self.store.load(id, A::AGGREGATE_TYPE).await?;

        let mut aggregate = A::new_empty(id);
        for stored in &stream.events {
            let event = decode_event::<A>(stored)?;
            aggregate.apply(&event);
        }

        Ok(AggregateContext {
            aggregate_id: id,
            aggregate,
            uncommitted: Vec::new(),
        })
    }

    pub async fn exists(&self, id: AggregateId) -> Result<bool, RepositoryError> {
        Ok(self.get_version(id).await? > 0)
    }

    pub async fn get_version(&self, id: AggregateId) -> Result<u64, RepositoryError> {
        let stream = self.store.load(id, A::AGGREGATE_TYPE).await?;
        Ok(stream.version)
    }

    /// Append the context's uncommitted events with
    /// `expected = version - uncommitted.len()`.
    ///
    /// On success the context is clean (no uncommitted events) and its
    /// version already reflects the appended batch. On `OptimisticLock` the
    /// caller must reload and re-execute; retrying the same batch would
    /// replay stale decisions.
    #[instrument(skip(self, context), fields(aggregate_id = %context.aggregate_id()), err)]
    pub async fn save(
        &self,
        context: &mut AggregateContext<A>,
    ) -> Result<Vec<StoredEvent>, RepositoryError> {
        if context.uncommitted.is_empty() {
            return Ok(vec![]);
        }

        let expected = context.version() - context.uncommitted.len() as u64;

        let mut batch = Vec::with_capacity(context.uncommitted.len());
        for event in &context.uncommitted {
            batch.push(
                UncommittedEvent::from_typed(Uuid::now_v7(), A::event_tenant(event), event)
                    .map_err(|e| RepositoryError::Serialize(e.to_string()))?,
            );
        }

        let stored = self
            .store
            .append(
                context.aggregate_id,
                A::AGGREGATE_TYPE,
                batch,
                ExpectedVersion::Exact(expected),
            )
            .await?;

        context.uncommitted.clear();
        Ok(stored)
    }
}

fn decode_event<A>(stored: &StoredEvent) -> Result<A::Event, RepositoryError>
where
    A: EventSourced,
    A::Event: kmapper_events::Event + Serialize + DeserializeOwned,
{
    serde_json::from_value(stored.payload.clone()).map_err(|e| RepositoryError::UnknownEvent {
        event_type: stored.event_type.clone(),
        version: stored.aggregate_version,
        message: e.to_string(),
    })
}

impl EventSourced for kmapper_extraction::ExtractionProcess {
    const AGGREGATE_TYPE: &'static str = "extraction_process";

    fn new_empty(id: AggregateId) -> Self {
        kmapper_extraction::ExtractionProcess::empty(kmapper_extraction::ProcessId::new(id))
    }

    fn event_tenant(event: &Self::Event) -> Option<TenantId> {
        Some(event.tenant_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kmapper_core::{PageId, TenantId};
    use kmapper_extraction::process::{
        ExtractionCommand, ExtractionProcess, RequestExtraction, StartExtraction,
    };

    use crate::event_store::InMemoryEventStore;

    fn request_command(tenant_id: TenantId) -> ExtractionCommand {
        ExtractionCommand::RequestExtraction(RequestExtraction {
            tenant_id,
            page_id: PageId::new(),
            page_url: "https://example.test/a".to_string(),
            content_hash: "h1".to_string(),
            extraction_config: None,
            occurred_at: Utc::now(),
        })
    }

    fn repo(
        store: std::sync::Arc<InMemoryEventStore>,
    ) -> AggregateRepository<ExtractionProcess, std::sync::Arc<InMemoryEventStore>> {
        AggregateRepository::new(store)
    }

    #[tokio::test]
    async fn save_then_load_round_trips_state() {
        let store = std::sync::Arc::new(InMemoryEventStore::new());
        let repository = repo(store.clone());
        let id = AggregateId::new();
        let tenant = TenantId::new();

        let mut context = repository.load_or_create(id).await.unwrap();
        context.execute(&request_command(tenant)).unwrap();
        context
            .execute(&ExtractionCommand::Start(StartExtraction {
                worker_id: "w1".to_string(),
                occurred_at: Utc::now(),
            }))
            .unwrap();

        let stored = repository.save(&mut context).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(context.uncommitted_events().is_empty());

        let reloaded = repository.load(id).await.unwrap();
        assert_eq!(reloaded.version(), 2);
        assert_eq!(reloaded.aggregate().tenant_id(), Some(tenant));
    }

    #[tokio::test]
    async fn load_missing_aggregate_fails() {
        let store = std::sync::Arc::new(InMemoryEventStore::new());
        let repository = repo(store);

        let err = repository.load(AggregateId::new()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::AggregateNotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_save_hits_optimistic_lock() {
        let store = std::sync::Arc::new(InMemoryEventStore::new());
        let repository = repo(store.clone());
        let id = AggregateId::new();
        let tenant = TenantId::new();

        let mut first = repository.load_or_create(id).await.unwrap();
        let mut second = repository.load_or_create(id).await.unwrap();

        first.execute(&request_command(tenant)).unwrap();
        second.execute(&request_command(tenant)).unwrap();

        repository.save(&mut first).await.unwrap();
        let err = repository.save(&mut second).await.unwrap_err();

        match err {
            RepositoryError::Store(EventStoreError::OptimisticLock { expected, actual }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected optimistic lock, got {other:?}"),
        }

        // Reload and retry succeeds (the command now conflicts on domain
        // rules instead, because the process already exists).
        let reloaded = repository.load(id).await.unwrap();
        assert_eq!(reloaded.version(), 1);
    }

    #[tokio::test]
    async fn failed_command_leaves_context_untouched() {
        let store = std::sync::Arc::new(InMemoryEventStore::new());
        let repository = repo(store);
        let id = AggregateId::new();

        let mut context = repository.load_or_create(id).await.unwrap();
        context.execute(&request_command(TenantId::new())).unwrap();

        // Second request conflicts; no event must be appended.
        let err = context.execute(&request_command(TenantId::new())).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(context.uncommitted_events().len(), 1);
    }

    #[tokio::test]
    async fn replay_fails_loudly_on_undecodable_event() {
        let store = std::sync::Arc::new(InMemoryEventStore::new());
        let id = AggregateId::new();

        store
            .append(
                id,
                "extraction_process",
                vec![crate::event_store::UncommittedEvent {
                    event_id: Uuid::now_v7(),
                    tenant_id: None,
                    event_type: "extraction.process.retired".to_string(),
                    event_version: 1,
                    occurred_at: Utc::now(),
                    payload: serde_json::json!({"event": "ProcessRetired", "data": {}}),
                }],
                ExpectedVersion::Any,
            )
            .await
            .unwrap();

        let repository = repo(store);
        let err = repository.load(id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::UnknownEvent { .. }));
    }
}
