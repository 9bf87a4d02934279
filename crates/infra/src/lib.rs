//! Infrastructure: storage, projections, orchestration.
//!
//! Everything I/O-shaped lives here: the postgres/in-memory event store
//! with its transactional outbox, the aggregate repository, the projection
//! runtime with checkpoints and dead-lettering, relational and graph
//! read-model maintenance, and the consolidation services (blocking,
//! combined scoring, merge/undo/split, review queue, batch jobs).

pub mod consolidation;
pub mod event_store;
pub mod extraction_pipeline;
pub mod outbox;
pub mod projections;
pub mod read_model;
pub mod repository;
pub mod tenant;

#[cfg(test)]
mod integration_tests;

pub use event_store::{
    EventStore, EventStoreError, EventStream, InMemoryEventStore, PostgresEventStore, Snapshot,
    StoredEvent, UncommittedEvent,
};
pub use outbox::{
    InMemoryOutboxStore, OutboxEntry, OutboxPublisher, OutboxStatus, OutboxStore,
    PostgresOutboxStore, PublisherConfig,
};
pub use projections::{
    CheckpointStore, DeadLetterEntry, DeadLetterStatus, DeadLetterStore, GraphSyncProjection,
    InMemoryCheckpointStore, InMemoryDeadLetterStore, ProjectionCheckpoint, ProjectionError,
    ProjectionHandler, ProjectionRuntime, ReadModelProjection, RetryPolicy, WorkerHandle,
};
pub use read_model::{
    BlockingQuery, EntityRecord, EntityStore, InMemoryReadModel, MergeHistoryRecord,
    MergeHistoryStore, PostgresReadModel, ReadModelError, RelationshipRecord, RelationshipStore,
    ReviewQueueRecord, ReviewStore,
};
pub use extraction_pipeline::{ExtractionPipeline, PipelineError, PipelineReport, PipelineRequest};
pub use repository::{AggregateContext, AggregateRepository, EventSourced, RepositoryError};
pub use tenant::{TenantContext, TenantScopeGuardError};
