//! Projection runtime.
//!
//! One cooperative worker per projection. Each worker reads its checkpoint,
//! pulls a bounded batch of events with `global_position` beyond it, and
//! applies them in order. A failing event is retried with exponential
//! backoff; when retries are exhausted it is dead-lettered and the
//! checkpoint still advances — the failure is durably recorded, skipping
//! the event loses no information.
//!
//! Handlers must be idempotent: retries and DLQ replays redeliver events.

pub mod checkpoint;
pub mod dlq;
pub mod graph_sync;
pub mod read_model;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::event_store::{EventStore, EventStoreError, StoredEvent};

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, ProjectionCheckpoint};
pub use dlq::{DeadLetterEntry, DeadLetterStatus, DeadLetterStore, InMemoryDeadLetterStore};
pub use graph_sync::GraphSyncProjection;
pub use read_model::ReadModelProjection;

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Transient failure; worth retrying.
    #[error("transient projection failure: {0}")]
    Transient(String),

    /// Terminal failure; goes straight to the DLQ.
    #[error("terminal projection failure: {0}")]
    Terminal(String),

    #[error("event payload could not be decoded: {0}")]
    Decode(String),
}

impl ProjectionError {
    fn retryable(&self) -> bool {
        matches!(self, ProjectionError::Transient(_))
    }
}

/// A projection: named consumer of the global event sequence.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Apply one event. Events the projection does not handle are a no-op
    /// `Ok(())`.
    async fn handle(&self, event: &StoredEvent) -> Result<(), ProjectionError>;
}

/// Retry behavior for failing events.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }
}

/// Handle to stop a spawned projection worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Drives projection handlers over the event store.
#[derive(Clone)]
pub struct ProjectionRuntime {
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    dlq: Arc<dyn DeadLetterStore>,
    batch_size: usize,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl ProjectionRuntime {
    pub fn new(
        store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        dlq: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            store,
            checkpoints,
            dlq,
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process at most one batch for the handler. Returns how many events
    /// were consumed (applied or dead-lettered). Tests and catch-up tooling
    /// call this directly; `spawn` loops it.
    pub async fn run_once(
        &self,
        handler: &dyn ProjectionHandler,
    ) -> Result<usize, EventStoreError> {
        let checkpoint = self
            .checkpoints
            .get(handler.name())
            .await
            .map_err(|e| EventStoreError::Storage(e.to_string()))?;
        let position = checkpoint.map_or(0, |c| c.last_global_position);

        let events = self.store.read_from(position, self.batch_size).await?;
        if events.is_empty() {
            return Ok(0);
        }

        let mut consumed = 0usize;
        for event in &events {
            self.apply_with_retries(handler, event).await;

            self.checkpoints
                .advance(handler.name(), event.global_position, event.event_id)
                .await
                .map_err(|e| EventStoreError::Storage(e.to_string()))?;
            consumed += 1;
        }

        debug!(
            projection = handler.name(),
            consumed,
            up_to = events.last().map(|e| e.global_position),
            "projection batch applied"
        );
        Ok(consumed)
    }

    /// Drain the handler to the head of the log (tests).
    pub async fn run_to_end(
        &self,
        handler: &dyn ProjectionHandler,
    ) -> Result<usize, EventStoreError> {
        let mut total = 0usize;
        loop {
            let consumed = self.run_once(handler).await?;
            if consumed == 0 {
                return Ok(total);
            }
            total += consumed;
        }
    }

    async fn apply_with_retries(&self, handler: &dyn ProjectionHandler, event: &StoredEvent) {
        let mut attempt = 0u32;

        loop {
            match handler.handle(event).await {
                Ok(()) => return,
                Err(err) if err.retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        projection = handler.name(),
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        attempt,
                        error = %err,
                        "projection handler failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
                }
                Err(err) => {
                    // Durably record the failure, then move on: the
                    // checkpoint advances either way.
                    error!(
                        projection = handler.name(),
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        retries = attempt,
                        error = %err,
                        "projection handler exhausted retries, dead-lettering"
                    );
                    if let Err(dlq_err) = self
                        .dlq
                        .record(handler.name(), event, &err.to_string(), attempt)
                        .await
                    {
                        error!(
                            projection = handler.name(),
                            event_id = %event.event_id,
                            error = %dlq_err,
                            "failed to dead-letter event"
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Spawn the worker loop for a handler. Shutdown is cooperative: the
    /// worker checks the flag between batches.
    pub fn spawn(&self, handler: Arc<dyn ProjectionHandler>) -> WorkerHandle {
        let runtime = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(projection = handler.name(), "projection worker started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                match runtime.run_once(handler.as_ref()).await {
                    Ok(0) => {
                        tokio::select! {
                            _ = tokio::time::sleep(runtime.poll_interval) => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            projection = handler.name(),
                            error = %err,
                            "projection batch failed, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(runtime.poll_interval * 4) => {}
                            _ = shutdown_rx.changed() => {}
                        }
                    }
                }
            }

            info!(projection = handler.name(), "projection worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}
