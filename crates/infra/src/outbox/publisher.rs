//! Outbox publisher: drains pending rows into the event bus.
//!
//! Single active publisher per partition; consumers are idempotent in
//! `event_id` regardless, so a crash between publish and mark only causes
//! a duplicate delivery.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use kmapper_events::{EventBus, EventEnvelope};

use super::{OutboxError, OutboxStore};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// After this many failed attempts a row is moved to permanent-failed
    /// and surfaced operationally.
    pub max_retries: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            batch_size: 100,
            max_retries: 5,
        }
    }
}

/// Handle to stop a running publisher.
pub struct PublisherHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl PublisherHandle {
    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Drains the outbox into an event bus.
pub struct OutboxPublisher<B> {
    outbox: Arc<dyn OutboxStore>,
    bus: B,
    config: PublisherConfig,
}

impl<B> OutboxPublisher<B>
where
    B: EventBus<EventEnvelope<JsonValue>> + Clone + Send + Sync + 'static,
{
    pub fn new(outbox: Arc<dyn OutboxStore>, bus: B, config: PublisherConfig) -> Self {
        Self {
            outbox,
            bus,
            config,
        }
    }

    /// Publish one batch of pending rows. Returns how many were published.
    pub async fn run_once(&self) -> Result<usize, OutboxError> {
        let pending = self.outbox.poll(self.config.batch_size).await?;
        let mut published = 0usize;

        for entry in pending {
            match self.bus.publish(entry.to_envelope()) {
                Ok(()) => {
                    self.outbox.mark_published(entry.id).await?;
                    published += 1;
                }
                Err(err) => {
                    let permanent = entry.retry_count + 1 >= self.config.max_retries;
                    if permanent {
                        warn!(
                            entry_id = %entry.id,
                            event_type = %entry.event_type,
                            retry_count = entry.retry_count + 1,
                            "outbox entry permanently failed"
                        );
                    }
                    self.outbox
                        .mark_failed(entry.id, &format!("{err:?}"), permanent)
                        .await?;
                }
            }
        }

        if published > 0 {
            debug!(published, "outbox batch published");
        }
        Ok(published)
    }

    /// Spawn the publisher loop. Exponential backoff kicks in when a batch
    /// fails wholesale (store unavailable).
    pub fn spawn(self) -> PublisherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!("outbox publisher started");
            let mut error_streak = 0u32;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let delay = match self.run_once().await {
                    Ok(_) => {
                        error_streak = 0;
                        self.config.poll_interval
                    }
                    Err(err) => {
                        error_streak += 1;
                        let backoff = self.config.poll_interval
                            * 2u32.saturating_pow(error_streak.min(6));
                        warn!(error = %err, streak = error_streak, "outbox poll failed, backing off");
                        backoff
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }

            info!("outbox publisher stopped");
        });

        PublisherHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}
