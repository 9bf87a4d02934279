//! In-memory outbox store for tests and development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{OutboxEntry, OutboxError, OutboxStatus, OutboxStore};

#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    entries: Mutex<HashMap<Uuid, OutboxEntry>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under the caller's lock discipline; used by the in-memory
    /// event store to emulate the same-transaction write.
    pub fn insert_sync(&self, entry: OutboxEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.id, entry);
    }

    /// Snapshot of every entry regardless of status (tests).
    pub fn all(&self) -> Vec<OutboxEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<OutboxEntry> = entries.values().cloned().collect();
        out.sort_by_key(|e| e.created_at);
        out
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn poll(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<OutboxEntry> = entries
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.created_at, e.global_position));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), OutboxError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        entry.status = OutboxStatus::Published;
        entry.published_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        permanent: bool,
    ) -> Result<(), OutboxError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        if permanent {
            entry.status = OutboxStatus::Failed;
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, OutboxError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmapper_core::AggregateId;

    fn entry() -> OutboxEntry {
        OutboxEntry {
            id: Uuid::now_v7(),
            event_id: Uuid::now_v7(),
            event_type: "extraction.entity.extracted".to_string(),
            aggregate_id: AggregateId::new(),
            aggregate_type: "extraction".to_string(),
            aggregate_version: 1,
            global_position: 1,
            tenant_id: None,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
            published_at: None,
            retry_count: 0,
            last_error: None,
            status: OutboxStatus::Pending,
        }
    }

    #[tokio::test]
    async fn poll_returns_only_pending() {
        let store = InMemoryOutboxStore::new();
        let a = entry();
        let b = entry();
        store.insert_sync(a.clone());
        store.insert_sync(b.clone());

        store.mark_published(a.id).await.unwrap();

        let pending = store.poll(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[tokio::test]
    async fn failures_accumulate_and_can_become_permanent() {
        let store = InMemoryOutboxStore::new();
        let e = entry();
        store.insert_sync(e.clone());

        store.mark_failed(e.id, "boom", false).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 1);

        store.mark_failed(e.id, "boom again", true).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let all = store.all();
        assert_eq!(all[0].retry_count, 2);
        assert_eq!(all[0].status, OutboxStatus::Failed);
    }
}
