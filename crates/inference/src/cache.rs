//! Embedding vector cache keyed by `(tenant_id, entity_id)`.
//!
//! Invalidation on entity text change is the caller's responsibility; the
//! TTL bounds how stale a vector can get.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use kmapper_core::{EntityId, TenantId};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("embedding cache unavailable: {0}")]
    Unavailable(String),
}

/// Cache of embedding vectors with TTL semantics.
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<Option<Vec<f32>>, CacheError>;

    async fn set(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        vector: Vec<f32>,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Bulk get preserving input order; misses are `None`.
    async fn get_many(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
    ) -> Result<Vec<Option<Vec<f32>>>, CacheError>;

    async fn set_many(
        &self,
        tenant_id: TenantId,
        entries: Vec<(EntityId, Vec<f32>)>,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Drop a cached vector (e.g. after the entity's text changed).
    async fn invalidate(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<(), CacheError>;
}

struct CachedVector {
    vector: Vec<f32>,
    expires_at: Instant,
}

/// Process-local cache for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryEmbeddingCache {
    entries: Mutex<HashMap<(TenantId, EntityId), CachedVector>>,
}

impl InMemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmbeddingCache for InMemoryEmbeddingCache {
    async fn get(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<Option<Vec<f32>>, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&(tenant_id, entity_id)) {
            Some(cached) if cached.expires_at > Instant::now() => Ok(Some(cached.vector.clone())),
            Some(_) => {
                entries.remove(&(tenant_id, entity_id));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        vector: Vec<f32>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            (tenant_id, entity_id),
            CachedVector {
                vector,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_many(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
    ) -> Result<Vec<Option<Vec<f32>>>, CacheError> {
        let mut out = Vec::with_capacity(entity_ids.len());
        for id in entity_ids {
            out.push(self.get(tenant_id, *id).await?);
        }
        Ok(out)
    }

    async fn set_many(
        &self,
        tenant_id: TenantId,
        entries: Vec<(EntityId, Vec<f32>)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        for (id, vector) in entries {
            self.set(tenant_id, id, vector, ttl).await?;
        }
        Ok(())
    }

    async fn invalidate(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(tenant_id, entity_id));
        Ok(())
    }
}
