//! Redis-backed breaker state and embedding cache (feature `redis`).
//!
//! Breaker transitions use MULTI/EXEC pipelines so concurrent workers
//! observe consistent state. Commands run on short-lived sync connections,
//! matching how the rest of the stack talks to redis.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Commands;

use kmapper_core::{EntityId, TenantId};

use crate::breaker::{BreakerStateStore, BreakerStoreError, CircuitState};
use crate::cache::{CacheError, EmbeddingCache};

fn state_key(prefix: &str) -> String {
    format!("{prefix}:state")
}

fn failures_key(prefix: &str) -> String {
    format!("{prefix}:failures")
}

fn opened_at_key(prefix: &str) -> String {
    format!("{prefix}:opened_at")
}

fn half_open_calls_key(prefix: &str) -> String {
    format!("{prefix}:half_open_calls")
}

/// Breaker state shared across workers via redis.
#[derive(Clone)]
pub struct RedisBreakerStore {
    client: Arc<redis::Client>,
}

impl RedisBreakerStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BreakerStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn conn(&self) -> Result<redis::Connection, BreakerStoreError> {
        self.client
            .get_connection()
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl BreakerStateStore for RedisBreakerStore {
    async fn get_state(&self, prefix: &str) -> Result<Option<CircuitState>, BreakerStoreError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn
            .get(state_key(prefix))
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))?;
        Ok(raw.as_deref().and_then(CircuitState::parse))
    }

    async fn transition_to_open(
        &self,
        prefix: &str,
        opened_at: f64,
    ) -> Result<(), BreakerStoreError> {
        let mut conn = self.conn()?;
        redis::pipe()
            .atomic()
            .set(state_key(prefix), CircuitState::Open.as_str())
            .set(opened_at_key(prefix), opened_at.to_string())
            .query::<()>(&mut conn)
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))
    }

    async fn transition_to_half_open(&self, prefix: &str) -> Result<(), BreakerStoreError> {
        let mut conn = self.conn()?;
        redis::pipe()
            .atomic()
            .set(state_key(prefix), CircuitState::HalfOpen.as_str())
            .set(half_open_calls_key(prefix), 0)
            .query::<()>(&mut conn)
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))
    }

    async fn transition_to_closed(&self, prefix: &str) -> Result<(), BreakerStoreError> {
        let mut conn = self.conn()?;
        redis::pipe()
            .atomic()
            .set(state_key(prefix), CircuitState::Closed.as_str())
            .set(failures_key(prefix), 0)
            .del(opened_at_key(prefix))
            .del(half_open_calls_key(prefix))
            .query::<()>(&mut conn)
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))
    }

    async fn incr_failures(&self, prefix: &str) -> Result<u64, BreakerStoreError> {
        let mut conn = self.conn()?;
        conn.incr(failures_key(prefix), 1u64)
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))
    }

    async fn reset_failures(&self, prefix: &str) -> Result<(), BreakerStoreError> {
        let mut conn = self.conn()?;
        conn.set(failures_key(prefix), 0)
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))
    }

    async fn incr_half_open_calls(&self, prefix: &str) -> Result<u64, BreakerStoreError> {
        let mut conn = self.conn()?;
        conn.incr(half_open_calls_key(prefix), 1u64)
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))
    }

    async fn get_opened_at(&self, prefix: &str) -> Result<Option<f64>, BreakerStoreError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn
            .get(opened_at_key(prefix))
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    async fn clear(&self, prefix: &str) -> Result<(), BreakerStoreError> {
        let mut conn = self.conn()?;
        redis::pipe()
            .atomic()
            .del(state_key(prefix))
            .del(failures_key(prefix))
            .del(opened_at_key(prefix))
            .del(half_open_calls_key(prefix))
            .query::<()>(&mut conn)
            .map_err(|e| BreakerStoreError::Unavailable(e.to_string()))
    }
}

/// Embedding cache backed by redis with per-key TTL.
#[derive(Clone)]
pub struct RedisEmbeddingCache {
    client: Arc<redis::Client>,
    key_prefix: String,
}

impl RedisEmbeddingCache {
    pub fn new(
        redis_url: impl AsRef<str>,
        key_prefix: impl Into<String>,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, tenant_id: TenantId, entity_id: EntityId) -> String {
        format!("{}:{}:{}", self.key_prefix, tenant_id, entity_id)
    }

    fn conn(&self) -> Result<redis::Connection, CacheError> {
        self.client
            .get_connection()
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl EmbeddingCache for RedisEmbeddingCache {
    async fn get(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<Option<Vec<f32>>, CacheError> {
        let mut conn = self.conn()?;
        let raw: Option<String> = conn
            .get(self.key(tenant_id, entity_id))
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::Unavailable(format!("corrupt cached vector: {e}"))),
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
        let mut conn = self.conn()?;
        let json =
            serde_json::to_string(&vector).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        conn.set_ex(self.key(tenant_id, entity_id), json, ttl.as_secs())
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn get_many(
        &self,
        tenant_id: TenantId,
        entity_ids: &[EntityId],
    ) -> Result<Vec<Option<Vec<f32>>>, CacheError> {
        if entity_ids.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.conn()?;
        let keys: Vec<String> = entity_ids
            .iter()
            .map(|id| self.key(tenant_id, *id))
            .collect();

        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query(&mut conn)
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        raws.into_iter()
            .map(|raw| match raw {
                Some(json) => serde_json::from_str(&json)
                    .map(Some)
                    .map_err(|e| CacheError::Unavailable(format!("corrupt cached vector: {e}"))),
                None => Ok(None),
            })
            .collect()
    }

    async fn set_many(
        &self,
        tenant_id: TenantId,
        entries: Vec<(EntityId, Vec<f32>)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        for (entity_id, vector) in entries {
            let json = serde_json::to_string(&vector)
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            pipe.set_ex(self.key(tenant_id, entity_id), json, ttl.as_secs());
        }
        pipe.query::<()>(&mut conn)
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn invalidate(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn()?;
        conn.del(self.key(tenant_id, entity_id))
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}
