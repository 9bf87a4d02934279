//! Inference boundary: LLM + embedding providers, circuit breaking, caching.
//!
//! This crate is intentionally not part of the domain model. It owns the
//! unreliable edges (HTTP providers, shared breaker state, vector caches)
//! and exposes them behind traits so the rest of the system can be tested
//! without any running service.

pub mod breaker;
pub mod cache;
pub mod embedding;
pub mod http;
pub mod provider;

#[cfg(feature = "redis")]
pub mod redis_support;

pub use breaker::{
    BreakerConfig, BreakerStateStore, BreakerStoreError, CircuitBreaker, CircuitOpen,
    CircuitState, InMemoryBreakerStore,
};
pub use cache::{CacheError, EmbeddingCache, InMemoryEmbeddingCache};
pub use embedding::{EmbeddingProvider, HttpEmbeddingProvider};
pub use http::HttpInferenceProvider;
pub use provider::{InferenceProvider, InferenceRequest, InferenceResponse, ProviderError};
