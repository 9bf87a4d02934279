//! Embedding-based similarity with a vector cache.
//!
//! Vectors are cached per `(tenant_id, entity_id)` with a TTL; invalidation
//! on entity text change is the caller's responsibility. Batch scoring
//! preloads cached vectors with one bulk get, computes the misses in a
//! single provider call and bulk-writes them back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use kmapper_consolidation::{EntityView, entity_to_text, normalized_cosine};
use kmapper_core::EntityId;
use kmapper_inference::{EmbeddingCache, EmbeddingProvider, ProviderError};

const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_MAX_DESCRIPTION_CHARS: usize = 500;

/// Semantic similarity via embedding cosine.
pub struct EmbeddingSimilarityService {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Option<Arc<dyn EmbeddingCache>>,
    ttl: Duration,
    max_description_chars: usize,
}

impl EmbeddingSimilarityService {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            cache: None,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_description_chars: DEFAULT_MAX_DESCRIPTION_CHARS,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Get the entity's vector, consulting the cache first.
    pub async fn get_embedding(&self, entity: &EntityView) -> Result<Vec<f32>, ProviderError> {
        if let Some(cache) = &self.cache {
            match cache.get(entity.tenant_id, entity.id).await {
                Ok(Some(vector)) => return Ok(vector),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "embedding cache read failed, computing"),
            }
        }

        let text = entity_to_text(entity, self.max_description_chars);
        let vector = self.provider.embed(&text).await?;

        if let Some(cache) = &self.cache {
            if let Err(err) = cache
                .set(entity.tenant_id, entity.id, vector.clone(), self.ttl)
                .await
            {
                warn!(error = %err, "embedding cache write failed");
            }
        }

        Ok(vector)
    }

    /// Cosine similarity of the pair, normalized into [0, 1].
    pub async fn compute_similarity(
        &self,
        a: &EntityView,
        b: &EntityView,
    ) -> Result<f64, ProviderError> {
        let vector_a = self.get_embedding(a).await?;
        let vector_b = self.get_embedding(b).await?;
        let similarity = normalized_cosine(&vector_a, &vector_b);

        debug!(a = %a.name, b = %b.name, similarity, "embedding similarity");
        Ok(similarity)
    }

    /// Batch mode: one bulk cache get for all candidates, one provider call
    /// for the misses, one bulk write-back. Returns candidate id →
    /// similarity against `source`.
    pub async fn compute_similarities_batch(
        &self,
        source: &EntityView,
        candidates: &[EntityView],
    ) -> Result<HashMap<EntityId, f64>, ProviderError> {
        if candidates.is_empty() {
            return Ok(HashMap::new());
        }

        let source_vector = self.get_embedding(source).await?;

        let mut vectors: HashMap<EntityId, Vec<f32>> = HashMap::with_capacity(candidates.len());
        let mut misses: Vec<&EntityView> = Vec::new();

        if let Some(cache) = &self.cache {
            let ids: Vec<EntityId> = candidates.iter().map(|c| c.id).collect();
            match cache.get_many(source.tenant_id, &ids).await {
                Ok(cached) => {
                    for (candidate, vector) in candidates.iter().zip(cached) {
                        match vector {
                            Some(v) => {
                                vectors.insert(candidate.id, v);
                            }
                            None => misses.push(candidate),
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "bulk embedding cache read failed");
                    misses.extend(candidates.iter());
                }
            }
        } else {
            misses.extend(candidates.iter());
        }

        if !misses.is_empty() {
            let texts: Vec<String> = misses
                .iter()
                .map(|c| entity_to_text(c, self.max_description_chars))
                .collect();
            let computed = self.provider.embed_batch(&texts).await?;

            let mut write_back = Vec::with_capacity(misses.len());
            for (candidate, vector) in misses.iter().zip(computed) {
                vectors.insert(candidate.id, vector.clone());
                write_back.push((candidate.id, vector));
            }

            if let Some(cache) = &self.cache {
                if let Err(err) = cache
                    .set_many(source.tenant_id, write_back, self.ttl)
                    .await
                {
                    warn!(error = %err, "bulk embedding cache write failed");
                }
            }
        }

        Ok(vectors
            .into_iter()
            .map(|(id, vector)| (id, normalized_cosine(&source_vector, &vector)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kmapper_core::TenantId;
    use kmapper_inference::InMemoryEmbeddingCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic provider: name length decides the vector, so identical
    /// names embed identically.
    struct StubProvider {
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn vector_for(text: &str) -> Vec<f32> {
            let x = (text.len() % 7) as f32;
            vec![x, 1.0, 0.5]
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::vector_for(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
        }
    }

    fn view(tenant: TenantId, name: &str) -> EntityView {
        EntityView {
            id: EntityId::new(),
            tenant_id: tenant,
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            entity_type: "ORG".to_string(),
            description: None,
            source_page_id: None,
            is_canonical: true,
        }
    }

    #[tokio::test]
    async fn identical_texts_have_similarity_one() {
        let service = EmbeddingSimilarityService::new(StubProvider::new());
        let tenant = TenantId::new();

        let similarity = service
            .compute_similarity(&view(tenant, "ACME Corp"), &view(tenant, "ACME Corp"))
            .await
            .unwrap();

        assert!((similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn cache_avoids_repeat_provider_calls() {
        let provider = StubProvider::new();
        let service = EmbeddingSimilarityService::new(provider.clone())
            .with_cache(Arc::new(InMemoryEmbeddingCache::new()));
        let tenant = TenantId::new();
        let entity = view(tenant, "ACME Corp");

        service.get_embedding(&entity).await.unwrap();
        service.get_embedding(&entity).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_computes_misses_in_one_call() {
        let provider = StubProvider::new();
        let cache = Arc::new(InMemoryEmbeddingCache::new());
        let service =
            EmbeddingSimilarityService::new(provider.clone()).with_cache(cache.clone());
        let tenant = TenantId::new();

        let source = view(tenant, "source entity");
        let cached = view(tenant, "already cached");
        let miss_a = view(tenant, "first miss");
        let miss_b = view(tenant, "second miss");

        cache
            .set(tenant, cached.id, vec![1.0, 1.0, 0.5], Duration::from_secs(60))
            .await
            .unwrap();

        let scores = service
            .compute_similarities_batch(&source, &[cached.clone(), miss_a.clone(), miss_b.clone()])
            .await
            .unwrap();

        assert_eq!(scores.len(), 3);
        // One call for the source, one batch call for the two misses.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        // The misses got written back.
        assert!(cache.get(tenant, miss_a.id).await.unwrap().is_some());
        assert!(cache.get(tenant, miss_b.id).await.unwrap().is_some());
    }
}
