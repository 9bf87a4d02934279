//! Adaptive extraction pipeline.
//!
//! The happy path: raw page content → preprocessing → chunking → strategy
//! routing (classifier for auto-detect jobs) → per-chunk inference guarded
//! by the circuit breaker → cross-chunk entity merging → domain events on
//! the extraction process aggregate.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};

use kmapper_core::{AggregateId, DomainError, EntityId, PageId, RelationshipId, TenantId};
use kmapper_extraction::process::{
    CompleteExtraction, ExtractionCommand, ExtractionProcess, FailExtraction, RecordEntity,
    RecordRelationship, RequestExtraction, StartExtraction,
};
use kmapper_extraction::{
    ChunkEntity, ChunkRelationship, ContentKind, CrossChunkMerger, ExtractionStrategy,
    ExtractionStrategyRouter, MergeResolver, PreprocessMethod, Preprocessor, ScrapingJobView,
    SlidingWindowChunker, StrategyError,
};
use kmapper_inference::{
    BreakerStoreError, CircuitBreaker, CircuitOpen, InferenceProvider, InferenceRequest,
    ProviderError,
};

use crate::event_store::EventStore;
use crate::repository::{AggregateRepository, RepositoryError};

const DEFAULT_EXTRACTION_PROMPT: &str = "You are a knowledge extractor. Identify the entities \
(people, organizations, places, concepts, works) and the relationships between them in the given \
text. Respond with ONLY a JSON object of the form {\"entities\": [{\"name\", \"entity_type\", \
\"description\", \"confidence\"}], \"relationships\": [{\"source_entity\", \"target_entity\", \
\"relationship_type\", \"confidence\"}]} and no other text.";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    #[error("breaker state store failed: {0}")]
    Breaker(#[from] BreakerStoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("every chunk failed: {0}")]
    AllChunksFailed(String),
}

/// One extraction run over one page.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub process_id: AggregateId,
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub page_url: String,
    pub content_hash: String,
    pub raw_content: String,
    pub content_kind: ContentKind,
    pub job: ScrapingJobView,
    pub worker_id: String,
}

/// Counters for a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub entity_count: usize,
    pub relationship_count: usize,
    pub chunk_count: usize,
    pub failed_chunks: usize,
    pub preprocess_method: PreprocessMethod,
    pub duration_ms: u64,
}

/// Per-chunk payload the model is asked to emit.
#[derive(Debug, Deserialize)]
struct ChunkExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    entity_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    properties: Option<JsonValue>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    source_entity: String,
    target_entity: String,
    relationship_type: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    context: Option<String>,
}

fn default_confidence() -> f64 {
    0.5
}

pub struct ExtractionPipeline {
    preprocessor: Preprocessor,
    chunker: SlidingWindowChunker,
    router: Arc<ExtractionStrategyRouter>,
    provider: Arc<dyn InferenceProvider>,
    breaker: Option<CircuitBreaker>,
    merger: CrossChunkMerger,
    resolver: Option<Arc<dyn MergeResolver>>,
    repository: AggregateRepository<ExtractionProcess, Arc<dyn EventStore>>,
}

impl ExtractionPipeline {
    pub fn new(
        chunker: SlidingWindowChunker,
        router: Arc<ExtractionStrategyRouter>,
        provider: Arc<dyn InferenceProvider>,
        event_store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            preprocessor: Preprocessor::new(),
            chunker,
            router,
            provider,
            breaker: None,
            merger: CrossChunkMerger::default(),
            resolver: None,
            repository: AggregateRepository::new(event_store),
        }
    }

    /// Guard the inference calls with a circuit breaker.
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Use an LLM resolver for ambiguous cross-chunk pairs.
    pub fn with_merge_resolver(mut self, resolver: Arc<dyn MergeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Run extraction for one page, appending the whole run as one event
    /// batch on the process stream.
    #[instrument(skip(self, request), fields(page_id = %request.page_id, tenant_id = %request.tenant_id), err)]
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();

        let mut context = self.repository.load_or_create(request.process_id).await?;
        if context.version() == 0 {
            context.execute(&ExtractionCommand::RequestExtraction(RequestExtraction {
                tenant_id: request.tenant_id,
                page_id: request.page_id,
                page_url: request.page_url.clone(),
                content_hash: request.content_hash.clone(),
                extraction_config: None,
                occurred_at: Utc::now(),
            }))?;
        }
        context.execute(&ExtractionCommand::Start(StartExtraction {
            worker_id: request.worker_id.clone(),
            occurred_at: Utc::now(),
        }))?;

        let preprocessed = self
            .preprocessor
            .preprocess(&request.raw_content, request.content_kind);
        let chunks = self.chunker.chunk(&preprocessed.text);

        let strategy = self.router.route(&request.job, &preprocessed.text).await?;

        let mut chunk_entities: Vec<ChunkEntity> = Vec::new();
        let mut chunk_relationships: Vec<ChunkRelationship> = Vec::new();
        let mut failed_chunks = 0usize;
        let mut last_error: Option<String> = None;

        for chunk in &chunks {
            match self.extract_chunk(&strategy, &chunk.text).await {
                Ok(Some(extraction)) => {
                    for entity in extraction.entities {
                        if entity.name.trim().is_empty() {
                            continue;
                        }
                        chunk_entities.push(ChunkEntity {
                            normalized_name: normalize_name(&entity.name),
                            name: entity.name,
                            entity_type: entity.entity_type.trim().to_uppercase(),
                            description: entity.description,
                            properties: entity.properties.unwrap_or(JsonValue::Null),
                            confidence: entity.confidence.clamp(0.0, 1.0),
                            source_chunk: chunk.index,
                        });
                    }
                    for relationship in extraction.relationships {
                        chunk_relationships.push(ChunkRelationship {
                            source_entity_name: relationship.source_entity,
                            target_entity_name: relationship.target_entity,
                            relationship_type: relationship.relationship_type,
                            confidence: relationship.confidence.clamp(0.0, 1.0),
                            context: relationship.context,
                            source_chunk: chunk.index,
                        });
                    }
                }
                Ok(None) => {
                    // Undecodable model output for this chunk only.
                    failed_chunks += 1;
                }
                Err(err) => {
                    failed_chunks += 1;
                    last_error = Some(err.to_string());

                    // The breaker tripping mid-run fails the rest of the
                    // document; the run is retryable.
                    if matches!(err, ChunkError::CircuitOpen(_)) {
                        break;
                    }
                }
            }
        }

        if !chunks.is_empty() && chunk_entities.is_empty() && failed_chunks == chunks.len() {
            let message = last_error.unwrap_or_else(|| "no chunk produced output".to_string());
            context.execute(&ExtractionCommand::Fail(FailExtraction {
                error_message: message.clone(),
                error_type: "provider_failure".to_string(),
                retryable: true,
                occurred_at: Utc::now(),
            }))?;
            self.repository.save(&mut context).await?;
            return Err(PipelineError::AllChunksFailed(message));
        }

        let outcome = match &self.resolver {
            Some(resolver) => {
                self.merger
                    .merge_with_resolver(chunk_entities, chunk_relationships, resolver.as_ref())
                    .await
            }
            None => self.merger.merge(chunk_entities, chunk_relationships),
        };

        for entity in &outcome.entities {
            context.execute(&ExtractionCommand::RecordEntity(RecordEntity {
                entity_id: EntityId::new(),
                entity_type: entity.entity_type.clone(),
                name: entity.name.clone(),
                normalized_name: entity.normalized_name.clone(),
                properties: entity.properties.clone(),
                description: entity.description.clone(),
                confidence: entity.confidence,
                extraction_method: "llm".to_string(),
                source_text: None,
                occurred_at: Utc::now(),
            }))?;
        }

        for relationship in &outcome.relationships {
            context.execute(&ExtractionCommand::RecordRelationship(RecordRelationship {
                relationship_id: RelationshipId::new(),
                source_entity_name: relationship.source_entity_name.clone(),
                target_entity_name: relationship.target_entity_name.clone(),
                relationship_type: relationship.relationship_type.clone(),
                confidence_score: relationship.confidence,
                context: relationship.context.clone(),
                occurred_at: Utc::now(),
            }))?;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        context.execute(&ExtractionCommand::Complete(CompleteExtraction {
            duration_ms,
            extraction_method: "llm".to_string(),
            occurred_at: Utc::now(),
        }))?;

        self.repository.save(&mut context).await?;

        let report = PipelineReport {
            entity_count: outcome.entities.len(),
            relationship_count: outcome.relationships.len(),
            chunk_count: chunks.len(),
            failed_chunks,
            preprocess_method: preprocessed.method,
            duration_ms,
        };
        info!(
            entities = report.entity_count,
            relationships = report.relationship_count,
            chunks = report.chunk_count,
            failed_chunks,
            "extraction pipeline completed"
        );
        Ok(report)
    }

    async fn extract_chunk(
        &self,
        strategy: &ExtractionStrategy,
        text: &str,
    ) -> Result<Option<ChunkExtraction>, ChunkError> {
        if let Some(breaker) = &self.breaker {
            if !breaker.allow_request().await? {
                return Err(ChunkError::CircuitOpen(breaker.open_error().await?));
            }
        }

        let system_prompt = strategy
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_EXTRACTION_PROMPT.to_string());

        let mut inference = InferenceRequest::new(text).with_system_prompt(system_prompt);
        if let Some(schema) = &strategy.output_schema {
            inference = inference.with_output_schema(schema.clone());
        }

        match self.provider.infer(inference).await {
            Ok(response) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success().await?;
                }
                Ok(parse_chunk_response(&response.content))
            }
            Err(err) => {
                if err.counts_as_failure() {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_failure().await?;
                    }
                }
                Err(ChunkError::Provider(err))
            }
        }
    }
}

#[derive(Debug, Error)]
enum ChunkError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    CircuitOpen(CircuitOpen),

    #[error(transparent)]
    Breaker(#[from] BreakerStoreError),
}

impl From<ChunkError> for PipelineError {
    fn from(value: ChunkError) -> Self {
        match value {
            ChunkError::Provider(err) => PipelineError::AllChunksFailed(err.to_string()),
            ChunkError::CircuitOpen(err) => PipelineError::CircuitOpen(err),
            ChunkError::Breaker(err) => PipelineError::Breaker(err),
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn parse_chunk_response(content: &str) -> Option<ChunkExtraction> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }

    match serde_json::from_str::<ChunkExtraction>(&content[start..=end]) {
        Ok(extraction) => Some(extraction),
        Err(err) => {
            warn!(error = %err, "undecodable chunk extraction output");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kmapper_extraction::{
        ChunkerConfig, ContentClassifier, DomainSchemaRegistry, ExtractionMode,
    };
    use kmapper_inference::{BreakerConfig, InMemoryBreakerStore, InferenceResponse};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    use crate::event_store::InMemoryEventStore;

    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, ()>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<Result<String, ()>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceProvider for ScriptedProvider {
        async fn infer(
            &self,
            _request: InferenceRequest,
        ) -> Result<InferenceResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.lock().unwrap().pop() {
                Some(Ok(content)) => Ok(InferenceResponse {
                    content,
                    model: "test".to_string(),
                }),
                Some(Err(())) | None => Err(ProviderError::Timeout),
            }
        }
    }

    fn chunk_json(names: &[(&str, &str)], rels: &[(&str, &str)]) -> String {
        let entities: Vec<JsonValue> = names
            .iter()
            .map(|(name, t)| {
                serde_json::json!({"name": name, "entity_type": t, "confidence": 0.9})
            })
            .collect();
        let relationships: Vec<JsonValue> = rels
            .iter()
            .map(|(s, t)| {
                serde_json::json!({
                    "source_entity": s,
                    "target_entity": t,
                    "relationship_type": "RELATED_TO",
                    "confidence": 0.8
                })
            })
            .collect();
        serde_json::json!({"entities": entities, "relationships": relationships}).to_string()
    }

    fn pipeline(
        provider: Arc<ScriptedProvider>,
        store: Arc<InMemoryEventStore>,
    ) -> ExtractionPipeline {
        let registry = Arc::new(DomainSchemaRegistry::from_schemas(vec![]));
        let classifier = Arc::new(ContentClassifier::new(provider.clone(), registry.clone()));
        let router = Arc::new(ExtractionStrategyRouter::new(registry, classifier));

        ExtractionPipeline::new(
            SlidingWindowChunker::new(ChunkerConfig::default()).unwrap(),
            router,
            provider,
            store,
        )
    }

    fn request(tenant: TenantId) -> PipelineRequest {
        PipelineRequest {
            process_id: AggregateId::new(),
            tenant_id: tenant,
            page_id: PageId::new(),
            page_url: "https://example.test/a".to_string(),
            content_hash: "h1".to_string(),
            raw_content: "Rust is a systems language. Tokio builds on Rust.".to_string(),
            content_kind: ContentKind::PlainText,
            job: ScrapingJobView {
                job_id: Uuid::now_v7(),
                tenant_id: tenant,
                mode: ExtractionMode::Legacy,
                content_domain: None,
                classification_confidence: None,
                schema_snapshot: None,
            },
            worker_id: "w1".to_string(),
        }
    }

    #[tokio::test]
    async fn happy_path_records_entities_and_completes() {
        let provider = ScriptedProvider::new(vec![Ok(chunk_json(
            &[("Rust", "LANGUAGE"), ("Tokio", "LIBRARY")],
            &[("Tokio", "Rust")],
        ))]);
        let store = Arc::new(InMemoryEventStore::new());
        let pipeline = pipeline(provider, store.clone());
        let tenant = TenantId::new();

        let report = pipeline.run(request(tenant)).await.unwrap();

        assert_eq!(report.entity_count, 2);
        assert_eq!(report.relationship_count, 1);
        assert_eq!(report.failed_chunks, 0);

        let events = store.read_from(0, 100).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "extraction.process.requested",
                "extraction.process.started",
                "extraction.entity.extracted",
                "extraction.entity.extracted",
                "extraction.relationship.discovered",
                "extraction.process.completed",
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_entities_across_chunks_are_merged() {
        // Force two chunks; the same entity appears in both.
        let provider = ScriptedProvider::new(vec![
            Ok(chunk_json(&[("Rust", "LANGUAGE")], &[])),
            Ok(chunk_json(&[("Rust", "LANGUAGE")], &[])),
        ]);
        let store = Arc::new(InMemoryEventStore::new());
        let registry = Arc::new(DomainSchemaRegistry::from_schemas(vec![]));
        let classifier = Arc::new(ContentClassifier::new(provider.clone(), registry.clone()));
        let router = Arc::new(ExtractionStrategyRouter::new(registry, classifier));
        let pipeline = ExtractionPipeline::new(
            SlidingWindowChunker::new(ChunkerConfig {
                max_chunk_size: 30,
                overlap_size: 5,
                max_chunks: 2,
            })
            .unwrap(),
            router,
            provider,
            store,
        );

        let report = pipeline.run(request(TenantId::new())).await.unwrap();
        assert_eq!(report.chunk_count, 2);
        assert_eq!(report.entity_count, 1);
    }

    #[tokio::test]
    async fn total_provider_failure_fails_the_process_retryably() {
        let provider = ScriptedProvider::new(vec![Err(())]);
        let store = Arc::new(InMemoryEventStore::new());
        let pipeline = pipeline(provider, store.clone());

        let err = pipeline.run(request(TenantId::new())).await.unwrap_err();
        assert!(matches!(err, PipelineError::AllChunksFailed(_)));

        let events = store.read_from(0, 100).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, "extraction.process.failed");
        assert_eq!(last.payload["data"]["retryable"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn breaker_failures_accumulate_and_open() {
        let provider = ScriptedProvider::new(vec![Err(()), Err(()), Err(())]);
        let store = Arc::new(InMemoryEventStore::new());
        let breaker = CircuitBreaker::new(
            Arc::new(InMemoryBreakerStore::new()),
            BreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        let pipeline = pipeline(provider, store.clone()).with_breaker(breaker.clone());

        let err = pipeline.run(request(TenantId::new())).await.unwrap_err();
        assert!(matches!(err, PipelineError::AllChunksFailed(_)));

        // One failure tripped the breaker.
        assert!(!breaker.allow_request().await.unwrap());
    }

    #[tokio::test]
    async fn undecodable_chunk_output_is_skipped() {
        let provider = ScriptedProvider::new(vec![Ok("not json".to_string())]);
        let store = Arc::new(InMemoryEventStore::new());
        let pipeline = pipeline(provider, store.clone());

        let err = pipeline.run(request(TenantId::new())).await.unwrap_err();
        // The only chunk failed to decode, so the run fails retryably.
        assert!(matches!(err, PipelineError::AllChunksFailed(_)));
    }
}
