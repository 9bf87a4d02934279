//! Extraction bounded context.
//!
//! Owns the `ExtractionProcess` aggregate and the adaptive pipeline that
//! turns crawled page content into typed entities and relationships:
//! preprocessing, chunking, cross-chunk entity merging, domain
//! classification, prompt generation and strategy routing.

pub mod chunker;
pub mod classifier;
pub mod domains;
pub mod merger;
pub mod preprocess;
pub mod process;
pub mod strategy;

pub use chunker::{Chunk, ChunkerConfig, SlidingWindowChunker};
pub use classifier::ContentClassifier;
pub use domains::{
    ClassificationResult, ConfidenceThresholds, DomainPromptGenerator, DomainSchema,
    DomainSchemaRegistry, DomainSummary, EntityTypeDef, RelationshipTypeDef, SchemaLoadError,
};
pub use merger::{
    AmbiguousPair, ChunkEntity, ChunkRelationship, CrossChunkMerger, LlmMergeResolver,
    MergeDecision, MergeOutcome, MergeResolver,
};
pub use preprocess::{ContentKind, PreprocessMethod, PreprocessResult, Preprocessor};
pub use process::{
    ExtractionCommand, ExtractionEvent, ExtractionPhase, ExtractionProcess, ProcessId,
};
pub use strategy::{
    ClassificationUpdate, ExtractionMode, ExtractionStrategy, ExtractionStrategyRouter,
    JobUpdater, SchemaSnapshot, ScrapingJobView, StrategyError,
};
