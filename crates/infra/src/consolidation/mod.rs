//! Consolidation services: candidate generation, scoring, merge execution,
//! review queue and batch jobs.

pub mod batch;
pub mod blocking;
pub mod embedding;
pub mod graph_sim;
pub mod merge_service;
pub mod review_service;
pub mod scoring;

pub use batch::{BatchConsolidationJob, BatchOptions, BatchReport};
pub use blocking::{BlockingEngine, BlockingResult, BlockingStatistics, BlockingStrategy};
pub use embedding::EmbeddingSimilarityService;
pub use graph_sim::GraphSimilarityService;
pub use merge_service::{MergeExecution, MergeService, MergeServiceError, SplitExecution};
pub use review_service::{ReviewOutcome, ReviewQueueService};
pub use scoring::CombinedScoringPipeline;
