//! Consolidation bounded context.
//!
//! Pure domain logic for entity deduplication: the consolidation event
//! catalog, per-tenant configuration with feature weights, similarity math
//! (string, phonetic, trigram, embedding cosine, graph neighborhoods),
//! combined scoring with threshold routing, merge validation rules and the
//! review queue lifecycle. All I/O lives in `kmapper-infra`.

pub mod config;
pub mod events;
pub mod merge;
pub mod review;
pub mod scoring;
pub mod similarity;

pub use config::{ConsolidationConfig, FeatureWeights};
pub use events::{
    AliasCreated, BatchConsolidationCompleted, BatchConsolidationFailed,
    BatchConsolidationProgress, BatchConsolidationStarted, ConsolidationConfigUpdated,
    ConsolidationEvent, EntitiesMerged, EntitySplit, MergeCandidateIdentified,
    MergeQueuedForReview, MergeReviewDecision, MergeUndone, ReviewDecision, SimilarityScores,
};
pub use merge::{MergeRequest, SplitRequest, UndoRequest, validate_merge, validate_split};
pub use review::{ReviewFilters, ReviewStatistics, ReviewStatus};
pub use scoring::{ConfidenceBand, RouteDecision, ScoringResult, combine_scores};
pub use similarity::{
    EntityView, GraphNeighborhood, StringScores, compute_string_scores, cosine_similarity,
    entity_to_text, graph_similarity, jaccard, normalized_cosine, soundex, trigram_similarity,
};
