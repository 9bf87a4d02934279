//! Consolidation event catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use kmapper_core::{EntityId, TenantId, UserId};
use kmapper_events::Event;

/// The similarity features that produced a combined score. `None` means the
/// feature was disabled or failed to compute and was omitted from the
/// weighted combination.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SimilarityScores {
    pub jaro_winkler: Option<f64>,
    pub normalized_exact: Option<f64>,
    pub type_match: Option<f64>,
    pub embedding_cosine: Option<f64>,
    pub graph_neighborhood: Option<f64>,
}

/// Human decision on a queued merge candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    Defer,
    MarkDifferent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidateIdentified {
    pub tenant_id: TenantId,
    pub entity_a_id: EntityId,
    pub entity_b_id: EntityId,
    pub combined_confidence: f64,
    pub similarity_scores: SimilarityScores,
    pub blocking_keys_matched: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitiesMerged {
    pub tenant_id: TenantId,
    pub canonical_entity_id: EntityId,
    /// At least one entity is demoted to an alias of the canonical.
    pub merged_entity_ids: Vec<EntityId>,
    pub merged_entity_names: Vec<String>,
    pub merge_reason: String,
    pub similarity_scores: SimilarityScores,
    pub property_merge_details: JsonValue,
    pub relationship_transfer_count: u32,
    pub merged_by_user_id: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasCreated {
    pub tenant_id: TenantId,
    pub alias_id: EntityId,
    pub canonical_entity_id: EntityId,
    pub alias_name: String,
    pub original_entity_id: EntityId,
    pub merge_event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeQueuedForReview {
    pub tenant_id: TenantId,
    pub entity_a_id: EntityId,
    pub entity_b_id: EntityId,
    pub confidence: f64,
    pub review_priority: i32,
    pub queue_reason: String,
    pub similarity_scores: SimilarityScores,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReviewDecision {
    pub tenant_id: TenantId,
    pub review_item_id: Uuid,
    pub entity_a_id: EntityId,
    pub entity_b_id: EntityId,
    pub decision: ReviewDecision,
    pub reviewer_user_id: UserId,
    pub reviewer_notes: Option<String>,
    pub original_confidence: f64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeUndone {
    pub tenant_id: TenantId,
    pub original_merge_event_id: Uuid,
    pub canonical_entity_id: EntityId,
    pub restored_entity_ids: Vec<EntityId>,
    pub original_entity_ids: Vec<EntityId>,
    pub undo_reason: String,
    pub undone_by_user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySplit {
    pub tenant_id: TenantId,
    pub original_entity_id: EntityId,
    /// At least two new entities.
    pub new_entity_ids: Vec<EntityId>,
    pub new_entity_names: Vec<String>,
    /// relationship id → new entity id; unassigned relationships move to
    /// the first new entity.
    pub relationship_assignments: Option<std::collections::HashMap<Uuid, EntityId>>,
    pub property_assignments: Option<JsonValue>,
    pub split_reason: String,
    pub split_by_user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConsolidationStarted {
    pub tenant_id: TenantId,
    pub job_id: Uuid,
    pub entity_count: u64,
    pub actor_id: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConsolidationProgress {
    pub tenant_id: TenantId,
    pub job_id: Uuid,
    pub entities_processed: u64,
    pub candidates_found: u64,
    pub merges_performed: u64,
    pub reviews_queued: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConsolidationCompleted {
    pub tenant_id: TenantId,
    pub job_id: Uuid,
    pub entities_processed: u64,
    pub candidates_found: u64,
    pub merges_performed: u64,
    pub reviews_queued: u64,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConsolidationFailed {
    pub tenant_id: TenantId,
    pub job_id: Uuid,
    pub error_message: String,
    pub entities_processed: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationConfigUpdated {
    pub tenant_id: TenantId,
    pub updated_fields: Vec<String>,
    pub old_values: JsonValue,
    pub new_values: JsonValue,
    pub updated_by_user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ConsolidationEvent {
    MergeCandidateIdentified(MergeCandidateIdentified),
    EntitiesMerged(EntitiesMerged),
    AliasCreated(AliasCreated),
    MergeQueuedForReview(MergeQueuedForReview),
    MergeReviewDecision(MergeReviewDecision),
    MergeUndone(MergeUndone),
    EntitySplit(EntitySplit),
    BatchConsolidationStarted(BatchConsolidationStarted),
    BatchConsolidationProgress(BatchConsolidationProgress),
    BatchConsolidationCompleted(BatchConsolidationCompleted),
    BatchConsolidationFailed(BatchConsolidationFailed),
    ConsolidationConfigUpdated(ConsolidationConfigUpdated),
}

impl ConsolidationEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            ConsolidationEvent::MergeCandidateIdentified(e) => e.tenant_id,
            ConsolidationEvent::EntitiesMerged(e) => e.tenant_id,
            ConsolidationEvent::AliasCreated(e) => e.tenant_id,
            ConsolidationEvent::MergeQueuedForReview(e) => e.tenant_id,
            ConsolidationEvent::MergeReviewDecision(e) => e.tenant_id,
            ConsolidationEvent::MergeUndone(e) => e.tenant_id,
            ConsolidationEvent::EntitySplit(e) => e.tenant_id,
            ConsolidationEvent::BatchConsolidationStarted(e) => e.tenant_id,
            ConsolidationEvent::BatchConsolidationProgress(e) => e.tenant_id,
            ConsolidationEvent::BatchConsolidationCompleted(e) => e.tenant_id,
            ConsolidationEvent::BatchConsolidationFailed(e) => e.tenant_id,
            ConsolidationEvent::ConsolidationConfigUpdated(e) => e.tenant_id,
        }
    }
}

impl Event for ConsolidationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ConsolidationEvent::MergeCandidateIdentified(_) => {
                "consolidation.candidate.identified"
            }
            ConsolidationEvent::EntitiesMerged(_) => "consolidation.entities.merged",
            ConsolidationEvent::AliasCreated(_) => "consolidation.alias.created",
            ConsolidationEvent::MergeQueuedForReview(_) => "consolidation.review.queued",
            ConsolidationEvent::MergeReviewDecision(_) => "consolidation.review.decided",
            ConsolidationEvent::MergeUndone(_) => "consolidation.merge.undone",
            ConsolidationEvent::EntitySplit(_) => "consolidation.entity.split",
            ConsolidationEvent::BatchConsolidationStarted(_) => "consolidation.batch.started",
            ConsolidationEvent::BatchConsolidationProgress(_) => "consolidation.batch.progress",
            ConsolidationEvent::BatchConsolidationCompleted(_) => "consolidation.batch.completed",
            ConsolidationEvent::BatchConsolidationFailed(_) => "consolidation.batch.failed",
            ConsolidationEvent::ConsolidationConfigUpdated(_) => "consolidation.config.updated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ConsolidationEvent::MergeCandidateIdentified(e) => e.occurred_at,
            ConsolidationEvent::EntitiesMerged(e) => e.occurred_at,
            ConsolidationEvent::AliasCreated(e) => e.occurred_at,
            ConsolidationEvent::MergeQueuedForReview(e) => e.occurred_at,
            ConsolidationEvent::MergeReviewDecision(e) => e.occurred_at,
            ConsolidationEvent::MergeUndone(e) => e.occurred_at,
            ConsolidationEvent::EntitySplit(e) => e.occurred_at,
            ConsolidationEvent::BatchConsolidationStarted(e) => e.occurred_at,
            ConsolidationEvent::BatchConsolidationProgress(e) => e.occurred_at,
            ConsolidationEvent::BatchConsolidationCompleted(e) => e.occurred_at,
            ConsolidationEvent::BatchConsolidationFailed(e) => e.occurred_at,
            ConsolidationEvent::ConsolidationConfigUpdated(e) => e.occurred_at,
        }
    }
}
