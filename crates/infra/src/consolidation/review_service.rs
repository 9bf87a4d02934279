//! Human review queue over merge candidates.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use kmapper_consolidation::events::{
    ConsolidationEvent, MergeReviewDecision, ReviewDecision,
};
use kmapper_consolidation::merge::MergeRequest;
use kmapper_consolidation::{
    ReviewFilters, ReviewStatistics, ReviewStatus, SimilarityScores,
};
use kmapper_core::{AggregateId, DomainError, EntityId, ExpectedVersion, TenantId, UserId};

use crate::event_store::{EventStore, UncommittedEvent};
use crate::read_model::{ReviewQueueRecord, ReviewStore};

use super::merge_service::{CONSOLIDATION_AGGREGATE_TYPE, MergeService, MergeServiceError};

/// Result of a review decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub decision_event_id: Uuid,
    /// Present when the decision was `approve` and the merge executed.
    pub merge_event_id: Option<Uuid>,
}

/// Lists, decides and escalates review items.
pub struct ReviewQueueService {
    reviews: Arc<dyn ReviewStore>,
    event_store: Arc<dyn EventStore>,
    merge: Arc<MergeService>,
}

impl ReviewQueueService {
    pub fn new(
        reviews: Arc<dyn ReviewStore>,
        event_store: Arc<dyn EventStore>,
        merge: Arc<MergeService>,
    ) -> Self {
        Self {
            reviews,
            event_store,
            merge,
        }
    }

    pub async fn list(
        &self,
        tenant_id: TenantId,
        filters: &ReviewFilters,
    ) -> Result<Vec<ReviewQueueRecord>, MergeServiceError> {
        Ok(self.reviews.list_reviews(tenant_id, filters).await?)
    }

    pub async fn statistics(
        &self,
        tenant_id: TenantId,
    ) -> Result<ReviewStatistics, MergeServiceError> {
        Ok(self.reviews.statistics(tenant_id).await?)
    }

    /// Apply a reviewer decision to a pending item.
    ///
    /// Emits `MergeReviewDecision`; on `approve` additionally executes the
    /// merge with `merge_reason = "user_approved"`. `select_canonical`
    /// chooses the survivor (defaults to `entity_a`).
    #[instrument(skip(self, notes), fields(%review_item_id, ?decision), err)]
    pub async fn decide(
        &self,
        tenant_id: TenantId,
        review_item_id: Uuid,
        decision: ReviewDecision,
        reviewer: UserId,
        notes: Option<String>,
        select_canonical: Option<EntityId>,
    ) -> Result<ReviewOutcome, MergeServiceError> {
        let item = self
            .reviews
            .get_review(tenant_id, review_item_id)
            .await?
            .ok_or_else(|| {
                DomainError::not_found(format!("review item {review_item_id} not found"))
            })?;

        if item.status != ReviewStatus::Pending {
            return Err(DomainError::conflict(format!(
                "review item {review_item_id} is {} and cannot be decided",
                item.status.as_str()
            ))
            .into());
        }

        if let Some(canonical) = select_canonical {
            if canonical != item.entity_a_id && canonical != item.entity_b_id {
                return Err(DomainError::validation(
                    "select_canonical must be one of the pair",
                )
                .into());
            }
        }

        let decision_event_id = Uuid::now_v7();
        let event = ConsolidationEvent::MergeReviewDecision(MergeReviewDecision {
            tenant_id,
            review_item_id,
            entity_a_id: item.entity_a_id,
            entity_b_id: item.entity_b_id,
            decision,
            reviewer_user_id: reviewer,
            reviewer_notes: notes,
            original_confidence: item.confidence,
            occurred_at: Utc::now(),
        });

        self.event_store
            .append(
                AggregateId::from_uuid(decision_event_id),
                CONSOLIDATION_AGGREGATE_TYPE,
                vec![UncommittedEvent::from_typed(
                    decision_event_id,
                    Some(tenant_id),
                    &event,
                )?],
                ExpectedVersion::NoStream,
            )
            .await?;

        let merge_event_id = if decision == ReviewDecision::Approve {
            let canonical = select_canonical.unwrap_or(item.entity_a_id);
            let merged = if canonical == item.entity_a_id {
                item.entity_b_id
            } else {
                item.entity_a_id
            };

            let scores: SimilarityScores =
                serde_json::from_value(item.similarity_scores.clone()).unwrap_or_default();

            let execution = self
                .merge
                .merge(MergeRequest {
                    tenant_id,
                    canonical_entity_id: canonical,
                    merged_entity_ids: vec![merged],
                    merge_reason: "user_approved".to_string(),
                    similarity_scores: scores,
                    merged_by_user_id: Some(reviewer),
                })
                .await?;
            Some(execution.merge_event_id)
        } else {
            None
        };

        info!(%decision_event_id, approved = merge_event_id.is_some(), "review decided");
        Ok(ReviewOutcome {
            decision_event_id,
            merge_event_id,
        })
    }
}
