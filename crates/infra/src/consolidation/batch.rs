//! Batch consolidation job.
//!
//! Iterates a tenant's canonical entities, runs blocking → scoring →
//! routing for each, merges or queues review per the thresholds, and emits
//! progress events. Per-entity failures are accumulated and the job
//! continues; only event-log failures at the boundaries are fatal.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use kmapper_consolidation::events::{
    BatchConsolidationCompleted, BatchConsolidationFailed, BatchConsolidationProgress,
    BatchConsolidationStarted, ConsolidationEvent, MergeCandidateIdentified, MergeQueuedForReview,
};
use kmapper_consolidation::merge::{MergeRequest, canonical_pair};
use kmapper_consolidation::{ConsolidationConfig, RouteDecision, ScoringResult};
use kmapper_core::{AggregateId, EntityId, ExpectedVersion, TenantId, UserId};

use crate::event_store::{EventStore, EventStoreError, UncommittedEvent};
use crate::read_model::{EntityRecord, EntityStore};

use super::blocking::BlockingEngine;
use super::merge_service::{CONSOLIDATION_AGGREGATE_TYPE, MergeService};
use super::scoring::CombinedScoringPipeline;

/// Stream type for batch job streams.
const BATCH_AGGREGATE_TYPE: &str = "consolidation_batch";

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Score and route but never execute merges.
    pub dry_run: bool,
    /// Cap on merges for this run; reviews still queue once reached.
    pub max_merges: Option<u64>,
    /// Page size when streaming canonical entities.
    pub batch_size: usize,
    /// Emit a progress event every N processed entities.
    pub progress_every: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_merges: None,
            batch_size: 100,
            progress_every: 100,
        }
    }
}

/// Final counters for a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub job_id: Uuid,
    pub entities_processed: u64,
    pub candidates_found: u64,
    pub merges_performed: u64,
    pub reviews_queued: u64,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

pub struct BatchConsolidationJob {
    entities: Arc<dyn EntityStore>,
    event_store: Arc<dyn EventStore>,
    blocking: BlockingEngine,
    scoring: Arc<CombinedScoringPipeline>,
    merge: Arc<MergeService>,
    config: ConsolidationConfig,
}

impl BatchConsolidationJob {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        event_store: Arc<dyn EventStore>,
        blocking: BlockingEngine,
        scoring: Arc<CombinedScoringPipeline>,
        merge: Arc<MergeService>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            entities,
            event_store,
            blocking,
            scoring,
            merge,
            config,
        }
    }

    /// Run consolidation over every canonical entity of the tenant.
    #[instrument(skip(self, options), fields(%tenant_id, dry_run = options.dry_run), err)]
    pub async fn run(
        &self,
        tenant_id: TenantId,
        actor_id: Option<UserId>,
        options: BatchOptions,
    ) -> Result<BatchReport, EventStoreError> {
        let started = Instant::now();
        let job_id = Uuid::now_v7();
        let job_stream = AggregateId::from_uuid(job_id);

        let entity_count = self
            .entities
            .count_canonical(tenant_id)
            .await
            .map_err(|e| EventStoreError::Storage(e.to_string()))?;

        self.emit(
            job_stream,
            tenant_id,
            ConsolidationEvent::BatchConsolidationStarted(BatchConsolidationStarted {
                tenant_id,
                job_id,
                entity_count,
                actor_id,
                occurred_at: Utc::now(),
            }),
        )
        .await?;

        let mut report = BatchReport {
            job_id,
            entities_processed: 0,
            candidates_found: 0,
            merges_performed: 0,
            reviews_queued: 0,
            errors: vec![],
            duration_seconds: 0.0,
        };
        let mut processed_pairs: HashSet<(EntityId, EntityId)> = HashSet::new();
        let mut offset = 0usize;

        'stream: loop {
            let page = match self
                .entities
                .list_canonical(tenant_id, offset, options.batch_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    // Cannot even read the entity stream: the job is fatal.
                    self.emit(
                        job_stream,
                        tenant_id,
                        ConsolidationEvent::BatchConsolidationFailed(BatchConsolidationFailed {
                            tenant_id,
                            job_id,
                            error_message: err.to_string(),
                            entities_processed: report.entities_processed,
                            occurred_at: Utc::now(),
                        }),
                    )
                    .await?;
                    return Err(EventStoreError::Storage(err.to_string()));
                }
            };

            if page.is_empty() {
                break 'stream;
            }
            offset += page.len();

            for entity in page {
                if let Err(message) = self
                    .process_entity(
                        tenant_id,
                        job_stream,
                        &entity,
                        &options,
                        &mut processed_pairs,
                        &mut report,
                    )
                    .await
                {
                    warn!(entity_id = %entity.id, error = %message, "batch entity failed, continuing");
                    report.errors.push(format!("{}: {}", entity.id, message));
                }

                report.entities_processed += 1;
                if report.entities_processed % options.progress_every == 0 {
                    self.emit(
                        job_stream,
                        tenant_id,
                        ConsolidationEvent::BatchConsolidationProgress(
                            BatchConsolidationProgress {
                                tenant_id,
                                job_id,
                                entities_processed: report.entities_processed,
                                candidates_found: report.candidates_found,
                                merges_performed: report.merges_performed,
                                reviews_queued: report.reviews_queued,
                                occurred_at: Utc::now(),
                            },
                        ),
                    )
                    .await?;
                }
            }
        }

        report.duration_seconds = started.elapsed().as_secs_f64();

        self.emit(
            job_stream,
            tenant_id,
            ConsolidationEvent::BatchConsolidationCompleted(BatchConsolidationCompleted {
                tenant_id,
                job_id,
                entities_processed: report.entities_processed,
                candidates_found: report.candidates_found,
                merges_performed: report.merges_performed,
                reviews_queued: report.reviews_queued,
                duration_seconds: report.duration_seconds,
                errors: report.errors.clone(),
                occurred_at: Utc::now(),
            }),
        )
        .await?;

        info!(
            %job_id,
            entities = report.entities_processed,
            merges = report.merges_performed,
            reviews = report.reviews_queued,
            errors = report.errors.len(),
            "batch consolidation completed"
        );
        Ok(report)
    }

    async fn process_entity(
        &self,
        tenant_id: TenantId,
        job_stream: AggregateId,
        entity: &EntityRecord,
        options: &BatchOptions,
        processed_pairs: &mut HashSet<(EntityId, EntityId)>,
        report: &mut BatchReport,
    ) -> Result<(), String> {
        // The entity may have been demoted by an earlier merge this run.
        let current = self
            .entities
            .get_entity(tenant_id, entity.id)
            .await
            .map_err(|e| e.to_string())?;
        let Some(current) = current else {
            return Ok(());
        };
        if !current.is_canonical {
            return Ok(());
        }

        let blocking = self
            .blocking
            .find_candidates(self.entities.as_ref(), &current, tenant_id, Some(&self.config))
            .await
            .map_err(|e| e.to_string())?;
        report.candidates_found += blocking.total_candidates as u64;

        if blocking.candidates.is_empty() {
            return Ok(());
        }

        let source_view = current.to_view();
        let candidate_views: Vec<_> = blocking.candidates.iter().map(|c| c.to_view()).collect();
        let results = self.scoring.score_candidates(&source_view, &candidate_views).await;

        for result in results {
            let pair = canonical_pair(result.entity_a_id, result.entity_b_id);
            if !processed_pairs.insert(pair) {
                continue;
            }

            match result.decision() {
                RouteDecision::AutoMerge => {
                    self.emit_candidate(job_stream, tenant_id, &blocking.matched_keys, &result)
                        .await
                        .map_err(|e| e.to_string())?;

                    if options.dry_run {
                        continue;
                    }
                    if let Some(max) = options.max_merges {
                        if report.merges_performed >= max {
                            continue;
                        }
                    }

                    match self
                        .merge
                        .merge(MergeRequest {
                            tenant_id,
                            canonical_entity_id: result.entity_a_id,
                            merged_entity_ids: vec![result.entity_b_id],
                            merge_reason: "auto_merge".to_string(),
                            similarity_scores: result.scores,
                            merged_by_user_id: None,
                        })
                        .await
                    {
                        Ok(_) => report.merges_performed += 1,
                        Err(err) => {
                            report
                                .errors
                                .push(format!("merge {pair:?} failed: {err}"));
                        }
                    }
                }
                RouteDecision::Review => {
                    self.emit_candidate(job_stream, tenant_id, &blocking.matched_keys, &result)
                        .await
                        .map_err(|e| e.to_string())?;

                    let (entity_a_id, entity_b_id) = pair;
                    self.emit(
                        job_stream,
                        tenant_id,
                        ConsolidationEvent::MergeQueuedForReview(MergeQueuedForReview {
                            tenant_id,
                            entity_a_id,
                            entity_b_id,
                            confidence: result.combined_score,
                            review_priority: (result.combined_score * 100.0).round() as i32,
                            queue_reason: "medium_confidence".to_string(),
                            similarity_scores: result.scores,
                            occurred_at: Utc::now(),
                        }),
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                    report.reviews_queued += 1;
                }
                RouteDecision::Reject => {}
            }

            // Cooperative yield between pair computations.
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    async fn emit_candidate(
        &self,
        job_stream: AggregateId,
        tenant_id: TenantId,
        matched_keys: &std::collections::HashMap<EntityId, Vec<String>>,
        result: &ScoringResult,
    ) -> Result<(), EventStoreError> {
        self.emit(
            job_stream,
            tenant_id,
            ConsolidationEvent::MergeCandidateIdentified(MergeCandidateIdentified {
                tenant_id,
                entity_a_id: result.entity_a_id,
                entity_b_id: result.entity_b_id,
                combined_confidence: result.combined_score,
                similarity_scores: result.scores,
                blocking_keys_matched: matched_keys
                    .get(&result.entity_b_id)
                    .cloned()
                    .unwrap_or_default(),
                occurred_at: Utc::now(),
            }),
        )
        .await
    }

    async fn emit(
        &self,
        job_stream: AggregateId,
        tenant_id: TenantId,
        event: ConsolidationEvent,
    ) -> Result<(), EventStoreError> {
        self.event_store
            .append(
                job_stream,
                BATCH_AGGREGATE_TYPE,
                vec![UncommittedEvent::from_typed(
                    Uuid::now_v7(),
                    Some(tenant_id),
                    &event,
                )?],
                ExpectedVersion::Any,
            )
            .await?;
        Ok(())
    }
}
