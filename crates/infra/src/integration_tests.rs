//! End-to-end scenarios over the in-memory stores: commands → event log →
//! outbox → projections → read model + graph → consolidation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use kmapper_consolidation::events::ReviewDecision;
use kmapper_consolidation::merge::UndoRequest;
use kmapper_consolidation::{ConsolidationConfig, FeatureWeights, ReviewFilters, ReviewStatus};
use kmapper_core::{AggregateId, EntityId, PageId, RelationshipId, TenantId, UserId};
use kmapper_extraction::process::{
    CompleteExtraction, ExtractionCommand, RecordEntity, RecordRelationship, RequestExtraction,
    StartExtraction,
};
use kmapper_events::EventBus;
use kmapper_graph::{GraphStore, InMemoryGraphStore};
use kmapper_inference::{EmbeddingProvider, ProviderError};

use crate::consolidation::{
    BatchConsolidationJob, BatchOptions, BlockingEngine, CombinedScoringPipeline,
    EmbeddingSimilarityService, MergeService, ReviewQueueService,
};
use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore};
use crate::outbox::{InMemoryOutboxStore, OutboxPublisher, PublisherConfig};
use crate::projections::{
    GraphSyncProjection, InMemoryCheckpointStore, InMemoryDeadLetterStore, ProjectionRuntime,
    ReadModelProjection,
};
use crate::read_model::{EntityStore, InMemoryReadModel, MergeHistoryStore, ReviewStore};
use crate::repository::AggregateRepository;

struct World {
    event_store: Arc<InMemoryEventStore>,
    outbox: Arc<InMemoryOutboxStore>,
    read_model: Arc<InMemoryReadModel>,
    graph: Arc<InMemoryGraphStore>,
    runtime: ProjectionRuntime,
    read_projection: ReadModelProjection,
    graph_projection: GraphSyncProjection,
    tenant: TenantId,
}

fn world() -> World {
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let event_store = Arc::new(InMemoryEventStore::with_outbox(outbox.clone()));
    let read_model = Arc::new(InMemoryReadModel::new());
    let graph = Arc::new(InMemoryGraphStore::new());

    let runtime = ProjectionRuntime::new(
        event_store.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(InMemoryDeadLetterStore::new()),
    );

    let read_projection =
        ReadModelProjection::new(read_model.clone(), read_model.clone(), read_model.clone());
    let graph_projection =
        GraphSyncProjection::new(graph.clone(), read_model.clone(), read_model.clone());

    World {
        event_store,
        outbox,
        read_model,
        graph,
        runtime,
        read_projection,
        graph_projection,
        tenant: TenantId::new(),
    }
}

impl World {
    async fn project_all(&self) {
        self.runtime.run_to_end(&self.read_projection).await.unwrap();
        self.runtime.run_to_end(&self.graph_projection).await.unwrap();
    }

    fn repository(
        &self,
    ) -> AggregateRepository<kmapper_extraction::ExtractionProcess, Arc<dyn EventStore>> {
        AggregateRepository::new(self.event_store.clone() as Arc<dyn EventStore>)
    }

    fn merge_service(&self) -> Arc<MergeService> {
        Arc::new(MergeService::new(
            self.event_store.clone() as Arc<dyn EventStore>,
            self.read_model.clone(),
            self.read_model.clone(),
            self.read_model.clone(),
        ))
    }
}

/// Drives a full extraction for one page through the aggregate and returns
/// the recorded entity ids by name.
async fn run_extraction(
    world: &World,
    page_id: PageId,
    names: &[&str],
    relationship: Option<(&str, &str)>,
) -> (AggregateId, std::collections::HashMap<String, EntityId>) {
    let repository = world.repository();
    let process_id = AggregateId::new();
    let mut context = repository.load_or_create(process_id).await.unwrap();

    context
        .execute(&ExtractionCommand::RequestExtraction(RequestExtraction {
            tenant_id: world.tenant,
            page_id,
            page_url: "https://x/a".to_string(),
            content_hash: "h1".to_string(),
            extraction_config: None,
            occurred_at: Utc::now(),
        }))
        .unwrap();
    context
        .execute(&ExtractionCommand::Start(StartExtraction {
            worker_id: "w1".to_string(),
            occurred_at: Utc::now(),
        }))
        .unwrap();

    let mut ids = std::collections::HashMap::new();
    for name in names {
        let entity_id = EntityId::new();
        ids.insert(name.to_string(), entity_id);
        context
            .execute(&ExtractionCommand::RecordEntity(RecordEntity {
                entity_id,
                entity_type: "ORG".to_string(),
                name: name.to_string(),
                normalized_name: name.to_lowercase(),
                properties: json!({}),
                description: None,
                confidence: 0.9,
                extraction_method: "llm".to_string(),
                source_text: None,
                occurred_at: Utc::now(),
            }))
            .unwrap();
    }

    if let Some((source, target)) = relationship {
        context
            .execute(&ExtractionCommand::RecordRelationship(RecordRelationship {
                relationship_id: RelationshipId::new(),
                source_entity_name: source.to_string(),
                target_entity_name: target.to_string(),
                relationship_type: "RELATED_TO".to_string(),
                confidence_score: 0.8,
                context: None,
                occurred_at: Utc::now(),
            }))
            .unwrap();
    }

    context
        .execute(&ExtractionCommand::Complete(CompleteExtraction {
            duration_ms: 1500,
            extraction_method: "llm".to_string(),
            occurred_at: Utc::now(),
        }))
        .unwrap();

    repository.save(&mut context).await.unwrap();
    (process_id, ids)
}

/// Stub embedding provider: texts sharing a first word embed identically,
/// anything else is orthogonal. Close enough to let "ACME Corp" and
/// "ACME Corporation" read as semantically identical.
struct StubEmbeddings;

fn stub_vector(text: &str) -> Vec<f32> {
    match text.split_whitespace().next() {
        Some(word) if word.eq_ignore_ascii_case("acme") => vec![1.0, 0.0, 0.0],
        _ => vec![0.0, 1.0, 0.0],
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for StubEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(stub_vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| stub_vector(t)).collect())
    }
}

/// Weights that let semantically-identical entities clear the auto-merge
/// threshold even when surface forms differ.
fn embedding_heavy_config() -> ConsolidationConfig {
    ConsolidationConfig {
        feature_weights: FeatureWeights {
            jaro_winkler: 0.1,
            normalized_exact: 0.0,
            type_match: 0.1,
            embedding_cosine: 0.8,
            graph_neighborhood: 0.0,
        },
        enable_embedding_similarity: true,
        enable_graph_similarity: false,
        ..Default::default()
    }
}

fn batch_job(world: &World, config: ConsolidationConfig) -> BatchConsolidationJob {
    let embedding = Arc::new(EmbeddingSimilarityService::new(Arc::new(StubEmbeddings)));
    let scoring = Arc::new(CombinedScoringPipeline::new(config.clone()).with_embedding(embedding));

    BatchConsolidationJob::new(
        world.read_model.clone(),
        world.event_store.clone() as Arc<dyn EventStore>,
        BlockingEngine::default(),
        scoring,
        world.merge_service(),
        config,
    )
}

#[tokio::test]
async fn extraction_happy_path_populates_both_stores() {
    let world = world();
    let page = PageId::new();

    let (process_id, ids) = run_extraction(&world, page, &["A", "B"], Some(("A", "B"))).await;

    // Six events in the stream: requested, started, 2 entities, 1
    // relationship, completed.
    let stream = world.event_store.load(process_id, "extraction_process").await.unwrap();
    assert_eq!(stream.version, 6);

    world.project_all().await;

    assert_eq!(world.read_model.count_canonical(world.tenant).await.unwrap(), 2);
    assert_eq!(world.graph.node_count(world.tenant), 2);

    let edges = world.graph.edges(world.tenant);
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].source, ids["A"]);
    assert_eq!(edges[0].target, ids["B"]);

    // Rows carry the graph sync markers.
    let row = world
        .read_model
        .get_entity(world.tenant, ids["A"])
        .await
        .unwrap()
        .unwrap();
    assert!(row.synced_to_graph);
}

#[tokio::test]
async fn every_committed_event_has_an_outbox_row() {
    let world = world();
    run_extraction(&world, PageId::new(), &["A", "B"], Some(("A", "B"))).await;

    let events = world.event_store.read_from(0, 1000).await.unwrap();
    let outbox_rows = world.outbox.all();
    assert_eq!(events.len(), outbox_rows.len());

    let event_ids: std::collections::HashSet<Uuid> =
        events.iter().map(|e| e.event_id).collect();
    assert!(outbox_rows.iter().all(|row| event_ids.contains(&row.event_id)));
}

#[tokio::test]
async fn outbox_publisher_fans_out_committed_events() {
    let world = world();
    run_extraction(&world, PageId::new(), &["A"], None).await;

    let bus = Arc::new(kmapper_events::InMemoryEventBus::new());
    let subscription = bus.subscribe();
    let publisher = OutboxPublisher::new(world.outbox.clone(), bus, PublisherConfig::default());

    let published = publisher.run_once().await.unwrap();
    assert_eq!(published, 4);
    assert!(subscription.try_recv().is_ok());
}

#[tokio::test]
async fn concurrent_saves_conflict_exactly_once() {
    let world = world();
    let repository = world.repository();
    let id = AggregateId::new();

    let request = |tenant| {
        ExtractionCommand::RequestExtraction(RequestExtraction {
            tenant_id: tenant,
            page_id: PageId::new(),
            page_url: "https://x/b".to_string(),
            content_hash: "h2".to_string(),
            extraction_config: None,
            occurred_at: Utc::now(),
        })
    };

    let mut first = repository.load_or_create(id).await.unwrap();
    let mut second = repository.load_or_create(id).await.unwrap();
    first.execute(&request(world.tenant)).unwrap();
    second.execute(&request(world.tenant)).unwrap();

    repository.save(&mut first).await.unwrap();
    let err = repository.save(&mut second).await.unwrap_err();
    assert!(matches!(
        err,
        crate::repository::RepositoryError::Store(EventStoreError::OptimisticLock {
            expected: 0,
            actual: 1
        })
    ));
}

#[tokio::test]
async fn auto_merge_scenario_converges_both_stores() {
    let world = world();
    let page = PageId::new();

    // e1, e2 are near-duplicates; Widget is connected to e2.
    let (_, ids) = run_extraction(
        &world,
        page,
        &["ACME Corp", "ACME Corporation", "Widget"],
        Some(("ACME Corporation", "Widget")),
    )
    .await;
    world.project_all().await;

    let e1 = ids["ACME Corp"];
    let e2 = ids["ACME Corporation"];

    let report = batch_job(&world, embedding_heavy_config())
        .run(world.tenant, None, BatchOptions::default())
        .await
        .unwrap();
    assert!(report.merges_performed >= 1);
    world.project_all().await;

    // Relational: e2 demoted to alias of a canonical survivor.
    let e2_row = world.read_model.get_entity(world.tenant, e2).await.unwrap().unwrap();
    assert!(!e2_row.is_canonical);
    let canonical_id = e2_row.is_alias_of.unwrap();
    let canonical_row = world
        .read_model
        .get_entity(world.tenant, canonical_id)
        .await
        .unwrap()
        .unwrap();
    assert!(canonical_row.is_canonical);

    // Graph: the merged node is gone and its edge moved to the canonical.
    assert!(world.graph.node(world.tenant, e2).is_none() || canonical_id == e2);
    let edges = world.graph.edges(world.tenant);
    assert_eq!(edges.len(), 1);
    assert!(edges[0].source == canonical_id || edges[0].target == canonical_id);

    // An AliasCreated event accompanied the merge.
    let events = world.event_store.read_from(0, 1000).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "consolidation.alias.created"));

    // History is undoable.
    let merges = world.read_model.list_merges(world.tenant, 10).await.unwrap();
    assert_eq!(merges.len(), 1);
    assert!(merges[0].can_undo);

    let _ = e1;
}

#[tokio::test]
async fn review_then_approve_merges_like_auto_merge() {
    let world = world();
    let page = PageId::new();

    let (_, ids) =
        run_extraction(&world, page, &["ACME Corp", "ACME Corporation"], None).await;
    world.project_all().await;

    let e1 = ids["ACME Corp"];
    let e2 = ids["ACME Corporation"];

    // String-only scoring lands this pair in the review band.
    let config = ConsolidationConfig {
        enable_embedding_similarity: false,
        enable_graph_similarity: false,
        ..Default::default()
    };
    let report = batch_job(&world, config).run(world.tenant, None, BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(report.merges_performed, 0);
    assert_eq!(report.reviews_queued, 1);
    world.project_all().await;

    let pending = world
        .read_model
        .list_reviews(
            world.tenant,
            &ReviewFilters {
                status: Some(ReviewStatus::Pending),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let review_service = ReviewQueueService::new(
        world.read_model.clone(),
        world.event_store.clone() as Arc<dyn EventStore>,
        world.merge_service(),
    );

    let outcome = review_service
        .decide(
            world.tenant,
            pending[0].id,
            ReviewDecision::Approve,
            UserId::new(),
            Some("same organization".to_string()),
            Some(e1),
        )
        .await
        .unwrap();
    assert!(outcome.merge_event_id.is_some());
    world.project_all().await;

    let e2_row = world.read_model.get_entity(world.tenant, e2).await.unwrap().unwrap();
    assert!(!e2_row.is_canonical);
    assert_eq!(e2_row.is_alias_of, Some(e1));

    let decided = world
        .read_model
        .get_review(world.tenant, pending[0].id)
        .await
        .unwrap()
        .unwrap();
    // The merge expires the pending item before the decision event lands;
    // either terminal state proves the item left the queue.
    assert!(matches!(
        decided.status,
        ReviewStatus::Approved | ReviewStatus::Expired
    ));
}

#[tokio::test]
async fn undo_restores_the_merged_entity() {
    let world = world();
    let page = PageId::new();

    let (_, ids) = run_extraction(&world, page, &["ACME Corp", "ACME Corporation"], None).await;
    world.project_all().await;

    let e1 = ids["ACME Corp"];
    let e2 = ids["ACME Corporation"];

    // Merge directly (the batch path is covered elsewhere).
    let merge_service = world.merge_service();
    let execution = merge_service
        .merge(kmapper_consolidation::merge::MergeRequest {
            tenant_id: world.tenant,
            canonical_entity_id: e1,
            merged_entity_ids: vec![e2],
            merge_reason: "auto_merge".to_string(),
            similarity_scores: Default::default(),
            merged_by_user_id: None,
        })
        .await
        .unwrap();
    world.project_all().await;

    assert!(world.graph.node(world.tenant, e2).is_none());

    merge_service
        .undo(UndoRequest {
            tenant_id: world.tenant,
            original_merge_event_id: execution.merge_event_id,
            restore_entity_ids: vec![e2],
            undo_reason: "wrong merge".to_string(),
            undone_by_user_id: UserId::new(),
        })
        .await
        .unwrap();
    world.project_all().await;

    // Relational row restored by the service.
    let e2_row = world.read_model.get_entity(world.tenant, e2).await.unwrap().unwrap();
    assert!(e2_row.is_canonical);
    assert_eq!(e2_row.is_alias_of, None);

    // Canonical gained undo metadata.
    let e1_row = world.read_model.get_entity(world.tenant, e1).await.unwrap().unwrap();
    assert!(e1_row.properties.get("_undo_event_id").is_some());

    // Graph placeholder exists awaiting re-sync.
    let placeholder = world.graph.node(world.tenant, e2).unwrap();
    assert!(placeholder.restored_from_merge);
    assert_eq!(placeholder.name, "");

    // A later re-sync of the entity restores its full properties.
    world
        .graph
        .upsert_entity_node(&kmapper_graph::EntityNode {
            entity_id: e2,
            tenant_id: world.tenant,
            name: "ACME Corporation".to_string(),
            entity_type: "ORG".to_string(),
            description: None,
            properties: json!({}),
        })
        .await
        .unwrap();
    let node = world.graph.node(world.tenant, e2).unwrap();
    assert_eq!(node.name, "ACME Corporation");
    assert!(!node.restored_from_merge);
}

#[tokio::test]
async fn projections_are_idempotent_under_replay() {
    let world = world();
    run_extraction(&world, PageId::new(), &["A", "B"], Some(("A", "B"))).await;

    world.project_all().await;
    let entities_once = world.read_model.count_canonical(world.tenant).await.unwrap();
    let edges_once = world.graph.edges(world.tenant).len();

    // Replay everything through a second runtime with fresh checkpoints.
    let replay_runtime = ProjectionRuntime::new(
        world.event_store.clone() as Arc<dyn EventStore>,
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(InMemoryDeadLetterStore::new()),
    );
    replay_runtime.run_to_end(&world.read_projection).await.unwrap();
    replay_runtime.run_to_end(&world.graph_projection).await.unwrap();

    assert_eq!(
        world.read_model.count_canonical(world.tenant).await.unwrap(),
        entities_once
    );
    assert_eq!(world.graph.edges(world.tenant).len(), edges_once);
}
