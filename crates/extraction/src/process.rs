use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use kmapper_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, EntityId, PageId, RelationshipId, TenantId,
};
use kmapper_events::Event;

/// Extraction process identifier (one process per crawled page revision).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub AggregateId);

impl ProcessId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle phase of an extraction process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionPhase {
    Requested,
    InProgress,
    Completed,
    Failed,
    RetryScheduled,
}

/// Aggregate root: one LLM extraction run over one page.
///
/// Commands validate against the phase machine and emit events; all state
/// changes happen in `apply`. Entity and relationship counts are tracked so
/// `Complete` can stamp them onto the completion event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionProcess {
    id: ProcessId,
    tenant_id: Option<TenantId>,
    page_id: Option<PageId>,
    phase: Option<ExtractionPhase>,
    entity_count: u32,
    relationship_count: u32,
    retry_count: u32,
    version: u64,
}

impl ExtractionProcess {
    /// Create an empty, not-yet-requested instance for rehydration.
    pub fn empty(id: ProcessId) -> Self {
        Self {
            id,
            tenant_id: None,
            page_id: None,
            phase: None,
            entity_count: 0,
            relationship_count: 0,
            retry_count: 0,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> ProcessId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn page_id(&self) -> Option<PageId> {
        self.page_id
    }

    pub fn phase(&self) -> Option<ExtractionPhase> {
        self.phase
    }

    pub fn entity_count(&self) -> u32 {
        self.entity_count
    }

    pub fn relationship_count(&self) -> u32 {
        self.relationship_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

impl AggregateRoot for ExtractionProcess {
    type Id = ProcessId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: request extraction for a crawled page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestExtraction {
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub page_url: String,
    pub content_hash: String,
    pub extraction_config: Option<JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: a worker picked the process up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartExtraction {
    pub worker_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: record one extracted entity.
///
/// `entity_id` is assigned by the caller (`EntityId::new()` is the usual
/// choice) and is authoritative downstream: read-model rows and graph nodes
/// are keyed by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntity {
    pub entity_id: EntityId,
    pub entity_type: String,
    pub name: String,
    pub normalized_name: String,
    pub properties: JsonValue,
    pub description: Option<String>,
    pub confidence: f64,
    pub extraction_method: String,
    pub source_text: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: record one discovered relationship (endpoints by name; they are
/// resolved against the read model at projection time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRelationship {
    pub relationship_id: RelationshipId,
    pub source_entity_name: String,
    pub target_entity_name: String,
    pub relationship_type: String,
    pub confidence_score: f64,
    pub context: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: mark the run complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteExtraction {
    pub duration_ms: u64,
    pub extraction_method: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: mark the run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailExtraction {
    pub error_message: String,
    pub error_type: String,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: schedule a retry of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRetry {
    pub scheduled_for: DateTime<Utc>,
    pub backoff_seconds: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtractionCommand {
    RequestExtraction(RequestExtraction),
    Start(StartExtraction),
    RecordEntity(RecordEntity),
    RecordRelationship(RecordRelationship),
    Complete(CompleteExtraction),
    Fail(FailExtraction),
    ScheduleRetry(ScheduleRetry),
}

/// Event: extraction requested for a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequested {
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub page_url: String,
    pub content_hash: String,
    pub extraction_config: Option<JsonValue>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStarted {
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityExtracted {
    pub entity_id: EntityId,
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub entity_type: String,
    pub name: String,
    pub normalized_name: String,
    pub properties: JsonValue,
    pub description: Option<String>,
    pub confidence: f64,
    pub extraction_method: String,
    pub source_text: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDiscovered {
    pub relationship_id: RelationshipId,
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub source_entity_name: String,
    pub target_entity_name: String,
    pub relationship_type: String,
    pub confidence_score: f64,
    pub context: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionCompleted {
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub entity_count: u32,
    pub relationship_count: u32,
    pub duration_ms: u64,
    pub extraction_method: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionFailed {
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub error_message: String,
    pub error_type: String,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRetryScheduled {
    pub tenant_id: TenantId,
    pub page_id: PageId,
    pub scheduled_for: DateTime<Utc>,
    pub backoff_seconds: u64,
    pub retry_count: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ExtractionEvent {
    ExtractionRequested(ExtractionRequested),
    ExtractionStarted(ExtractionStarted),
    EntityExtracted(EntityExtracted),
    RelationshipDiscovered(RelationshipDiscovered),
    ExtractionCompleted(ExtractionCompleted),
    ExtractionFailed(ExtractionFailed),
    ExtractionRetryScheduled(ExtractionRetryScheduled),
}

impl ExtractionEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            ExtractionEvent::ExtractionRequested(e) => e.tenant_id,
            ExtractionEvent::ExtractionStarted(e) => e.tenant_id,
            ExtractionEvent::EntityExtracted(e) => e.tenant_id,
            ExtractionEvent::RelationshipDiscovered(e) => e.tenant_id,
            ExtractionEvent::ExtractionCompleted(e) => e.tenant_id,
            ExtractionEvent::ExtractionFailed(e) => e.tenant_id,
            ExtractionEvent::ExtractionRetryScheduled(e) => e.tenant_id,
        }
    }
}

impl Event for ExtractionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ExtractionEvent::ExtractionRequested(_) => "extraction.process.requested",
            ExtractionEvent::ExtractionStarted(_) => "extraction.process.started",
            ExtractionEvent::EntityExtracted(_) => "extraction.entity.extracted",
            ExtractionEvent::RelationshipDiscovered(_) => "extraction.relationship.discovered",
            ExtractionEvent::ExtractionCompleted(_) => "extraction.process.completed",
            ExtractionEvent::ExtractionFailed(_) => "extraction.process.failed",
            ExtractionEvent::ExtractionRetryScheduled(_) => "extraction.process.retry_scheduled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ExtractionEvent::ExtractionRequested(e) => e.requested_at,
            ExtractionEvent::ExtractionStarted(e) => e.started_at,
            ExtractionEvent::EntityExtracted(e) => e.occurred_at,
            ExtractionEvent::RelationshipDiscovered(e) => e.occurred_at,
            ExtractionEvent::ExtractionCompleted(e) => e.completed_at,
            ExtractionEvent::ExtractionFailed(e) => e.occurred_at,
            ExtractionEvent::ExtractionRetryScheduled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for ExtractionProcess {
    type Command = ExtractionCommand;
    type Event = ExtractionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ExtractionEvent::ExtractionRequested(e) => {
                self.tenant_id = Some(e.tenant_id);
                self.page_id = Some(e.page_id);
                self.phase = Some(ExtractionPhase::Requested);
            }
            ExtractionEvent::ExtractionStarted(_) => {
                self.phase = Some(ExtractionPhase::InProgress);
                self.entity_count = 0;
                self.relationship_count = 0;
            }
            ExtractionEvent::EntityExtracted(_) => {
                self.entity_count += 1;
            }
            ExtractionEvent::RelationshipDiscovered(_) => {
                self.relationship_count += 1;
            }
            ExtractionEvent::ExtractionCompleted(_) => {
                self.phase = Some(ExtractionPhase::Completed);
            }
            ExtractionEvent::ExtractionFailed(_) => {
                self.phase = Some(ExtractionPhase::Failed);
            }
            ExtractionEvent::ExtractionRetryScheduled(_) => {
                self.phase = Some(ExtractionPhase::RetryScheduled);
                self.retry_count += 1;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ExtractionCommand::RequestExtraction(cmd) => self.handle_request(cmd),
            ExtractionCommand::Start(cmd) => self.handle_start(cmd),
            ExtractionCommand::RecordEntity(cmd) => self.handle_record_entity(cmd),
            ExtractionCommand::RecordRelationship(cmd) => self.handle_record_relationship(cmd),
            ExtractionCommand::Complete(cmd) => self.handle_complete(cmd),
            ExtractionCommand::Fail(cmd) => self.handle_fail(cmd),
            ExtractionCommand::ScheduleRetry(cmd) => self.handle_schedule_retry(cmd),
        }
    }
}

impl ExtractionProcess {
    fn require_context(&self) -> Result<(TenantId, PageId), DomainError> {
        match (self.tenant_id, self.page_id) {
            (Some(t), Some(p)) => Ok((t, p)),
            _ => Err(DomainError::not_found("extraction process does not exist")),
        }
    }

    fn handle_request(&self, cmd: &RequestExtraction) -> Result<Vec<ExtractionEvent>, DomainError> {
        if self.phase.is_some() {
            return Err(DomainError::conflict("extraction already requested"));
        }
        if cmd.page_url.trim().is_empty() {
            return Err(DomainError::validation("page_url cannot be empty"));
        }
        if cmd.content_hash.trim().is_empty() {
            return Err(DomainError::validation("content_hash cannot be empty"));
        }

        Ok(vec![ExtractionEvent::ExtractionRequested(
            ExtractionRequested {
                tenant_id: cmd.tenant_id,
                page_id: cmd.page_id,
                page_url: cmd.page_url.clone(),
                content_hash: cmd.content_hash.clone(),
                extraction_config: cmd.extraction_config.clone(),
                requested_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_start(&self, cmd: &StartExtraction) -> Result<Vec<ExtractionEvent>, DomainError> {
        let (tenant_id, page_id) = self.require_context()?;

        match self.phase {
            Some(ExtractionPhase::Requested) | Some(ExtractionPhase::RetryScheduled) => {}
            Some(ExtractionPhase::InProgress) => {
                return Err(DomainError::conflict("extraction already in progress"));
            }
            Some(ExtractionPhase::Completed) => {
                return Err(DomainError::conflict("extraction already completed"));
            }
            Some(ExtractionPhase::Failed) => {
                return Err(DomainError::conflict(
                    "extraction failed; schedule a retry before starting",
                ));
            }
            None => return Err(DomainError::not_found("extraction process does not exist")),
        }

        if cmd.worker_id.trim().is_empty() {
            return Err(DomainError::validation("worker_id cannot be empty"));
        }

        Ok(vec![ExtractionEvent::ExtractionStarted(ExtractionStarted {
            tenant_id,
            page_id,
            worker_id: cmd.worker_id.clone(),
            started_at: cmd.occurred_at,
        })])
    }

    fn handle_record_entity(&self, cmd: &RecordEntity) -> Result<Vec<ExtractionEvent>, DomainError> {
        let (tenant_id, page_id) = self.require_context()?;
        self.require_in_progress("record_entity")?;

        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("entity name cannot be empty"));
        }
        if !(0.0..=1.0).contains(&cmd.confidence) {
            return Err(DomainError::validation("confidence must be in [0, 1]"));
        }

        Ok(vec![ExtractionEvent::EntityExtracted(EntityExtracted {
            entity_id: cmd.entity_id,
            tenant_id,
            page_id,
            entity_type: cmd.entity_type.clone(),
            name: cmd.name.clone(),
            normalized_name: cmd.normalized_name.clone(),
            properties: cmd.properties.clone(),
            description: cmd.description.clone(),
            confidence: cmd.confidence,
            extraction_method: cmd.extraction_method.clone(),
            source_text: cmd.source_text.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_relationship(
        &self,
        cmd: &RecordRelationship,
    ) -> Result<Vec<ExtractionEvent>, DomainError> {
        let (tenant_id, page_id) = self.require_context()?;
        self.require_in_progress("record_relationship")?;

        if cmd.source_entity_name == cmd.target_entity_name {
            return Err(DomainError::validation(
                "relationship endpoints must differ",
            ));
        }
        if !(0.0..=1.0).contains(&cmd.confidence_score) {
            return Err(DomainError::validation("confidence must be in [0, 1]"));
        }

        Ok(vec![ExtractionEvent::RelationshipDiscovered(
            RelationshipDiscovered {
                relationship_id: cmd.relationship_id,
                tenant_id,
                page_id,
                source_entity_name: cmd.source_entity_name.clone(),
                target_entity_name: cmd.target_entity_name.clone(),
                relationship_type: cmd.relationship_type.clone(),
                confidence_score: cmd.confidence_score,
                context: cmd.context.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_complete(&self, cmd: &CompleteExtraction) -> Result<Vec<ExtractionEvent>, DomainError> {
        let (tenant_id, page_id) = self.require_context()?;
        self.require_in_progress("complete")?;

        Ok(vec![ExtractionEvent::ExtractionCompleted(
            ExtractionCompleted {
                tenant_id,
                page_id,
                entity_count: self.entity_count,
                relationship_count: self.relationship_count,
                duration_ms: cmd.duration_ms,
                extraction_method: cmd.extraction_method.clone(),
                completed_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_fail(&self, cmd: &FailExtraction) -> Result<Vec<ExtractionEvent>, DomainError> {
        let (tenant_id, page_id) = self.require_context()?;

        match self.phase {
            Some(ExtractionPhase::Requested) | Some(ExtractionPhase::InProgress) => {}
            _ => {
                return Err(DomainError::conflict(
                    "only requested or in-progress extractions can fail",
                ));
            }
        }

        Ok(vec![ExtractionEvent::ExtractionFailed(ExtractionFailed {
            tenant_id,
            page_id,
            error_message: cmd.error_message.clone(),
            error_type: cmd.error_type.clone(),
            retryable: cmd.retryable,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_schedule_retry(&self, cmd: &ScheduleRetry) -> Result<Vec<ExtractionEvent>, DomainError> {
        let (tenant_id, page_id) = self.require_context()?;

        if self.phase != Some(ExtractionPhase::Failed) {
            return Err(DomainError::conflict(
                "retries can only be scheduled for failed extractions",
            ));
        }

        Ok(vec![ExtractionEvent::ExtractionRetryScheduled(
            ExtractionRetryScheduled {
                tenant_id,
                page_id,
                scheduled_for: cmd.scheduled_for,
                backoff_seconds: cmd.backoff_seconds,
                retry_count: self.retry_count + 1,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn require_in_progress(&self, operation: &str) -> Result<(), DomainError> {
        if self.phase != Some(ExtractionPhase::InProgress) {
            return Err(DomainError::conflict(format!(
                "{operation} requires an in-progress extraction"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_id() -> ProcessId {
        ProcessId::new(AggregateId::new())
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn requested(process: &mut ExtractionProcess, tenant_id: TenantId, page_id: PageId) {
        let events = process
            .handle(&ExtractionCommand::RequestExtraction(RequestExtraction {
                tenant_id,
                page_id,
                page_url: "https://example.test/a".to_string(),
                content_hash: "h1".to_string(),
                extraction_config: None,
                occurred_at: now(),
            }))
            .unwrap();
        process.apply(&events[0]);
    }

    fn started(process: &mut ExtractionProcess) {
        let events = process
            .handle(&ExtractionCommand::Start(StartExtraction {
                worker_id: "w1".to_string(),
                occurred_at: now(),
            }))
            .unwrap();
        process.apply(&events[0]);
    }

    fn record_entity_cmd(name: &str) -> ExtractionCommand {
        ExtractionCommand::RecordEntity(RecordEntity {
            entity_id: EntityId::new(),
            entity_type: "CONCEPT".to_string(),
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            properties: serde_json::json!({}),
            description: None,
            confidence: 0.9,
            extraction_method: "llm".to_string(),
            source_text: None,
            occurred_at: now(),
        })
    }

    #[test]
    fn request_emits_requested_event() {
        let process = ExtractionProcess::empty(process_id());
        let tenant_id = TenantId::new();
        let page_id = PageId::new();

        let events = process
            .handle(&ExtractionCommand::RequestExtraction(RequestExtraction {
                tenant_id,
                page_id,
                page_url: "https://example.test/a".to_string(),
                content_hash: "h1".to_string(),
                extraction_config: None,
                occurred_at: now(),
            }))
            .unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            ExtractionEvent::ExtractionRequested(e) => {
                assert_eq!(e.tenant_id, tenant_id);
                assert_eq!(e.page_id, page_id);
            }
            other => panic!("expected ExtractionRequested, got {other:?}"),
        }
    }

    #[test]
    fn request_rejects_duplicate() {
        let mut process = ExtractionProcess::empty(process_id());
        requested(&mut process, TenantId::new(), PageId::new());

        let err = process
            .handle(&ExtractionCommand::RequestExtraction(RequestExtraction {
                tenant_id: TenantId::new(),
                page_id: PageId::new(),
                page_url: "https://example.test/b".to_string(),
                content_hash: "h2".to_string(),
                extraction_config: None,
                occurred_at: now(),
            }))
            .unwrap_err();

        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn record_entity_requires_in_progress() {
        let mut process = ExtractionProcess::empty(process_id());
        requested(&mut process, TenantId::new(), PageId::new());

        let err = process.handle(&record_entity_cmd("Rust")).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));

        started(&mut process);
        let events = process.handle(&record_entity_cmd("Rust")).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn complete_carries_recorded_counts() {
        let mut process = ExtractionProcess::empty(process_id());
        requested(&mut process, TenantId::new(), PageId::new());
        started(&mut process);

        for name in ["A", "B"] {
            let events = process.handle(&record_entity_cmd(name)).unwrap();
            process.apply(&events[0]);
        }
        let events = process
            .handle(&ExtractionCommand::RecordRelationship(RecordRelationship {
                relationship_id: RelationshipId::new(),
                source_entity_name: "A".to_string(),
                target_entity_name: "B".to_string(),
                relationship_type: "RELATED_TO".to_string(),
                confidence_score: 0.8,
                context: None,
                occurred_at: now(),
            }))
            .unwrap();
        process.apply(&events[0]);

        let events = process
            .handle(&ExtractionCommand::Complete(CompleteExtraction {
                duration_ms: 1500,
                extraction_method: "llm".to_string(),
                occurred_at: now(),
            }))
            .unwrap();

        match &events[0] {
            ExtractionEvent::ExtractionCompleted(e) => {
                assert_eq!(e.entity_count, 2);
                assert_eq!(e.relationship_count, 1);
                assert_eq!(e.duration_ms, 1500);
            }
            other => panic!("expected ExtractionCompleted, got {other:?}"),
        }
    }

    #[test]
    fn self_relationship_is_rejected() {
        let mut process = ExtractionProcess::empty(process_id());
        requested(&mut process, TenantId::new(), PageId::new());
        started(&mut process);

        let err = process
            .handle(&ExtractionCommand::RecordRelationship(RecordRelationship {
                relationship_id: RelationshipId::new(),
                source_entity_name: "A".to_string(),
                target_entity_name: "A".to_string(),
                relationship_type: "RELATED_TO".to_string(),
                confidence_score: 0.8,
                context: None,
                occurred_at: now(),
            }))
            .unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn retry_flow_failed_then_scheduled_then_restarted() {
        let mut process = ExtractionProcess::empty(process_id());
        requested(&mut process, TenantId::new(), PageId::new());
        started(&mut process);

        let events = process
            .handle(&ExtractionCommand::Fail(FailExtraction {
                error_message: "provider timeout".to_string(),
                error_type: "timeout".to_string(),
                retryable: true,
                occurred_at: now(),
            }))
            .unwrap();
        process.apply(&events[0]);
        assert_eq!(process.phase(), Some(ExtractionPhase::Failed));

        let events = process
            .handle(&ExtractionCommand::ScheduleRetry(ScheduleRetry {
                scheduled_for: now(),
                backoff_seconds: 30,
                occurred_at: now(),
            }))
            .unwrap();
        process.apply(&events[0]);
        assert_eq!(process.phase(), Some(ExtractionPhase::RetryScheduled));
        assert_eq!(process.retry_count(), 1);

        started(&mut process);
        assert_eq!(process.phase(), Some(ExtractionPhase::InProgress));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let mut process = ExtractionProcess::empty(process_id());
        requested(&mut process, TenantId::new(), PageId::new());
        started(&mut process);

        let before = process.clone();
        let _ = process.handle(&record_entity_cmd("Rust")).unwrap();
        assert_eq!(process, before);
    }

    #[test]
    fn version_increments_on_apply() {
        let mut process = ExtractionProcess::empty(process_id());
        assert_eq!(process.version(), 0);
        requested(&mut process, TenantId::new(), PageId::new());
        assert_eq!(process.version(), 1);
        started(&mut process);
        assert_eq!(process.version(), 2);
    }
}
