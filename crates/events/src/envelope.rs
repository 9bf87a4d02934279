use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kmapper_core::{AggregateId, TenantId};

/// Envelope for an event, containing multi-tenant + stream metadata.
///
/// The envelope is the unit of persistence and publication: it wraps a
/// domain event payload with the infrastructure metadata (tenant, stream
/// identity, ordering) needed for event sourcing in a multi-tenant system.
///
/// `tenant_id` is `None` only for tenant-global events (e.g. maintenance
/// streams); everything written on behalf of a tenant carries its id and is
/// filtered by it on every read path.
///
/// `aggregate_version` is 1-based and dense per stream. `global_position`
/// orders events across streams; it is assigned at commit and may contain
/// gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: Option<TenantId>,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream (1-based).
    aggregate_version: u64,

    /// Commit-order position across all streams (0 when not yet persisted).
    global_position: u64,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        tenant_id: Option<TenantId>,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        aggregate_version: u64,
        global_position: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            aggregate_version,
            global_position,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_version(&self) -> u64 {
        self.aggregate_version
    }

    pub fn global_position(&self) -> u64 {
        self.global_position
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Map the payload while keeping all metadata.
    pub fn map_payload<T>(self, f: impl FnOnce(E) -> T) -> EventEnvelope<T> {
        EventEnvelope {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            aggregate_version: self.aggregate_version,
            global_position: self.global_position,
            payload: f(self.payload),
        }
    }
}
