//! Merge / undo / split command validation.
//!
//! These checks run before any event is emitted; the executing service in
//! `kmapper-infra` loads the affected read-model rows and passes them in.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kmapper_core::{DomainError, EntityId, TenantId, UserId};

use crate::events::SimilarityScores;
use crate::similarity::EntityView;

/// Request to merge one or more entities into a canonical survivor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub tenant_id: TenantId,
    pub canonical_entity_id: EntityId,
    pub merged_entity_ids: Vec<EntityId>,
    pub merge_reason: String,
    pub similarity_scores: SimilarityScores,
    pub merged_by_user_id: Option<UserId>,
}

/// Request to undo a previous merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoRequest {
    pub tenant_id: TenantId,
    pub original_merge_event_id: Uuid,
    pub restore_entity_ids: Vec<EntityId>,
    pub undo_reason: String,
    pub undone_by_user_id: UserId,
}

/// Request to split an entity into at least two new ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub tenant_id: TenantId,
    pub original_entity_id: EntityId,
    pub new_entity_names: Vec<String>,
    /// relationship id → index into `new_entity_names`.
    pub relationship_assignments: Option<std::collections::HashMap<Uuid, usize>>,
    pub split_reason: String,
    pub split_by_user_id: UserId,
}

/// Validate a merge against the loaded entities.
///
/// Rules:
/// - at least one merged entity, canonical not among them;
/// - every entity exists and belongs to the request tenant;
/// - the canonical and every merged entity are canonical themselves
///   (aliases never point to aliases; chains have length 1).
pub fn validate_merge(
    request: &MergeRequest,
    canonical: Option<&EntityView>,
    merged: &[Option<EntityView>],
) -> Result<(), DomainError> {
    if request.merged_entity_ids.is_empty() {
        return Err(DomainError::validation(
            "at least one entity must be merged",
        ));
    }
    if request
        .merged_entity_ids
        .contains(&request.canonical_entity_id)
    {
        return Err(DomainError::validation(
            "canonical entity cannot be merged into itself",
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for id in &request.merged_entity_ids {
        if !seen.insert(*id) {
            return Err(DomainError::validation(format!(
                "duplicate merged entity id {id}"
            )));
        }
    }

    let canonical = canonical.ok_or_else(|| {
        DomainError::not_found(format!(
            "canonical entity {} not found",
            request.canonical_entity_id
        ))
    })?;
    ensure_tenant(canonical, request.tenant_id)?;
    if !canonical.is_canonical {
        return Err(DomainError::alias_chain(canonical.id));
    }

    for (id, entity) in request.merged_entity_ids.iter().zip(merged.iter()) {
        let entity = entity
            .as_ref()
            .ok_or_else(|| DomainError::not_found(format!("entity {id} not found")))?;
        ensure_tenant(entity, request.tenant_id)?;
        if !entity.is_canonical {
            return Err(DomainError::alias_chain(entity.id));
        }
    }

    Ok(())
}

/// Validate a split request against the loaded original entity.
pub fn validate_split(
    request: &SplitRequest,
    original: Option<&EntityView>,
) -> Result<(), DomainError> {
    if request.new_entity_names.len() < 2 {
        return Err(DomainError::validation(
            "a split must produce at least two new entities",
        ));
    }
    if request
        .new_entity_names
        .iter()
        .any(|name| name.trim().is_empty())
    {
        return Err(DomainError::validation("new entity names cannot be empty"));
    }
    if let Some(assignments) = &request.relationship_assignments {
        for index in assignments.values() {
            if *index >= request.new_entity_names.len() {
                return Err(DomainError::validation(format!(
                    "relationship assignment index {index} out of range"
                )));
            }
        }
    }

    let original = original.ok_or_else(|| {
        DomainError::not_found(format!(
            "entity {} not found",
            request.original_entity_id
        ))
    })?;
    ensure_tenant(original, request.tenant_id)?;
    if !original.is_canonical {
        return Err(DomainError::alias_chain(original.id));
    }

    Ok(())
}

fn ensure_tenant(entity: &EntityView, tenant_id: TenantId) -> Result<(), DomainError> {
    if entity.tenant_id != tenant_id {
        return Err(DomainError::tenant_mismatch(tenant_id, entity.id));
    }
    Ok(())
}

/// Canonical pair ordering for review-queue uniqueness: lexicographic over
/// the UUID string representation, matching the relational unique key.
pub fn canonical_pair(a: EntityId, b: EntityId) -> (EntityId, EntityId) {
    if a.to_string() <= b.to_string() { (a, b) } else { (b, a) }
}
