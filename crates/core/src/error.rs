//! Domain error model.
//!
//! Deterministic business failures only; storage and provider errors are
//! classified at the infrastructure boundary. The consolidation-specific
//! variants (`TenantMismatch`, `AliasChain`) exist because those two rules
//! are load-bearing invariants of the data model, not input validation:
//! every row, node and cache key belongs to exactly one tenant, and aliases
//! always point at a canonical entity (chains have length 1).

use thiserror::Error;

use crate::id::{EntityId, TenantId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed or out-of-range input (empty name, bad confidence, too
    /// few split products).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An operation referenced an entity owned by another tenant.
    #[error("entity {entity_id} does not belong to tenant {tenant_id}")]
    TenantMismatch {
        tenant_id: TenantId,
        entity_id: EntityId,
    },

    /// A merge or split targeted a non-canonical entity. Allowing it would
    /// create an alias chain longer than one hop.
    #[error("entity {entity_id} is an alias; aliases must point at a canonical entity")]
    AliasChain { entity_id: EntityId },

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A referenced aggregate, entity, merge or review item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation lost a race or arrived in the wrong lifecycle state
    /// (stale version, double request, already-undone merge).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Authorization failure at the domain boundary.
    #[error("unauthorized")]
    Unauthorized,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn tenant_mismatch(tenant_id: TenantId, entity_id: EntityId) -> Self {
        Self::TenantMismatch {
            tenant_id,
            entity_id,
        }
    }

    pub fn alias_chain(entity_id: EntityId) -> Self {
        Self::AliasChain { entity_id }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
