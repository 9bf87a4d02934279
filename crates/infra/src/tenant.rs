//! Ambient tenant context for request and task lifetimes.
//!
//! Storage layers consult the current tenant when building queries; the
//! scope guard guarantees the context is cleared on every exit path,
//! including panics and cancellation, because it lives in a task-local.
//!
//! System mode bypasses tenant filtering for administrative maintenance.
//! It is never engaged from user-facing code paths.

use std::future::Future;

use thiserror::Error;

use kmapper_core::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Tenant(TenantId),
    System,
}

tokio::task_local! {
    static CURRENT_SCOPE: Scope;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TenantScopeGuardError {
    #[error("no tenant context is set for the current task")]
    Missing,
}

/// Scoped acquisition of the ambient tenant.
pub struct TenantContext;

impl TenantContext {
    /// Run `fut` with `tenant_id` as the ambient tenant. The context is
    /// dropped with the scope on all exit paths.
    pub async fn scope<F>(tenant_id: TenantId, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_SCOPE.scope(Scope::Tenant(tenant_id), fut).await
    }

    /// Run `fut` in system mode (tenant filtering bypassed). For
    /// administrative maintenance only.
    pub async fn scope_system<F>(fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_SCOPE.scope(Scope::System, fut).await
    }

    /// The current tenant, failing when no scope is active.
    pub fn current() -> Result<TenantId, TenantScopeGuardError> {
        Self::try_current().ok_or(TenantScopeGuardError::Missing)
    }

    /// The current tenant, `None` when unset or in system mode.
    pub fn try_current() -> Option<TenantId> {
        CURRENT_SCOPE
            .try_with(|scope| match scope {
                Scope::Tenant(id) => Some(*id),
                Scope::System => None,
            })
            .ok()
            .flatten()
    }

    /// Whether the current task runs in system mode.
    pub fn is_system() -> bool {
        CURRENT_SCOPE
            .try_with(|scope| matches!(scope, Scope::System))
            .unwrap_or(false)
    }

    /// Enforce that `tenant_id` matches the ambient scope. System mode
    /// passes everything; a missing scope fails.
    pub fn enforce(tenant_id: TenantId) -> Result<(), TenantScopeGuardError> {
        if Self::is_system() {
            return Ok(());
        }
        match Self::current() {
            Ok(current) if current == tenant_id => Ok(()),
            Ok(_) => Err(TenantScopeGuardError::Missing),
            Err(e) => Err(e),
        }
    }
}
