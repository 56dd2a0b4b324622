//! Per-request tenant context.
//!
//! Built once by the pipeline and attached as a request extension; handlers
//! read it through `axum::Extension<TenantContext>` and never through any
//! ambient global. A route that reaches a handler without the extension is a
//! code path that escaped the pipeline, and axum rejects it loudly with a 500.

use std::time::Instant;
use uuid::Uuid;

use crate::session::SharedSession;
use crate::tenancy::store::TenantDescriptor;

/// What the bound session can see.
#[derive(Debug, Clone)]
pub enum TenantScope {
    /// Shared namespace only.
    Public,
    Tenant(TenantDescriptor),
}

impl TenantScope {
    pub fn descriptor(&self) -> Option<&TenantDescriptor> {
        match self {
            TenantScope::Public => None,
            TenantScope::Tenant(descriptor) => Some(descriptor),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, TenantScope::Public)
    }
}

/// Authenticated subject, opaque to the data plane.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
}

/// Immutable-after-creation record carried through one request.
#[derive(Clone)]
pub struct TenantContext {
    pub scope: TenantScope,
    pub session: SharedSession,
    pub principal: Option<Principal>,
    pub correlation_id: Uuid,
    pub started_at: Instant,
}

impl TenantContext {
    pub fn new(scope: TenantScope, session: SharedSession, correlation_id: Uuid) -> Self {
        Self {
            scope,
            session,
            principal: None,
            correlation_id,
            started_at: Instant::now(),
        }
    }

    /// Copy carrying the authenticated principal; the auth middleware swaps
    /// the request extension for this rather than mutating in place.
    pub fn with_principal(&self, principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            ..self.clone()
        }
    }

    /// Tenant key for logging; the public scope logs as "public".
    pub fn tenant_label(&self) -> &str {
        self.scope
            .descriptor()
            .map(|d| d.key.as_str())
            .unwrap_or("public")
    }
}
