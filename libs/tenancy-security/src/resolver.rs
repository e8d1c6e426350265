//! Deriving a [`TenantContext`] from an authenticated principal.

use std::collections::HashSet;

use uuid::Uuid;

use crate::{BypassGrant, BypassOperation, BypassRequest, Principal, TenantContext};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No authenticated principal was supplied.
    #[error("request is not authenticated")]
    Unauthenticated,

    /// The principal is not a member of exactly one tenant.
    #[error("principal {subject_id} has {memberships} tenant memberships, expected exactly one")]
    NoTenant { subject_id: Uuid, memberships: usize },

    /// Bypass was requested but not authorized.
    #[error("bypass '{operation}' denied for principal {subject_id}: {reason}")]
    BypassDenied {
        subject_id: Uuid,
        operation: &'static str,
        reason: &'static str,
    },
}

/// Boundary between authentication and the isolation engine.
///
/// `resolve` never yields bypass mode. Cross-tenant access is only available
/// through the separate `authorize_bypass` call.
pub trait TenantResolver: Send + Sync {
    /// Resolve the acting tenant for one unit of work.
    ///
    /// # Errors
    /// `Unauthenticated` when `principal` is `None`, `NoTenant` when the
    /// principal does not belong to exactly one tenant.
    fn resolve(&self, principal: Option<&Principal>) -> Result<TenantContext, ResolveError>;

    /// Mint a bypass grant for an allow-listed operation.
    ///
    /// # Errors
    /// `BypassDenied` when the operation is not allowed for this principal
    /// or the request carries no reason.
    fn authorize_bypass(
        &self,
        principal: &Principal,
        request: BypassRequest,
    ) -> Result<BypassGrant, ResolveError>;
}

/// Default resolver working purely from the principal's memberships.
#[derive(Debug, Clone)]
pub struct PrincipalTenantResolver {
    allowed: HashSet<BypassOperation>,
}

impl Default for PrincipalTenantResolver {
    fn default() -> Self {
        Self {
            allowed: BypassOperation::ALL.into_iter().collect(),
        }
    }
}

impl PrincipalTenantResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Narrow the bypass allow-list for this deployment.
    #[must_use]
    pub fn with_allowed_operations<I>(mut self, ops: I) -> Self
    where
        I: IntoIterator<Item = BypassOperation>,
    {
        self.allowed = ops.into_iter().collect();
        self
    }
}

impl TenantResolver for PrincipalTenantResolver {
    fn resolve(&self, principal: Option<&Principal>) -> Result<TenantContext, ResolveError> {
        let principal = principal.ok_or(ResolveError::Unauthenticated)?;
        match principal.tenants() {
            [only] => Ok(TenantContext::for_tenant(only.clone())),
            other => Err(ResolveError::NoTenant {
                subject_id: principal.subject_id(),
                memberships: other.len(),
            }),
        }
    }

    fn authorize_bypass(
        &self,
        principal: &Principal,
        request: BypassRequest,
    ) -> Result<BypassGrant, ResolveError> {
        let deny = |reason| ResolveError::BypassDenied {
            subject_id: principal.subject_id(),
            operation: request.operation.as_str(),
            reason,
        };

        if !self.allowed.contains(&request.operation) {
            return Err(deny("operation is not on the allow-list"));
        }
        if !request.operation.permits(principal.kind()) {
            return Err(deny("principal kind may not perform this operation"));
        }
        if request.reason.trim().is_empty() {
            return Err(deny("a reason is required"));
        }

        Ok(BypassGrant::new(
            principal.subject_id(),
            principal.kind(),
            request.operation,
            request.reason,
            request.tables,
        ))
    }
}
