use crate::{BypassGrant, TenantId};

/// Session mode of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// Row visibility is restricted to the bound tenant (or to nothing).
    Normal,
    /// Audited cross-tenant access under an explicit grant.
    Bypass,
}

impl SessionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Bypass => "bypass",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Tenant(TenantId),
    Unbound,
    Bypass(BypassGrant),
}

/// The acting tenant of one logical unit of work.
///
/// Immutable once built. A context is created per request or job by the
/// authentication boundary (see [`TenantResolver`](crate::TenantResolver))
/// and passed explicitly to the session binder; it is never stored in
/// ambient state.
///
/// An [`unbound`](Self::unbound) context is `Normal` mode without a tenant:
/// every tenant-scoped query issued with it sees zero rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    binding: Binding,
    request_id: Option<String>,
}

impl TenantContext {
    /// Context bound to a single tenant.
    ///
    /// Request handlers should obtain contexts from a resolver; this
    /// constructor is for jobs that read the tenant from trusted server-side
    /// state.
    #[must_use]
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            binding: Binding::Tenant(tenant_id),
            request_id: None,
        }
    }

    /// `Normal` mode with no tenant. Default deny.
    #[must_use]
    pub fn unbound() -> Self {
        Self {
            binding: Binding::Unbound,
            request_id: None,
        }
    }

    /// Bypass mode under an authorized grant.
    #[must_use]
    pub fn bypass(grant: BypassGrant) -> Self {
        Self {
            binding: Binding::Bypass(grant),
            request_id: None,
        }
    }

    /// Attach a correlation id that is carried into isolation logs.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn tenant_id(&self) -> Option<&TenantId> {
        match &self.binding {
            Binding::Tenant(id) => Some(id),
            Binding::Unbound | Binding::Bypass(_) => None,
        }
    }

    #[must_use]
    pub fn mode(&self) -> SessionMode {
        match self.binding {
            Binding::Tenant(_) | Binding::Unbound => SessionMode::Normal,
            Binding::Bypass(_) => SessionMode::Bypass,
        }
    }

    #[must_use]
    pub fn bypass_grant(&self) -> Option<&BypassGrant> {
        match &self.binding {
            Binding::Bypass(grant) => Some(grant),
            Binding::Tenant(_) | Binding::Unbound => None,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Value the tenant session variable must hold while this context is
    /// active. `None` means the "no tenant" sentinel.
    #[must_use]
    pub fn session_value(&self) -> Option<&str> {
        self.tenant_id().map(TenantId::as_str)
    }
}
