use uuid::Uuid;

use crate::TenantId;

/// What kind of authenticated subject a [`Principal`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// An end user acting on behalf of a company.
    User,
    /// A background job or internal service identity.
    Service,
    /// Platform operator. Resolves like a user; cross-tenant access still
    /// requires an explicit bypass grant.
    PlatformAdmin,
}

impl PrincipalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Service => "service",
            Self::PlatformAdmin => "platform_admin",
        }
    }
}

/// An already-authenticated subject handed over by the authentication layer.
///
/// The tenant memberships come from the verified identity (token claims,
/// membership table), never from request payloads.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Principal {
    subject_id: Uuid,
    kind: PrincipalKind,
    tenants: Vec<TenantId>,
}

impl Principal {
    #[must_use]
    pub fn new(subject_id: Uuid, kind: PrincipalKind) -> Self {
        Self {
            subject_id,
            kind,
            tenants: Vec::new(),
        }
    }

    #[must_use]
    pub fn user(subject_id: Uuid, tenant: TenantId) -> Self {
        Self::new(subject_id, PrincipalKind::User).with_tenant(tenant)
    }

    /// Add a tenant membership. Duplicates are ignored.
    #[must_use]
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        if !self.tenants.contains(&tenant) {
            self.tenants.push(tenant);
        }
        self
    }

    #[must_use]
    pub fn subject_id(&self) -> Uuid {
        self.subject_id
    }

    #[must_use]
    pub fn kind(&self) -> PrincipalKind {
        self.kind
    }

    #[must_use]
    pub fn tenants(&self) -> &[TenantId] {
        &self.tenants
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn memberships_are_deduplicated() {
        let acme = TenantId::new("acme").unwrap();
        let p = Principal::new(Uuid::new_v4(), PrincipalKind::Service)
            .with_tenant(acme.clone())
            .with_tenant(acme);
        assert_eq!(p.tenants().len(), 1);
        assert_eq!(p.kind().as_str(), "service");
    }
}
