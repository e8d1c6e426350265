//! Cross-tenant access grants.
//!
//! A [`BypassGrant`] is the only way to obtain a bypass-mode
//! [`TenantContext`](crate::TenantContext). Grants cannot be built outside this
//! crate: they are minted by [`TenantResolver::authorize_bypass`]
//! after the operation, principal kind and reason have been checked.
//!
//! [`TenantResolver::authorize_bypass`]: crate::TenantResolver::authorize_bypass

use uuid::Uuid;

use crate::PrincipalKind;

/// The reviewed allow-list of internal operations that may run without a
/// tenant predicate. Adding a variant is a security review event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassOperation {
    /// Schema or data migrations run by the deployment pipeline.
    Migration,
    /// Platform administration reports spanning all companies.
    PlatformReport,
    /// Creating or deleting a company together with its seed data.
    TenantProvisioning,
    /// Operator-driven repair of data that crosses tenant boundaries.
    DataRepair,
}

impl BypassOperation {
    pub const ALL: [Self; 4] = [
        Self::Migration,
        Self::PlatformReport,
        Self::TenantProvisioning,
        Self::DataRepair,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migration => "migration",
            Self::PlatformReport => "platform_report",
            Self::TenantProvisioning => "tenant_provisioning",
            Self::DataRepair => "data_repair",
        }
    }

    /// Whether a principal of `kind` may ever request this operation.
    ///
    /// Ordinary users never may.
    #[must_use]
    pub fn permits(self, kind: PrincipalKind) -> bool {
        match (self, kind) {
            (_, PrincipalKind::User) => false,
            (Self::Migration, k) => k == PrincipalKind::Service,
            (Self::PlatformReport | Self::DataRepair, k) => k == PrincipalKind::PlatformAdmin,
            (Self::TenantProvisioning, _) => true,
        }
    }
}

/// Input to [`TenantResolver::authorize_bypass`](crate::TenantResolver::authorize_bypass).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassRequest {
    pub operation: BypassOperation,
    /// Free-text justification, stored verbatim in the audit record.
    pub reason: String,
    /// Tables the operation intends to touch.
    pub tables: Vec<String>,
}

impl BypassRequest {
    #[must_use]
    pub fn new(operation: BypassOperation, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
            tables: Vec::new(),
        }
    }

    #[must_use]
    pub fn touching<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.extend(tables.into_iter().map(Into::into));
        self
    }
}

/// Proof that a principal was authorized for one allow-listed bypass operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassGrant {
    actor: Uuid,
    actor_kind: PrincipalKind,
    operation: BypassOperation,
    reason: String,
    tables: Vec<String>,
}

impl BypassGrant {
    pub(crate) fn new(
        actor: Uuid,
        actor_kind: PrincipalKind,
        operation: BypassOperation,
        reason: String,
        tables: Vec<String>,
    ) -> Self {
        Self {
            actor,
            actor_kind,
            operation,
            reason,
            tables,
        }
    }

    #[must_use]
    pub fn actor(&self) -> Uuid {
        self.actor
    }

    #[must_use]
    pub fn actor_kind(&self) -> PrincipalKind {
        self.actor_kind
    }

    #[must_use]
    pub fn operation(&self) -> BypassOperation {
        self.operation
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[must_use]
    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}
