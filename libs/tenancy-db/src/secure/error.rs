/// Errors raised by tenant-scoped statements.
#[derive(thiserror::Error, Debug)]
pub enum ScopeError {
    /// Database error occurred during query execution.
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// The database rejected a row through a tenant policy (SQLSTATE 42501).
    #[error("row-level security policy violation")]
    PolicyViolation,

    /// `Normal` mode without a tenant reached a tenant-scoped statement.
    #[error("tenant-scoped statement requires a bound tenant")]
    MissingTenant,

    /// An insert carried a tenant id other than the bound one.
    #[error("row tenant does not match the bound tenant")]
    TenantMismatch,

    /// A statement scoped for one context was executed in a session bound to another.
    #[error("statement was scoped for a different tenant context than the session")]
    ContextMismatch,

    /// Invalid use of the filter API.
    #[error("invalid scope: {0}")]
    Invalid(&'static str),
}

impl ScopeError {
    /// True for failures that indicate an isolation defect rather than a
    /// transient database problem.
    #[must_use]
    pub fn is_isolation_failure(&self) -> bool {
        !matches!(self, Self::Db(_))
    }
}
