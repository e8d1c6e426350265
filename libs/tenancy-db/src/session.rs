//! Binding a tenant to exactly one pooled connection for one unit of work.
//!
//! # Lifecycle
//!
//! 1. Refuse if this task already holds a session.
//! 2. Bypass only: write the audit record in its own committed transaction.
//! 3. Begin a transaction (bounded acquire, bounded retry with backoff).
//! 4. Probe the fresh connection; a leftover binding aborts the unit of work.
//! 5. `set_config(var, tenant, true)`, or the `''` sentinel. Bypass also runs
//!    `SET LOCAL ROLE <bypass_role>`.
//! 6. Run the closure with a [`TenantSession`] borrowing the transaction.
//! 7. Re-check the binding, then commit on `Ok` or roll back on `Err`.
//!    Dropping the future rolls back through the transaction's `Drop`.
//!
//! All settings are transaction-local, so commit or rollback clears them.
//! The pool's release hook re-verifies that before the connection is reused.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use sea_orm::{
    ConnAcquireErr, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    FromQueryResult, QueryResult, RuntimeErr, Statement, TransactionTrait, Value,
};
use tenancy_security::{BypassGrant, SessionMode, TenantContext, TenantId};

use crate::audit::{AuditError, AuditSink, BypassAuditor, PgAuditSink};
use crate::config::SessionConfig;
use crate::ident::{quote_ident, validate_identifier, validate_setting_name};
use crate::pool::{BindingProbe, Checkpoint, LeakMonitor, PROBE_SQL, TenantPool};
use crate::secure::{ScopeError, ScopeStamp};
use crate::DbError;

/// SQLSTATE raised when a row policy rejects a row.
pub const SQLSTATE_INSUFFICIENT_PRIVILEGE: &str = "42501";

tokio::task_local! {
    static IN_SESSION: Cell<bool>;
}

fn in_session() -> bool {
    IN_SESSION.try_with(Cell::get).unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No connection became available within the retry budget.
    #[error("connection pool exhausted after {attempts} attempts")]
    PoolExhausted { attempts: u32 },

    /// A row policy rejected a statement.
    #[error("row-level security policy violation")]
    PolicyViolation,

    /// A connection carried a binding it should not have.
    #[error("tenant binding leak detected")]
    BindingLeakDetected,

    /// A unit of work tried to open a second session.
    #[error("nested tenant session")]
    NestedSession,

    /// The bypass audit record could not be written.
    #[error(transparent)]
    AuditFailed(#[from] AuditError),

    #[error(transparent)]
    Scope(ScopeError),

    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

impl From<ScopeError> for SessionError {
    fn from(value: ScopeError) -> Self {
        match value {
            ScopeError::PolicyViolation => Self::PolicyViolation,
            other => Self::Scope(other),
        }
    }
}

impl SessionError {
    /// True for failures that indicate an isolation defect.
    ///
    /// These are never retried or downgraded.
    #[must_use]
    pub fn is_isolation_failure(&self) -> bool {
        match self {
            Self::PolicyViolation | Self::BindingLeakDetected | Self::NestedSession => true,
            Self::Scope(e) => e.is_isolation_failure(),
            Self::PoolExhausted { .. } | Self::AuditFailed(_) | Self::Db(_) => false,
        }
    }
}

/// Read the SQLSTATE of a database error, if any.
#[must_use]
pub fn sqlstate(err: &DbErr) -> Option<String> {
    let runtime = match err {
        DbErr::Conn(e) | DbErr::Exec(e) | DbErr::Query(e) => e,
        _ => return None,
    };
    match runtime {
        RuntimeErr::SqlxError(e) => e
            .as_database_error()
            .and_then(|d| d.code())
            .map(std::borrow::Cow::into_owned),
        RuntimeErr::Internal(_) => None,
    }
}

/// A unit of work's view of its bound transaction.
///
/// Not `Clone` and lifetime-bound to the closure passed to
/// [`SessionBinder::with_tenant_session`], so it cannot outlive the binding
/// or be handed to another task.
pub struct TenantSession<'a> {
    tx: &'a DatabaseTransaction,
    ctx: &'a TenantContext,
    variable: &'a str,
}

impl std::fmt::Debug for TenantSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSession")
            .field("mode", &self.ctx.mode())
            .field("tenant", &self.ctx.tenant_id())
            .finish_non_exhaustive()
    }
}

impl TenantSession<'_> {
    /// The context this session is bound to.
    #[must_use]
    pub fn context(&self) -> &TenantContext {
        self.ctx
    }

    /// Value of the tenant variable as the database sees it now.
    ///
    /// # Errors
    /// Returns `ScopeError::Db` if the query fails.
    pub async fn current_binding(&self) -> Result<Option<String>, ScopeError> {
        let probe = self.probe().await?;
        Ok(probe.bound)
    }

    /// Execute a statement without the application filter.
    ///
    /// Row policies still apply, so the result is confined to the bound
    /// tenant exactly as a filtered statement would be.
    ///
    /// # Errors
    /// `ScopeError::PolicyViolation` if a policy rejects a written row,
    /// `ScopeError::Db` otherwise.
    pub async fn execute_raw<I>(&self, sql: &str, values: I) -> Result<u64, ScopeError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.tx
            .execute(Statement::from_sql_and_values(DbBackend::Postgres, sql, values))
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| self.classify(e))
    }

    /// Run a query without the application filter. Row policies still apply.
    ///
    /// # Errors
    /// Same as [`execute_raw`](Self::execute_raw).
    pub async fn query_raw<I>(&self, sql: &str, values: I) -> Result<Vec<QueryResult>, ScopeError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.tx
            .query_all(Statement::from_sql_and_values(DbBackend::Postgres, sql, values))
            .await
            .map_err(|e| self.classify(e))
    }

    pub(crate) fn conn(&self) -> &DatabaseTransaction {
        self.tx
    }

    pub(crate) fn check_scope(&self, stamp: Option<&ScopeStamp>) -> Result<(), ScopeError> {
        match stamp {
            Some(stamp) if stamp.matches(self.ctx) => Ok(()),
            Some(_) => {
                tracing::error!(
                    target: "security",
                    request_id = self.ctx.request_id().unwrap_or(""),
                    mode = self.ctx.mode().as_str(),
                    "scoped statement executed in a session bound to another context"
                );
                Err(ScopeError::ContextMismatch)
            }
            None => Err(ScopeError::Invalid("statement was never scoped")),
        }
    }

    /// Map a database error, singling out policy violations.
    pub(crate) fn classify(&self, err: DbErr) -> ScopeError {
        if sqlstate(&err).as_deref() == Some(SQLSTATE_INSUFFICIENT_PRIVILEGE) {
            tracing::error!(
                target: "security",
                request_id = self.ctx.request_id().unwrap_or(""),
                tenant = self.ctx.tenant_id().map_or("", TenantId::as_str),
                mode = self.ctx.mode().as_str(),
                error = %err,
                "row-level security policy violation"
            );
            ScopeError::PolicyViolation
        } else {
            ScopeError::Db(err)
        }
    }

    async fn probe(&self) -> Result<BindingProbe, ScopeError> {
        read_probe(self.tx, self.variable)
            .await
            .map_err(|e| self.classify(e))
    }
}

async fn read_probe(tx: &DatabaseTransaction, variable: &str) -> Result<BindingProbe, DbErr> {
    BindingProbe::find_by_statement(Statement::from_sql_and_values(
        DbBackend::Postgres,
        PROBE_SQL,
        [variable.into()],
    ))
    .one(tx)
    .await?
    .ok_or_else(|| DbErr::RecordNotFound("binding probe returned no row".to_owned()))
}

#[derive(Debug, FromQueryResult)]
struct Applied {
    bound: Option<String>,
}

/// Entry point for every unit of work against tenant data.
#[derive(Clone)]
pub struct SessionBinder {
    db: DatabaseConnection,
    settings: SessionConfig,
    auditor: BypassAuditor,
    monitor: Arc<LeakMonitor>,
}

impl std::fmt::Debug for SessionBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBinder")
            .field("variable", &self.settings.variable)
            .field("bypass_role", &self.settings.bypass_role)
            .finish_non_exhaustive()
    }
}

/// Boxed unit of work, as accepted by [`SessionBinder::with_tenant_session`].
pub type UnitOfWork<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

impl SessionBinder {
    /// Binder over `pool` writing bypass audits with [`PgAuditSink`].
    ///
    /// # Errors
    /// Returns `DbError::Ident` if the variable or bypass role name is invalid.
    pub fn new(pool: &TenantPool, settings: SessionConfig) -> Result<Self, DbError> {
        let sink = PgAuditSink::new(pool.sea_internal().clone(), settings.bypass_role.clone());
        Self::with_audit_sink(pool, settings, Arc::new(sink))
    }

    /// Binder with a custom audit destination.
    ///
    /// # Errors
    /// Returns `DbError::Ident` if the variable or bypass role name is invalid.
    pub fn with_audit_sink(
        pool: &TenantPool,
        settings: SessionConfig,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self, DbError> {
        validate_setting_name(&settings.variable)?;
        validate_identifier("bypass role", &settings.bypass_role)?;
        Ok(Self {
            db: pool.sea_internal().clone(),
            settings,
            auditor: BypassAuditor::new(sink),
            monitor: pool.leak_monitor(),
        })
    }

    /// Run `f` with `ctx` bound to one connection inside one transaction.
    ///
    /// # Example
    /// ```rust,ignore
    /// let count = binder
    ///     .with_tenant_session(&ctx, |session| {
    ///         Box::pin(async move {
    ///             let rows = course_progress::Entity::find()
    ///                 .secure()
    ///                 .scope_with(session.context())?
    ///                 .count(session)
    ///                 .await?;
    ///             Ok::<_, SessionError>(rows)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `E` built from:
    /// - `SessionError::NestedSession` if the current task already holds a session
    /// - `SessionError::AuditFailed` if a bypass audit could not be written
    /// - `SessionError::PoolExhausted` if no connection became available
    /// - `SessionError::BindingLeakDetected` if the connection or binding is contaminated
    /// - `SessionError::Db` for begin/bind/commit failures
    ///
    /// or the closure's own error, after rollback.
    pub async fn with_tenant_session<F, T, E>(&self, ctx: &TenantContext, f: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a TenantSession<'a>) -> UnitOfWork<'a, T, E> + Send,
        T: Send + 'static,
        E: From<SessionError> + Send + 'static,
    {
        if in_session() {
            tracing::error!(
                target: "security",
                request_id = ctx.request_id().unwrap_or(""),
                "nested tenant session refused"
            );
            return Err(SessionError::NestedSession.into());
        }

        if let Some(grant) = ctx.bypass_grant() {
            self.auditor
                .admit(grant, ctx.request_id())
                .await
                .map_err(SessionError::from)?;
        }

        let started = Instant::now();
        let txn = self.begin_with_retry(ctx).await?;
        self.bind(&txn, ctx).await?;

        let session = TenantSession {
            tx: &txn,
            ctx,
            variable: &self.settings.variable,
        };

        let mut guard = CancelGuard::new(ctx);
        let res = IN_SESSION.scope(Cell::new(true), f(&session)).await;
        guard.disarm();

        let outcome = match res {
            Ok(v) => {
                self.verify_still_bound(&txn, ctx).await?;
                txn.commit().await.map_err(SessionError::from)?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed, connection will be discarded");
                }
                Err(e)
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.settings.slow_threshold {
            tracing::warn!(
                request_id = ctx.request_id().unwrap_or(""),
                mode = ctx.mode().as_str(),
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "tenant session exceeded slow threshold"
            );
        }
        outcome
    }

    /// Run `f` in bypass mode under `grant`.
    ///
    /// The audit record is committed before the bypass transaction begins.
    ///
    /// # Errors
    /// Same as [`with_tenant_session`](Self::with_tenant_session).
    pub async fn with_bypass<F, T, E>(&self, grant: BypassGrant, f: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a TenantSession<'a>) -> UnitOfWork<'a, T, E> + Send,
        T: Send + 'static,
        E: From<SessionError> + Send + 'static,
    {
        self.with_tenant_session(&TenantContext::bypass(grant), f)
            .await
    }

    /// Leak counters shared with the pool hooks.
    #[must_use]
    pub fn leak_monitor(&self) -> Arc<LeakMonitor> {
        Arc::clone(&self.monitor)
    }

    async fn begin_with_retry(&self, ctx: &TenantContext) -> Result<DatabaseTransaction, SessionError> {
        let retry = &self.settings.acquire_retry;
        let mut attempt = 1;
        loop {
            match self.db.begin().await {
                Ok(txn) => return Ok(txn),
                Err(DbErr::ConnectionAcquire(ConnAcquireErr::Timeout)) => {
                    if attempt >= retry.max_attempts {
                        tracing::error!(
                            request_id = ctx.request_id().unwrap_or(""),
                            attempts = attempt,
                            "connection pool exhausted"
                        );
                        return Err(SessionError::PoolExhausted { attempts: attempt });
                    }
                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "pool acquire timed out, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(SessionError::Db(e)),
            }
        }
    }

    async fn bind(&self, txn: &DatabaseTransaction, ctx: &TenantContext) -> Result<(), SessionError> {
        let probe = read_probe(txn, &self.settings.variable).await?;
        if !probe.is_clean() {
            let incidents = self.monitor.record(Checkpoint::Session);
            tracing::error!(
                target: "security",
                request_id = ctx.request_id().unwrap_or(""),
                leaked_tenant = probe.bound.as_deref().unwrap_or(""),
                role_switched = !probe.own_role,
                incidents,
                "connection handed out with leftover session binding"
            );
            return Err(SessionError::BindingLeakDetected);
        }

        let value = ctx.session_value().unwrap_or("");
        let applied = Applied::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT NULLIF(set_config($1, $2, true), '') AS bound",
            [self.settings.variable.as_str().into(), value.into()],
        ))
        .one(txn)
        .await?;
        if applied.and_then(|a| a.bound).as_deref() != ctx.session_value() {
            tracing::error!(
                target: "security",
                request_id = ctx.request_id().unwrap_or(""),
                "tenant variable did not take the bound value"
            );
            return Err(SessionError::BindingLeakDetected);
        }

        if ctx.mode() == SessionMode::Bypass {
            txn.execute_unprepared(&format!(
                "SET LOCAL ROLE {}",
                quote_ident(&self.settings.bypass_role)
            ))
            .await?;
        }

        tracing::debug!(
            request_id = ctx.request_id().unwrap_or(""),
            mode = ctx.mode().as_str(),
            tenant = ctx.tenant_id().map_or("", TenantId::as_str),
            "tenant session bound"
        );
        Ok(())
    }

    /// The unit of work may have issued raw SQL; refuse to commit if the
    /// binding was changed underneath it.
    async fn verify_still_bound(
        &self,
        txn: &DatabaseTransaction,
        ctx: &TenantContext,
    ) -> Result<(), SessionError> {
        let probe = read_probe(txn, &self.settings.variable).await?;
        let expect_own_role = ctx.mode() == SessionMode::Normal;
        if probe.bound.as_deref() == ctx.session_value() && probe.own_role == expect_own_role {
            return Ok(());
        }
        tracing::error!(
            target: "security",
            request_id = ctx.request_id().unwrap_or(""),
            mode = ctx.mode().as_str(),
            "session binding changed during unit of work, rolling back"
        );
        Err(SessionError::BindingLeakDetected)
    }
}

/// Logs a unit of work dropped before completion. The transaction's own
/// `Drop` performs the rollback.
struct CancelGuard<'a> {
    ctx: &'a TenantContext,
    armed: bool,
}

impl<'a> CancelGuard<'a> {
    fn new(ctx: &'a TenantContext) -> Self {
        Self { ctx, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                request_id = self.ctx.request_id().unwrap_or(""),
                mode = self.ctx.mode().as_str(),
                "tenant session cancelled, transaction rolled back"
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn scope_errors_map_to_session_errors() {
        assert!(matches!(
            SessionError::from(ScopeError::PolicyViolation),
            SessionError::PolicyViolation
        ));
        assert!(matches!(
            SessionError::from(ScopeError::MissingTenant),
            SessionError::Scope(ScopeError::MissingTenant)
        ));
    }

    #[test]
    fn isolation_failures_are_flagged() {
        assert!(SessionError::PolicyViolation.is_isolation_failure());
        assert!(SessionError::BindingLeakDetected.is_isolation_failure());
        assert!(SessionError::NestedSession.is_isolation_failure());
        assert!(SessionError::Scope(ScopeError::ContextMismatch).is_isolation_failure());
        assert!(!SessionError::PoolExhausted { attempts: 3 }.is_isolation_failure());
        assert!(!SessionError::Db(DbErr::Custom("boom".to_owned())).is_isolation_failure());
        assert!(
            !SessionError::Scope(ScopeError::Db(DbErr::Custom("boom".to_owned())))
                .is_isolation_failure()
        );
    }

    #[test]
    fn sqlstate_absent_for_non_database_errors() {
        assert_eq!(sqlstate(&DbErr::Custom("x".to_owned())), None);
        assert_eq!(
            sqlstate(&DbErr::ConnectionAcquire(ConnAcquireErr::Timeout)),
            None
        );
    }

    #[tokio::test]
    async fn task_local_guard_reports_nesting() {
        assert!(!in_session());
        IN_SESSION
            .scope(Cell::new(true), async {
                assert!(in_session());
            })
            .await;
        assert!(!in_session());
    }
}
