//! The runtime connection pool.
//!
//! [`TenantPool`] wraps a sqlx Postgres pool whose release and acquire hooks
//! verify that no tenant binding survives a unit of work. Connections that
//! fail the check are closed rather than reused, and each one is counted by
//! the pool's [`LeakMonitor`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sea_orm::sqlx::postgres::{PgPool, PgPoolOptions};
use sea_orm::{DatabaseConnection, FromQueryResult, SqlxPostgresConnector};

use crate::DbError;
use crate::config::{PoolConfig, TenancyConfig, redact_credentials_in_dsn};
use crate::pool_opts::{ApplyPoolOpts, with_binding_verification};

/// Reads the tenant variable (empty string folded to NULL) and whether the
/// session still runs as its login role.
pub(crate) const PROBE_SQL: &str = "SELECT NULLIF(current_setting($1, true), '') AS bound, \
     current_user = session_user AS own_role";

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub(crate) struct BindingProbe {
    pub bound: Option<String>,
    pub own_role: bool,
}

impl BindingProbe {
    pub(crate) fn is_clean(&self) -> bool {
        self.bound.is_none() && self.own_role
    }
}

/// Where a contaminated connection was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// `after_release` hook, connection on its way back into the pool.
    Release,
    /// `before_acquire` hook, connection about to be handed out.
    Acquire,
    /// Session pre-check at the start of a unit of work.
    Session,
}

impl Checkpoint {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Acquire => "acquire",
            Self::Session => "session",
        }
    }
}

/// Snapshot of discarded-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LeakIncidents {
    pub release: u64,
    pub acquire: u64,
    pub session: u64,
}

impl LeakIncidents {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.release + self.acquire + self.session
    }
}

/// Process-wide counters of binding leaks. Any non-zero value is an incident.
#[derive(Debug, Default)]
pub struct LeakMonitor {
    release: AtomicU64,
    acquire: AtomicU64,
    session: AtomicU64,
}

impl LeakMonitor {
    /// Count one incident and return the new total for `checkpoint`.
    #[must_use = "the returned total is meant for the incident log"]
    pub fn record(&self, checkpoint: Checkpoint) -> u64 {
        let counter = match checkpoint {
            Checkpoint::Release => &self.release,
            Checkpoint::Acquire => &self.acquire,
            Checkpoint::Session => &self.session,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn incidents(&self) -> LeakIncidents {
        LeakIncidents {
            release: self.release.load(Ordering::Relaxed),
            acquire: self.acquire.load(Ordering::Relaxed),
            session: self.session.load(Ordering::Relaxed),
        }
    }
}

/// Runtime pool. Cheap to clone.
#[derive(Clone)]
pub struct TenantPool {
    pool: PgPool,
    sea: DatabaseConnection,
    monitor: Arc<LeakMonitor>,
}

impl std::fmt::Debug for TenantPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPool")
            .field("size", &self.pool.size())
            .field("incidents", &self.monitor.incidents())
            .finish_non_exhaustive()
    }
}

impl TenantPool {
    /// Connect with the runtime DSN from `cfg`.
    ///
    /// # Errors
    /// Returns `DbError` if the DSN cannot be expanded or the pool cannot connect.
    pub async fn connect(cfg: &TenancyConfig) -> Result<Self, DbError> {
        let dsn = cfg.runtime_dsn()?;
        Self::connect_with(&dsn, &cfg.database.pool, &cfg.session.variable).await
    }

    /// Connect to `dsn` with explicit pool settings.
    ///
    /// # Errors
    /// Returns `DbError` if the variable name is invalid or the pool cannot connect.
    pub async fn connect_with(
        dsn: &str,
        opts: &PoolConfig,
        variable: &str,
    ) -> Result<Self, DbError> {
        crate::ident::validate_setting_name(variable)?;
        let monitor = Arc::new(LeakMonitor::default());
        let builder = with_binding_verification(PgPoolOptions::new().apply(opts), variable, &monitor);

        tracing::debug!(
            dsn = %redact_credentials_in_dsn(dsn),
            max_conns = opts.max_conns,
            "connecting tenant pool"
        );
        let pool = builder.connect(dsn).await?;
        let sea = SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone());
        Ok(Self { pool, sea, monitor })
    }

    #[must_use]
    pub fn leak_monitor(&self) -> Arc<LeakMonitor> {
        Arc::clone(&self.monitor)
    }

    /// **INTERNAL**: the pooled `SeaORM` connection.
    ///
    /// Never handed to application code; units of work receive a
    /// [`TenantSession`](crate::session::TenantSession) instead.
    pub(crate) fn sea_internal(&self) -> &DatabaseConnection {
        &self.sea
    }

    /// Graceful pool close.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Open a single-purpose connection with the migration DSN.
///
/// This connection has no binding hooks and is used only by the migration
/// runner and bootstrap tooling.
///
/// # Errors
/// Returns `DbError` if the DSN cannot be expanded or the connection fails.
pub async fn connect_migrator(cfg: &TenancyConfig) -> Result<DatabaseConnection, DbError> {
    let dsn = cfg.migration_dsn()?;
    tracing::debug!(dsn = %redact_credentials_in_dsn(&dsn), "connecting migrator");
    let pool = PgPoolOptions::new().max_connections(1).connect(&dsn).await?;
    Ok(SqlxPostgresConnector::from_sqlx_postgres_pool(pool))
}
