#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant isolation for PostgreSQL.
//!
//! Every unit of work runs inside [`SessionBinder::with_tenant_session`],
//! which binds the acting tenant to one pooled connection for exactly one
//! transaction. Isolation is enforced twice:
//!
//! - the [`secure`] query wrappers add `tenant_column = <tenant>` to every
//!   statement on a tenant-scoped entity;
//! - row-level security policies installed by [`policy`] filter the same
//!   statements inside the database, even for raw SQL.
//!
//! The binding is transaction-local, and the pool verifies on release and
//! on acquire that no connection leaves with a tenant or role still set.
//!
//! # Example
//! ```rust,no_run
//! use tenancy_db::{SessionBinder, SessionError, TenancyConfig, TenantPool};
//! use tenancy_security::{Principal, PrincipalTenantResolver, TenantResolver};
//!
//! # async fn run(principal: Principal) -> anyhow::Result<()> {
//! let cfg = TenancyConfig::load(None)?;
//! let pool = TenantPool::connect(&cfg).await?;
//! tenancy_db::startup::run_startup_checks(&pool, &cfg).await?;
//!
//! let binder = SessionBinder::new(&pool, cfg.session.clone())?;
//! let ctx = PrincipalTenantResolver::new().resolve(Some(&principal))?;
//! let rows = binder
//!     .with_tenant_session(&ctx, |session| {
//!         Box::pin(async move {
//!             session
//!                 .execute_raw("UPDATE course_progress SET percent = percent", [])
//!                 .await
//!                 .map_err(SessionError::from)
//!         })
//!     })
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

extern crate self as tenancy_db;

pub mod audit;
pub mod config;
pub mod ident;
pub mod migration_runner;
pub mod migrations;
pub mod policy;
pub mod pool;
pub mod problem;
pub mod registry;
pub mod secure;
pub mod session;
pub mod startup;

mod pool_opts;

#[doc(hidden)]
pub use inventory;

pub use audit::{AuditError, AuditRecord, AuditSink, BypassAuditor, PgAuditSink};
pub use config::{ConfigError, TenancyConfig};
pub use ident::IdentError;
pub use migration_runner::{MigrationError, MigrationResult, run_migrations};
pub use policy::{Policy, PolicyIssue, PolicyStore, TenantTable};
pub use pool::{LeakIncidents, LeakMonitor, TenantPool, connect_migrator};
pub use problem::Problem;
pub use secure::{ScopeError, SecureEntityExt, TenantScoped, TenantScopedEntity};
pub use session::{SessionBinder, SessionError, TenantSession, UnitOfWork};
pub use startup::{StartupError, StartupReport, run_startup_checks};

use thiserror::Error;

/// Errors from connecting and configuring the engine.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ident(#[from] IdentError),

    #[error(transparent)]
    Sqlx(#[from] sea_orm::sqlx::Error),

    #[error(transparent)]
    Sea(#[from] sea_orm::DbErr),
}
