//! Bootstrap migrations and helpers for module migrations.
//!
//! The bootstrap set creates the bypass role and the append-only audit
//! table. Module migrations that create tenant tables call
//! [`create_tenant_policy`] in the same migration, otherwise the runner's
//! policy guard rejects them.

mod m0001_bypass_role;
mod m0002_bypass_audit;

use sea_orm::{ConnectionTrait, DbErr, TransactionTrait};
use sea_orm_migration::{MigrationTrait, SchemaManager};

use crate::config::TenancyConfig;
use crate::migration_runner::{MigrationError, MigrationResult, run_migrations};
use crate::policy::PolicyStore;

pub use m0001_bypass_role::BypassRole;
pub use m0002_bypass_audit::BypassAuditTable;

/// History namespace of the bootstrap migrations.
pub const BOOTSTRAP_MODULE: &str = "tenancy";

/// Engine-owned migrations, in order.
#[must_use]
pub fn bootstrap_migrations(cfg: &TenancyConfig) -> Vec<Box<dyn MigrationTrait>> {
    vec![
        Box::new(BypassRole::new(&cfg.policy.schema, &cfg.session.bypass_role)),
        Box::new(BypassAuditTable::new(&cfg.policy.schema, &cfg.session.bypass_role)),
    ]
}

/// Apply the bootstrap migrations over a privileged connection.
///
/// # Errors
/// Returns `MigrationError` if any bootstrap migration fails.
pub async fn run_bootstrap<C>(conn: &C, cfg: &TenancyConfig) -> Result<MigrationResult, MigrationError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let store = PolicyStore::from_config(cfg);
    run_migrations(conn, BOOTSTRAP_MODULE, bootstrap_migrations(cfg), &store).await
}

/// Install the tenant policy on `table` from inside a migration.
///
/// # Example
/// ```rust,ignore
/// async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
///     manager.create_table(/* course_progress */).await?;
///     create_tenant_policy(manager, &self.policies, "course_progress").await
/// }
/// ```
///
/// # Errors
/// Returns `DbErr::Migration` for invalid identifiers, or the DDL error.
pub async fn create_tenant_policy(
    manager: &SchemaManager<'_>,
    store: &PolicyStore,
    table: &str,
) -> Result<(), DbErr> {
    let policy = store
        .policy_for(table)
        .map_err(|e| DbErr::Migration(e.to_string()))?;
    policy.apply(manager.get_connection()).await
}
