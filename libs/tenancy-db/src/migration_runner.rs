//! Migration runner with a tenant-policy guard.
//!
//! Runs `sea-orm-migration` migrations over a privileged connection with a
//! per-module history table `tenancy_migrations__<module>`. Each migration
//! runs in its own transaction together with its history row. Before that
//! transaction commits, every tenant table visible in the catalog is checked
//! against [`PolicyStore::verify`]; a migration that leaves one without a
//! valid policy is rolled back and fails.

use std::collections::{BTreeMap, HashSet};

use sea_orm::{ConnectionTrait, DbBackend, DbErr, FromQueryResult, Statement, TransactionTrait};
use sea_orm_migration::{MigrationTrait, SchemaManager};
use thiserror::Error;
use tracing::{debug, info};

use crate::ident::quote_ident;
use crate::policy::{PolicyIssue, PolicyStore, TableSource, TenantTable};
use crate::registry::{RegistryConflict, registered_tables};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to create migration table for module '{module}': {source}")]
    CreateTable { module: String, source: DbErr },

    #[error("failed to query migration history for module '{module}': {source}")]
    QueryHistory { module: String, source: DbErr },

    #[error("migration '{migration}' failed for module '{module}': {source}")]
    MigrationFailed {
        module: String,
        migration: String,
        source: DbErr,
    },

    #[error("failed to record migration '{migration}' for module '{module}': {source}")]
    RecordFailed {
        module: String,
        migration: String,
        source: DbErr,
    },

    #[error("duplicate migration name '{name}' for module '{module}'")]
    DuplicateMigrationName { module: String, name: String },

    /// The migration left a tenant table without a valid policy.
    #[error(
        "migration '{migration}' for module '{module}' leaves tenant tables unprotected: {}",
        .issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    MissingPolicy {
        module: String,
        migration: String,
        issues: Vec<PolicyIssue>,
    },

    #[error(transparent)]
    Registry(#[from] RegistryConflict),
}

/// Result of a migration run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MigrationResult {
    pub applied: usize,
    pub skipped: usize,
    pub applied_names: Vec<String>,
}

#[derive(Debug, FromQueryResult)]
struct MigrationRecord {
    version: String,
}

fn sanitize_module_name(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect();
    if out.is_empty() { "_".to_owned() } else { out }
}

/// `tenancy_migrations__<module>`, capped to the 63-byte identifier limit.
fn migration_table_name(module_name: &str) -> String {
    const PREFIX: &str = "tenancy_migrations__";
    const PG_IDENT_MAX: usize = 63;

    let mut sanitized = sanitize_module_name(module_name);
    sanitized.truncate(PG_IDENT_MAX - PREFIX.len());
    format!("{PREFIX}{sanitized}")
}

async fn ensure_migration_table(
    conn: &impl ConnectionTrait,
    table_name: &str,
    module_name: &str,
) -> Result<(), MigrationError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
             version VARCHAR(255) PRIMARY KEY, \
             applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP)",
        quote_ident(table_name)
    );
    conn.execute_unprepared(&sql)
        .await
        .map_err(|e| MigrationError::CreateTable {
            module: module_name.to_owned(),
            source: e,
        })?;
    Ok(())
}

async fn get_applied_migrations(
    conn: &impl ConnectionTrait,
    table_name: &str,
    module_name: &str,
) -> Result<HashSet<String>, MigrationError> {
    let sql = format!("SELECT version FROM {}", quote_ident(table_name));
    let records = MigrationRecord::find_by_statement(Statement::from_string(DbBackend::Postgres, sql))
        .all(conn)
        .await
        .map_err(|e| MigrationError::QueryHistory {
            module: module_name.to_owned(),
            source: e,
        })?;
    Ok(records.into_iter().map(|r| r.version).collect())
}

async fn record_migration(
    conn: &impl ConnectionTrait,
    table_name: &str,
    module_name: &str,
    migration_name: &str,
) -> Result<(), MigrationError> {
    let sql = format!("INSERT INTO {} (version) VALUES ($1)", quote_ident(table_name));
    conn.execute(Statement::from_sql_and_values(
        DbBackend::Postgres,
        &sql,
        [migration_name.into()],
    ))
    .await
    .map_err(|e| MigrationError::RecordFailed {
        module: module_name.to_owned(),
        migration: migration_name.to_owned(),
        source: e,
    })?;
    Ok(())
}

/// Tenant tables the guard checks: everything in the catalog carrying the
/// tenant column, plus registered entities whose table already exists.
async fn guarded_tables(
    conn: &impl ConnectionTrait,
    store: &PolicyStore,
) -> Result<Vec<TenantTable>, DbErr> {
    let mut tables: BTreeMap<String, TenantTable> = store
        .discover(conn)
        .await?
        .into_iter()
        .map(|table| {
            let t = TenantTable {
                table: table.clone(),
                tenant_column: store.tenant_column().to_owned(),
                source: TableSource::Discovered,
            };
            (table, t)
        })
        .collect();

    // Conflicts surface separately through `registered_tables` in the caller.
    if let Ok(registered) = registered_tables() {
        for t in registered {
            tables.insert(t.table.clone(), t);
        }
    }
    Ok(tables.into_values().collect())
}

async fn check_policies<C>(conn: &C, store: &PolicyStore) -> Result<Vec<PolicyIssue>, DbErr>
where
    C: ConnectionTrait + TransactionTrait,
{
    let tables = guarded_tables(conn, store).await?;
    let issues = store.check(conn, &tables).await?;
    Ok(issues
        .into_iter()
        .filter(|i| !matches!(i, PolicyIssue::MissingTable { .. }))
        .collect())
}

/// Run `migrations` for `module_name`.
///
/// Migrations are applied in name order; already-applied ones are skipped.
///
/// # Example
///
/// ```ignore
/// let conn = tenancy_db::pool::connect_migrator(&cfg).await?;
/// let store = PolicyStore::from_config(&cfg);
/// let result = run_migrations(&conn, "courses", courses::migrations(), &store).await?;
/// ```
///
/// # Errors
///
/// Returns `MigrationError` if the history table cannot be used, a migration
/// fails, or a migration leaves a tenant table without a valid policy.
pub async fn run_migrations<C>(
    conn: &C,
    module_name: &str,
    migrations: Vec<Box<dyn MigrationTrait>>,
    store: &PolicyStore,
) -> Result<MigrationResult, MigrationError>
where
    C: ConnectionTrait + TransactionTrait,
{
    if migrations.is_empty() {
        debug!(module = module_name, "no migrations to run");
        return Ok(MigrationResult::default());
    }

    let mut seen = HashSet::new();
    for m in &migrations {
        if !seen.insert(m.name().to_owned()) {
            return Err(MigrationError::DuplicateMigrationName {
                module: module_name.to_owned(),
                name: m.name().to_owned(),
            });
        }
    }
    registered_tables()?;

    let table_name = migration_table_name(module_name);
    ensure_migration_table(conn, &table_name, module_name).await?;
    let applied = get_applied_migrations(conn, &table_name, module_name).await?;

    let mut sorted = migrations;
    sorted.sort_by(|a, b| a.name().cmp(b.name()));

    let mut result = MigrationResult::default();
    for migration in sorted {
        let name = migration.name().to_owned();
        if applied.contains(&name) {
            debug!(module = module_name, migration = %name, "migration already applied, skipping");
            result.skipped += 1;
            continue;
        }

        info!(module = module_name, migration = %name, "applying migration");
        let failed = |source| MigrationError::MigrationFailed {
            module: module_name.to_owned(),
            migration: name.clone(),
            source,
        };

        let txn = conn.begin().await.map_err(failed)?;
        let res: Result<(), MigrationError> = async {
            let manager = SchemaManager::new(&txn);
            migration.up(&manager).await.map_err(failed)?;

            let issues = check_policies(&txn, store).await.map_err(failed)?;
            if !issues.is_empty() {
                return Err(MigrationError::MissingPolicy {
                    module: module_name.to_owned(),
                    migration: name.clone(),
                    issues,
                });
            }

            record_migration(&txn, &table_name, module_name, &name).await
        }
        .await;

        match res {
            Ok(()) => txn.commit().await.map_err(failed)?,
            Err(err) => {
                if let Err(e) = txn.rollback().await {
                    tracing::warn!(module = module_name, migration = %name, error = %e, "rollback failed");
                }
                tracing::error!(module = module_name, migration = %name, error = %err, "migration rejected");
                return Err(err);
            }
        }

        info!(module = module_name, migration = %name, "migration applied");
        result.applied += 1;
        result.applied_names.push(name);
    }

    info!(
        module = module_name,
        applied = result.applied,
        skipped = result.skipped,
        "migration run complete"
    );
    Ok(result)
}
