//! Startup self-check.
//!
//! The process must refuse to serve traffic when isolation cannot hold:
//! the runtime role is exempt from row security, or a tenant table lacks
//! exactly one valid policy.

use std::collections::BTreeMap;

use sea_orm::{ConnectionTrait, DbBackend, DbErr, FromQueryResult, Statement};

use crate::config::TenancyConfig;
use crate::ident::IdentError;
use crate::policy::{PolicyIssue, PolicyStore, TableSource, TenantTable};
use crate::pool::{LeakIncidents, TenantPool};
use crate::registry::{RegistryConflict, registered_tables};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("runtime role '{role}' {reason}, row level security would not apply to it")]
    PrivilegedRole { role: String, reason: &'static str },

    #[error("tenant tables without a valid policy: {}", describe(.issues))]
    MissingPolicies { issues: Vec<PolicyIssue> },

    #[error(transparent)]
    Registry(#[from] RegistryConflict),

    #[error(transparent)]
    Ident(#[from] IdentError),

    #[error("catalog query failed: {0}")]
    Db(#[from] DbErr),
}

fn describe(issues: &[PolicyIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of a passing self-check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StartupReport {
    pub runtime_role: String,
    pub bypass_role_member: bool,
    pub tables: Vec<TenantTable>,
    pub incidents: LeakIncidents,
}

#[derive(Debug, FromQueryResult)]
struct RoleRow {
    role: String,
    superuser: bool,
    bypass_rls: bool,
    bypass_member: bool,
}

/// Run every startup check against the runtime pool.
///
/// # Errors
/// Returns the first failing check as a `StartupError`.
pub async fn run_startup_checks(
    pool: &TenantPool,
    cfg: &TenancyConfig,
) -> Result<StartupReport, StartupError> {
    let conn = pool.sea_internal();
    let store = PolicyStore::from_config(cfg);

    let role = check_runtime_role(conn, &cfg.session.bypass_role).await?;
    let tables = tenant_tables(conn, cfg, &store).await?;

    let issues = store.check(conn, &tables).await?;
    if !issues.is_empty() {
        for issue in &issues {
            tracing::error!(target: "security", table = issue.table(), "{issue}");
        }
        return Err(StartupError::MissingPolicies { issues });
    }

    tracing::info!(
        role = %role.role,
        tables = tables.len(),
        "tenant isolation self-check passed"
    );
    Ok(StartupReport {
        runtime_role: role.role,
        bypass_role_member: role.bypass_member,
        tables,
        incidents: pool.leak_monitor().incidents(),
    })
}

async fn check_runtime_role<C>(conn: &C, bypass_role: &str) -> Result<RoleRow, StartupError>
where
    C: ConnectionTrait,
{
    let row = RoleRow::find_by_statement(Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT r.rolname::text AS role, r.rolsuper AS superuser, r.rolbypassrls AS bypass_rls, \
                COALESCE(pg_has_role(current_user, b.oid, 'MEMBER'), false) AS bypass_member \
         FROM pg_roles r LEFT JOIN pg_roles b ON b.rolname = $1 \
         WHERE r.rolname = current_user",
        [bypass_role.into()],
    ))
    .one(conn)
    .await?
    .ok_or_else(|| DbErr::RecordNotFound("current role missing from pg_roles".to_owned()))?;

    if row.superuser {
        return Err(StartupError::PrivilegedRole {
            role: row.role,
            reason: "is a superuser",
        });
    }
    if row.bypass_rls {
        return Err(StartupError::PrivilegedRole {
            role: row.role,
            reason: "has BYPASSRLS",
        });
    }
    if !row.bypass_member {
        tracing::warn!(
            role = %row.role,
            bypass_role,
            "runtime role cannot assume the bypass role, bypass sessions will fail"
        );
    }
    Ok(row)
}

/// Registered entities, configured tables and (optionally) catalog
/// discovery, merged by table name. The first source to name a table wins.
async fn tenant_tables<C>(
    conn: &C,
    cfg: &TenancyConfig,
    store: &PolicyStore,
) -> Result<Vec<TenantTable>, StartupError>
where
    C: ConnectionTrait,
{
    let discovered = if cfg.policy.discover {
        store.discover(conn).await?
    } else {
        Vec::new()
    };
    Ok(merge_tables(
        registered_tables()?,
        &cfg.policy.tables,
        &discovered,
        store.tenant_column(),
    ))
}

fn merge_tables(
    registered: Vec<TenantTable>,
    configured: &[String],
    discovered: &[String],
    default_column: &str,
) -> Vec<TenantTable> {
    let mut merged: BTreeMap<String, TenantTable> = BTreeMap::new();
    let extra = configured
        .iter()
        .map(|t| (t, TableSource::Configured))
        .chain(discovered.iter().map(|t| (t, TableSource::Discovered)))
        .map(|(table, source)| TenantTable {
            table: table.clone(),
            tenant_column: default_column.to_owned(),
            source,
        });
    for t in registered.into_iter().chain(extra) {
        merged.entry(t.table.clone()).or_insert(t);
    }
    merged.into_values().collect()
}
