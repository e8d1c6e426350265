//! Row-level security policies for tenant tables.
//!
//! Each tenant table carries exactly one permissive `FOR ALL` policy:
//!
//! ```sql
//! ALTER TABLE t ENABLE ROW LEVEL SECURITY;
//! ALTER TABLE t FORCE ROW LEVEL SECURITY;
//! CREATE POLICY tenant_isolation ON t AS PERMISSIVE FOR ALL
//!   USING (company_id = NULLIF(current_setting('app.current_tenant', true), '')
//!          OR current_user = 'tenancy_bypass')
//!   WITH CHECK (same);
//! GRANT SELECT, INSERT, UPDATE, DELETE ON t TO tenancy_bypass;
//! ```
//!
//! `FORCE` makes the table owner subject to the policy too. An unset
//! variable and the `''` sentinel both compare as NULL, so an unbound
//! session matches no rows.

use sea_orm::{ConnectionTrait, DbBackend, DbErr, FromQueryResult, Statement, TransactionTrait};

use crate::config::TenancyConfig;
use crate::ident::{IdentError, quote_ident, quote_literal, validate_identifier, validate_setting_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateKind {
    /// `tenant_column = <session tenant>`
    Equality,
}

/// One table's isolation policy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Policy {
    pub schema: String,
    pub table: String,
    pub tenant_column: String,
    pub name: String,
    pub predicate: PredicateKind,
    pub variable: String,
    /// Role exempt from the predicate once assumed with `SET LOCAL ROLE`.
    pub bypass_role: Option<String>,
}

impl Policy {
    #[must_use]
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Boolean expression used for both `USING` and `WITH CHECK`.
    #[must_use]
    pub fn predicate_sql(&self) -> String {
        let tenant_match = match self.predicate {
            PredicateKind::Equality => format!(
                "{} = NULLIF(current_setting({}, true), '')",
                quote_ident(&self.tenant_column),
                quote_literal(&self.variable)
            ),
        };
        match &self.bypass_role {
            Some(role) => format!("({tenant_match} OR current_user = {})", quote_literal(role)),
            None => format!("({tenant_match})"),
        }
    }

    /// Statements that (re)install the policy. Idempotent.
    #[must_use]
    pub fn ddl(&self) -> Vec<String> {
        let table = self.qualified_table();
        let name = quote_ident(&self.name);
        let predicate = self.predicate_sql();

        let mut out = vec![
            format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"),
            format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY"),
            format!("DROP POLICY IF EXISTS {name} ON {table}"),
            format!(
                "CREATE POLICY {name} ON {table} AS PERMISSIVE FOR ALL \
                 USING {predicate} WITH CHECK {predicate}"
            ),
        ];
        if let Some(role) = &self.bypass_role {
            out.push(format!(
                "GRANT SELECT, INSERT, UPDATE, DELETE ON {table} TO {}",
                quote_ident(role)
            ));
        }
        out
    }

    /// Install the policy.
    ///
    /// # Errors
    /// Returns `DbErr` if any statement fails.
    pub async fn apply<C>(&self, conn: &C) -> Result<(), DbErr>
    where
        C: ConnectionTrait,
    {
        for stmt in self.ddl() {
            conn.execute_unprepared(&stmt).await?;
        }
        tracing::info!(
            table = %self.table,
            column = %self.tenant_column,
            policy = %self.name,
            "tenant policy installed"
        );
        Ok(())
    }
}

/// Where a table was declared tenant-scoped.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "origin")]
pub enum TableSource {
    /// `#[derive(TenantScoped)]` on the named entity module.
    Entity(&'static str),
    /// Listed in `policy.tables`.
    Configured,
    /// Found in the catalog carrying the tenant column.
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TenantTable {
    pub table: String,
    pub tenant_column: String,
    pub source: TableSource,
}

/// Scratch table the reference predicate is installed on.
const REFERENCE_TABLE: &str = "tenancy_policy_reference";

/// The generated predicate as the server deparses it for one column.
///
/// Postgres stores policy expressions normalized (casts added, quoting
/// dropped), so the expected text is obtained from the server itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePredicate {
    pub column: String,
    pub expr: String,
}

/// Catalog state of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableState {
    pub exists: bool,
    pub rls_enabled: bool,
    pub rls_forced: bool,
    pub policies: Vec<PolicyRow>,
    /// `None` when the table lacks the tenant column.
    pub reference: Option<ReferencePredicate>,
}

/// One row of `pg_policies`.
#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct PolicyRow {
    pub name: String,
    pub permissive: String,
    pub cmd: String,
    pub qual: Option<String>,
    pub with_check: Option<String>,
}

#[derive(Debug, FromQueryResult)]
struct RlsFlags {
    rls_enabled: bool,
    rls_forced: bool,
}

#[derive(Debug, FromQueryResult)]
struct TableName {
    table_name: String,
}

#[derive(Debug, FromQueryResult)]
struct ColumnType {
    column_type: String,
}

#[derive(Debug, FromQueryResult)]
struct DeparsedExpr {
    expr: String,
}

/// What is wrong with a tenant table's policy setup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyIssue {
    #[error("table '{table}' does not exist")]
    MissingTable { table: String },

    #[error("table '{table}' does not have row level security enabled")]
    RlsDisabled { table: String },

    #[error("table '{table}' does not force row level security")]
    RlsNotForced { table: String },

    #[error("table '{table}' has no tenant policy")]
    NoPolicy { table: String },

    #[error("table '{table}' has {} policies, expected exactly one", .names.len())]
    MultiplePolicies { table: String, names: Vec<String> },

    #[error("policy '{policy}' on '{table}' must be PERMISSIVE FOR ALL")]
    WrongKind { table: String, policy: String },

    #[error("policy '{policy}' on '{table}' does not compare '{column}' with the session tenant")]
    PredicateMismatch {
        table: String,
        policy: String,
        column: String,
    },

    #[error("policy '{policy}' on '{table}' has no matching WITH CHECK clause")]
    MissingWithCheck { table: String, policy: String },
}

impl PolicyIssue {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::MissingTable { table }
            | Self::RlsDisabled { table }
            | Self::RlsNotForced { table }
            | Self::NoPolicy { table }
            | Self::MultiplePolicies { table, .. }
            | Self::WrongKind { table, .. }
            | Self::PredicateMismatch { table, .. }
            | Self::MissingWithCheck { table, .. } => table,
        }
    }
}

/// Generates, installs and inspects tenant policies for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStore {
    schema: String,
    tenant_column: String,
    policy_name: String,
    variable: String,
    bypass_role: String,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::from_config(&TenancyConfig::default())
    }
}

impl PolicyStore {
    #[must_use]
    pub fn from_config(cfg: &TenancyConfig) -> Self {
        Self {
            schema: cfg.policy.schema.clone(),
            tenant_column: cfg.policy.tenant_column.clone(),
            policy_name: cfg.policy.policy_name.clone(),
            variable: cfg.session.variable.clone(),
            bypass_role: cfg.session.bypass_role.clone(),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[must_use]
    pub fn tenant_column(&self) -> &str {
        &self.tenant_column
    }

    /// Policy for `table` keyed on the default tenant column.
    ///
    /// # Errors
    /// Returns `IdentError` if `table` is not a plain identifier.
    pub fn policy_for(&self, table: &str) -> Result<Policy, IdentError> {
        self.policy_for_column(table, &self.tenant_column)
    }

    /// Policy for `table` keyed on `column`.
    ///
    /// # Errors
    /// Returns `IdentError` if any identifier is invalid.
    pub fn policy_for_column(&self, table: &str, column: &str) -> Result<Policy, IdentError> {
        validate_identifier("schema", &self.schema)?;
        validate_identifier("table", table)?;
        validate_identifier("tenant column", column)?;
        validate_identifier("policy name", &self.policy_name)?;
        validate_identifier("bypass role", &self.bypass_role)?;
        validate_setting_name(&self.variable)?;
        Ok(Policy {
            schema: self.schema.clone(),
            table: table.to_owned(),
            tenant_column: column.to_owned(),
            name: self.policy_name.clone(),
            predicate: PredicateKind::Equality,
            variable: self.variable.clone(),
            bypass_role: Some(self.bypass_role.clone()),
        })
    }

    /// Tables in the schema that carry the tenant column.
    ///
    /// # Errors
    /// Returns `DbErr` if the catalog query fails.
    pub async fn discover<C>(&self, conn: &C) -> Result<Vec<String>, DbErr>
    where
        C: ConnectionTrait,
    {
        let rows = TableName::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT c.relname::text AS table_name \
             FROM pg_attribute a \
             JOIN pg_class c ON c.oid = a.attrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND a.attname = $2 \
               AND NOT a.attisdropped AND c.relkind IN ('r', 'p') \
             ORDER BY 1",
            [self.schema.as_str().into(), self.tenant_column.as_str().into()],
        ))
        .all(conn)
        .await?;
        Ok(rows.into_iter().map(|r| r.table_name).collect())
    }

    /// Read the catalog state of `table`, including the reference predicate
    /// for `column`.
    ///
    /// # Errors
    /// Returns `DbErr` if a catalog query fails.
    pub async fn inspect<C>(&self, conn: &C, table: &str, column: &str) -> Result<TableState, DbErr>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let flags = RlsFlags::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT c.relrowsecurity AS rls_enabled, c.relforcerowsecurity AS rls_forced \
             FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')",
            [self.schema.as_str().into(), table.into()],
        ))
        .one(conn)
        .await?;

        let Some(flags) = flags else {
            return Ok(TableState::default());
        };

        let policies = PolicyRow::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT policyname::text AS name, permissive::text AS permissive, \
                    cmd::text AS cmd, qual::text AS qual, with_check::text AS with_check \
             FROM pg_policies WHERE schemaname = $1 AND tablename = $2 \
             ORDER BY policyname",
            [self.schema.as_str().into(), table.into()],
        ))
        .all(conn)
        .await?;

        let column_type = ColumnType::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT format_type(a.atttypid, a.atttypmod) AS column_type \
             FROM pg_attribute a \
             JOIN pg_class c ON c.oid = a.attrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2 AND a.attname = $3 \
               AND a.attnum > 0 AND NOT a.attisdropped",
            [self.schema.as_str().into(), table.into(), column.into()],
        ))
        .one(conn)
        .await?;

        let reference = match column_type {
            Some(t) => Some(self.reference_predicate(conn, column, &t.column_type).await?),
            None => None,
        };

        Ok(TableState {
            exists: true,
            rls_enabled: flags.rls_enabled,
            rls_forced: flags.rls_forced,
            policies,
            reference,
        })
    }

    /// Install the generated predicate on a temporary table with a
    /// `column` of `column_type` and read back its deparsed form.
    /// Everything is rolled back afterwards.
    async fn reference_predicate<C>(
        &self,
        conn: &C,
        column: &str,
        column_type: &str,
    ) -> Result<ReferencePredicate, DbErr>
    where
        C: TransactionTrait,
    {
        let policy = self
            .policy_for_column(REFERENCE_TABLE, column)
            .map_err(|e| DbErr::Custom(e.to_string()))?;
        let predicate = policy.predicate_sql();
        let scratch = format!("pg_temp.{}", quote_ident(REFERENCE_TABLE));

        let txn = conn.begin().await?;
        let deparsed = async {
            txn.execute_unprepared(&format!(
                "CREATE TEMP TABLE {} ({} {column_type}) ON COMMIT DROP",
                quote_ident(REFERENCE_TABLE),
                quote_ident(column)
            ))
            .await?;
            txn.execute_unprepared(&format!(
                "CREATE POLICY {} ON {scratch} AS PERMISSIVE FOR ALL \
                 USING {predicate} WITH CHECK {predicate}",
                quote_ident(&policy.name)
            ))
            .await?;
            DeparsedExpr::find_by_statement(Statement::from_string(
                DbBackend::Postgres,
                format!(
                    "SELECT pg_get_expr(p.polqual, p.polrelid) AS expr \
                     FROM pg_policy p WHERE p.polrelid = {}::regclass",
                    quote_literal(&scratch)
                ),
            ))
            .one(&txn)
            .await
        }
        .await;
        txn.rollback().await?;

        let row = deparsed?
            .ok_or_else(|| DbErr::RecordNotFound("reference policy missing from pg_policy".to_owned()))?;
        Ok(ReferencePredicate {
            column: column.to_owned(),
            expr: row.expr,
        })
    }

    /// Inspect and verify every table in `tables`.
    ///
    /// # Errors
    /// Returns `DbErr` if a catalog query fails.
    pub async fn check<C>(&self, conn: &C, tables: &[TenantTable]) -> Result<Vec<PolicyIssue>, DbErr>
    where
        C: ConnectionTrait + TransactionTrait,
    {
        let mut issues = Vec::new();
        for t in tables {
            let state = self.inspect(conn, &t.table, &t.tenant_column).await?;
            issues.extend(Self::verify(&t.table, &t.tenant_column, &state));
        }
        Ok(issues)
    }

    /// Judge a table's catalog state against the expected policy shape.
    #[must_use]
    pub fn verify(table: &str, column: &str, state: &TableState) -> Vec<PolicyIssue> {
        let table_name = || table.to_owned();
        if !state.exists {
            return vec![PolicyIssue::MissingTable { table: table_name() }];
        }

        let mut issues = Vec::new();
        if !state.rls_enabled {
            issues.push(PolicyIssue::RlsDisabled { table: table_name() });
        }
        if !state.rls_forced {
            issues.push(PolicyIssue::RlsNotForced { table: table_name() });
        }

        match state.policies.as_slice() {
            [] => issues.push(PolicyIssue::NoPolicy { table: table_name() }),
            [only] => issues.extend(verify_policy(table, column, only, state.reference.as_ref())),
            many => issues.push(PolicyIssue::MultiplePolicies {
                table: table_name(),
                names: many.iter().map(|p| p.name.clone()).collect(),
            }),
        }
        issues
    }
}

/// Both clauses must equal the reference text exactly. A predicate that
/// merely mentions the column and the variable can still expose every row.
fn verify_policy(
    table: &str,
    column: &str,
    row: &PolicyRow,
    reference: Option<&ReferencePredicate>,
) -> Vec<PolicyIssue> {
    let expected = reference.filter(|r| r.column == column).map(|r| r.expr.as_str());
    let is_expected = |expr: Option<&str>| expr.is_some() && expr == expected;

    let mut issues = Vec::new();
    if !row.permissive.eq_ignore_ascii_case("PERMISSIVE") || !row.cmd.eq_ignore_ascii_case("ALL") {
        issues.push(PolicyIssue::WrongKind {
            table: table.to_owned(),
            policy: row.name.clone(),
        });
    }
    if !is_expected(row.qual.as_deref()) {
        issues.push(PolicyIssue::PredicateMismatch {
            table: table.to_owned(),
            policy: row.name.clone(),
            column: column.to_owned(),
        });
    }
    if !is_expected(row.with_check.as_deref()) {
        issues.push(PolicyIssue::MissingWithCheck {
            table: table.to_owned(),
            policy: row.name.clone(),
        });
    }
    issues
}
