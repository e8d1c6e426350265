use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DbErr};
use sea_orm_migration::{MigrationName, MigrationTrait, SchemaManager};

use crate::audit::AUDIT_TABLE;
use crate::ident::quote_ident;

/// Append-only audit table for bypass sessions.
///
/// Only the bypass role may insert or read; a trigger rejects `UPDATE`,
/// `DELETE` and `TRUNCATE` for everyone, the table owner included.
#[derive(Debug, Clone)]
pub struct BypassAuditTable {
    schema: String,
    role: String,
}

impl BypassAuditTable {
    #[must_use]
    pub fn new(schema: &str, role: &str) -> Self {
        Self {
            schema: schema.to_owned(),
            role: role.to_owned(),
        }
    }

    fn sql(&self) -> String {
        let schema = quote_ident(&self.schema);
        let table = format!("{schema}.{}", quote_ident(AUDIT_TABLE));
        let func = format!("{schema}.{}", quote_ident("tenancy_bypass_audit_reject"));
        let role = quote_ident(&self.role);
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
               id UUID PRIMARY KEY,\n\
               actor UUID NOT NULL,\n\
               actor_kind TEXT NOT NULL,\n\
               operation TEXT NOT NULL,\n\
               reason TEXT NOT NULL CHECK (length(btrim(reason)) > 0),\n\
               tables_touched JSONB NOT NULL DEFAULT '[]'::jsonb,\n\
               request_id TEXT,\n\
               recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
             );\n\
             CREATE OR REPLACE FUNCTION {func}() RETURNS trigger LANGUAGE plpgsql AS $tenancy$\n\
             BEGIN\n\
               RAISE EXCEPTION 'bypass audit records are append-only';\n\
             END\n\
             $tenancy$;\n\
             DROP TRIGGER IF EXISTS tenancy_bypass_audit_no_update ON {table};\n\
             CREATE TRIGGER tenancy_bypass_audit_no_update BEFORE UPDATE OR DELETE ON {table}\n\
               FOR EACH ROW EXECUTE FUNCTION {func}();\n\
             DROP TRIGGER IF EXISTS tenancy_bypass_audit_no_truncate ON {table};\n\
             CREATE TRIGGER tenancy_bypass_audit_no_truncate BEFORE TRUNCATE ON {table}\n\
               FOR EACH STATEMENT EXECUTE FUNCTION {func}();\n\
             REVOKE ALL ON {table} FROM PUBLIC;\n\
             GRANT SELECT, INSERT ON {table} TO {role};"
        )
    }
}

impl MigrationName for BypassAuditTable {
    fn name(&self) -> &'static str {
        "m0002_bypass_audit"
    }
}

#[async_trait]
impl MigrationTrait for BypassAuditTable {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.get_connection().execute_unprepared(&self.sql()).await?;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn audit_table_is_append_only_and_private() {
        let sql = BypassAuditTable::new("public", "tenancy_bypass").sql();
        assert!(sql.contains(r#"CREATE TABLE IF NOT EXISTS "public"."tenancy_bypass_audit""#));
        assert!(sql.contains("BEFORE UPDATE OR DELETE"));
        assert!(sql.contains("BEFORE TRUNCATE"));
        assert!(sql.contains(r#"REVOKE ALL ON "public"."tenancy_bypass_audit" FROM PUBLIC"#));
        assert!(sql.contains(r#"GRANT SELECT, INSERT ON "public"."tenancy_bypass_audit" TO "tenancy_bypass""#));
    }
}
