use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DbErr};
use sea_orm_migration::{MigrationName, MigrationTrait, SchemaManager};

use crate::ident::{quote_ident, quote_literal};

/// Creates the role that bypass sessions assume with `SET LOCAL ROLE`.
///
/// The role cannot log in and is explicitly `NOBYPASSRLS`: its exemption
/// comes only from the `current_user` clause in each tenant policy.
#[derive(Debug, Clone)]
pub struct BypassRole {
    schema: String,
    role: String,
}

impl BypassRole {
    #[must_use]
    pub fn new(schema: &str, role: &str) -> Self {
        Self {
            schema: schema.to_owned(),
            role: role.to_owned(),
        }
    }

    fn sql(&self) -> String {
        let role = quote_ident(&self.role);
        let schema = quote_ident(&self.schema);
        let role_lit = quote_literal(&self.role);
        format!(
            "DO $tenancy$\n\
             BEGIN\n\
               IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = {role_lit}) THEN\n\
                 CREATE ROLE {role} NOLOGIN NOSUPERUSER NOBYPASSRLS;\n\
               END IF;\n\
             END\n\
             $tenancy$;\n\
             ALTER ROLE {role} NOLOGIN NOSUPERUSER NOBYPASSRLS;\n\
             GRANT USAGE ON SCHEMA {schema} TO {role};"
        )
    }
}

impl MigrationName for BypassRole {
    fn name(&self) -> &'static str {
        "m0001_bypass_role"
    }
}

#[async_trait]
impl MigrationTrait for BypassRole {
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
    fn role_is_created_without_privileges() {
        let sql = BypassRole::new("public", "tenancy_bypass").sql();
        assert!(sql.contains("rolname = 'tenancy_bypass'"));
        assert!(sql.contains(r#"CREATE ROLE "tenancy_bypass" NOLOGIN NOSUPERUSER NOBYPASSRLS"#));
        assert!(sql.contains(r#"GRANT USAGE ON SCHEMA "public" TO "tenancy_bypass""#));
    }
}
