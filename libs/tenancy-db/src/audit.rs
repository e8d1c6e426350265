//! Audit trail for bypass sessions.
//!
//! The record is written and committed before the bypass transaction opens.
//! If it cannot be written, the bypass unit of work never runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue, ConnectionTrait, DatabaseConnection, DbErr, TransactionTrait};
use tenancy_security::{BypassGrant, BypassOperation, PrincipalKind};
use uuid::Uuid;

use crate::ident::quote_ident;

/// Name of the append-only audit table created by the bootstrap migrations.
pub const AUDIT_TABLE: &str = "tenancy_bypass_audit";

/// One bypass authorization, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor: Uuid,
    pub actor_kind: PrincipalKind,
    pub operation: BypassOperation,
    pub reason: String,
    pub tables_touched: Vec<String>,
    pub request_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    #[must_use]
    pub fn from_grant(grant: &BypassGrant, request_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: grant.actor(),
            actor_kind: grant.actor_kind(),
            operation: grant.operation(),
            reason: grant.reason().to_owned(),
            tables_touched: grant.tables().to_vec(),
            request_id: request_id.map(str::to_owned),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to write bypass audit record: {0}")]
    Write(#[from] DbErr),

    #[error("audit sink rejected the record: {0}")]
    Rejected(String),
}

/// Durable destination for bypass audit records.
///
/// `record` must not return until the record is durable.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// # Errors
    /// Returns `AuditError` if the record could not be persisted.
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

pub(crate) mod entity {
    use sea_orm::entity::prelude::*;

    use crate::secure::TenantScoped;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, TenantScoped)]
    #[sea_orm(table_name = "tenancy_bypass_audit")]
    #[tenancy(global)]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: Uuid,
        pub actor: Uuid,
        pub actor_kind: String,
        pub operation: String,
        pub reason: String,
        pub tables_touched: Json,
        pub request_id: Option<String>,
        pub recorded_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Writes audit records to [`AUDIT_TABLE`] in a dedicated transaction that
/// assumes the bypass role, the only role granted `INSERT` on the table.
#[derive(Clone)]
pub struct PgAuditSink {
    conn: DatabaseConnection,
    bypass_role: String,
}

impl std::fmt::Debug for PgAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgAuditSink")
            .field("bypass_role", &self.bypass_role)
            .finish_non_exhaustive()
    }
}

impl PgAuditSink {
    #[must_use]
    pub fn new(conn: DatabaseConnection, bypass_role: impl Into<String>) -> Self {
        Self {
            conn,
            bypass_role: bypass_role.into(),
        }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let row = entity::ActiveModel {
            id: ActiveValue::Set(record.id),
            actor: ActiveValue::Set(record.actor),
            actor_kind: ActiveValue::Set(record.actor_kind.as_str().to_owned()),
            operation: ActiveValue::Set(record.operation.as_str().to_owned()),
            reason: ActiveValue::Set(record.reason.clone()),
            tables_touched: ActiveValue::Set(serde_json::Value::from(
                record.tables_touched.clone(),
            )),
            request_id: ActiveValue::Set(record.request_id.clone()),
            recorded_at: ActiveValue::Set(record.recorded_at),
        };

        let txn = self.conn.begin().await?;
        txn.execute_unprepared(&format!("SET LOCAL ROLE {}", quote_ident(&self.bypass_role)))
            .await?;
        row.insert(&txn).await?;
        txn.commit().await?;
        Ok(())
    }
}

/// Gatekeeper in front of every bypass session.
#[derive(Clone)]
pub struct BypassAuditor {
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for BypassAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BypassAuditor").finish_non_exhaustive()
    }
}

impl BypassAuditor {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Persist the audit record for `grant`.
    ///
    /// # Errors
    /// Returns the sink's `AuditError`; the caller must not proceed.
    pub async fn admit(
        &self,
        grant: &BypassGrant,
        request_id: Option<&str>,
    ) -> Result<AuditRecord, AuditError> {
        let record = AuditRecord::from_grant(grant, request_id);
        match self.sink.record(&record).await {
            Ok(()) => {
                tracing::info!(
                    target: "security",
                    audit_id = %record.id,
                    actor = %record.actor,
                    operation = record.operation.as_str(),
                    tables = record.tables_touched.len(),
                    request_id = record.request_id.as_deref().unwrap_or(""),
                    "bypass session admitted"
                );
                Ok(record)
            }
            Err(e) => {
                tracing::error!(
                    target: "security",
                    actor = %record.actor,
                    operation = record.operation.as_str(),
                    request_id = record.request_id.as_deref().unwrap_or(""),
                    error = %e,
                    "bypass audit write failed, session refused"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tenancy_security::{
        BypassRequest, Principal, PrincipalTenantResolver, TenantResolver,
    };

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<AuditRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl AuditSink for MemorySink {
        async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
            if self.fail {
                return Err(AuditError::Rejected("disk full".to_owned()));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn grant() -> BypassGrant {
        let svc = Principal::new(Uuid::new_v4(), PrincipalKind::Service);
        PrincipalTenantResolver::new()
            .authorize_bypass(
                &svc,
                BypassRequest::new(BypassOperation::TenantProvisioning, "onboard initech")
                    .touching(["companies", "course_progress"]),
            )
            .unwrap()
    }

    #[test]
    fn record_copies_grant() {
        let g = grant();
        let rec = AuditRecord::from_grant(&g, Some("req-42"));
        assert_eq!(rec.actor, g.actor());
        assert_eq!(rec.actor_kind, PrincipalKind::Service);
        assert_eq!(rec.operation, BypassOperation::TenantProvisioning);
        assert_eq!(rec.reason, "onboard initech");
        assert_eq!(rec.tables_touched, vec!["companies", "course_progress"]);
        assert_eq!(rec.request_id.as_deref(), Some("req-42"));
    }

    #[tokio::test]
    async fn admit_persists_before_returning() {
        let sink = Arc::new(MemorySink::default());
        let auditor = BypassAuditor::new(sink.clone());
        let rec = auditor.admit(&grant(), None).await.unwrap();

        let stored = sink.records.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, rec.id);
    }

    #[tokio::test]
    async fn admit_propagates_sink_failure() {
        let sink = Arc::new(MemorySink {
            fail: true,
            ..MemorySink::default()
        });
        let auditor = BypassAuditor::new(sink.clone());
        let err = auditor.admit(&grant(), None).await.unwrap_err();
        assert!(matches!(err, AuditError::Rejected(_)));
        assert!(sink.records.lock().unwrap().is_empty());
    }
}
