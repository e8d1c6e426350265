#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "integration")]

mod common;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{ACME_ROW, SHARED_EMAIL, course_progress, harness};
use sea_orm::{ActiveValue, ColumnTrait, Condition, ConnectionTrait, DbBackend, EntityTrait, Statement};
use tenancy_db::secure::{SecureEntityExt, SecureUpdateExt, secure_insert};
use tenancy_db::{
    AuditError, AuditRecord, AuditSink, PolicyIssue, Problem, ScopeError, SessionBinder, SessionError,
    StartupError, TenantPool, TenantSession, run_startup_checks,
};
use tenancy_security::{
    BypassOperation, BypassRequest, Principal, PrincipalKind, PrincipalTenantResolver,
    TenantContext, TenantId, TenantResolver,
};
use tokio::sync::oneshot;
use uuid::Uuid;

fn ctx(tenant: &str) -> TenantContext {
    TenantContext::for_tenant(TenantId::new(tenant).unwrap())
}

async fn raw_count(session: &TenantSession<'_>) -> Result<i64, SessionError> {
    let rows = session
        .query_raw("SELECT count(*)::bigint AS n FROM course_progress", [])
        .await?;
    let n = rows
        .first()
        .map(|r| r.try_get::<i64>("", "n"))
        .transpose()?
        .unwrap_or(0);
    Ok(n)
}

async fn count_as(binder: &SessionBinder, ctx: &TenantContext) -> Result<i64, SessionError> {
    binder
        .with_tenant_session(ctx, |s| Box::pin(async move { raw_count(s).await }))
        .await
}

fn platform_report_grant() -> tenancy_security::BypassGrant {
    let admin = Principal::new(Uuid::new_v4(), PrincipalKind::PlatformAdmin);
    PrincipalTenantResolver::new()
        .authorize_bypass(
            &admin,
            BypassRequest::new(BypassOperation::PlatformReport, "quarterly completion report")
                .touching(["course_progress"]),
        )
        .unwrap()
}

#[tokio::test]
async fn acme_sees_only_its_own_progress() -> Result<()> {
    let h = harness(4).await?;
    let acme = ctx("acme");

    let (secure, raw) = h
        .binder
        .with_tenant_session(&acme, |s| {
            Box::pin(async move {
                let secure = course_progress::Entity::find()
                    .secure()
                    .scope_with(s.context())?
                    .count(s)
                    .await?;
                let raw = raw_count(s).await?;
                Ok::<_, SessionError>((secure, raw))
            })
        })
        .await?;

    assert_eq!(secure, 1);
    assert_eq!(raw, 1);
    assert_eq!(count_as(&h.binder, &ctx("globex")).await?, 2);
    Ok(())
}

#[tokio::test]
async fn shared_email_resolves_to_the_bound_tenants_row_only() -> Result<()> {
    let h = harness(2).await?;

    let (secure, raw) = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                let secure = course_progress::Entity::find()
                    .secure()
                    .scope_with(s.context())?
                    .filter(Condition::all().add(course_progress::Column::UserEmail.eq(SHARED_EMAIL)))
                    .count(s)
                    .await?;
                let rows = s
                    .query_raw(
                        "SELECT count(*)::bigint AS n FROM course_progress WHERE user_email = $1",
                        [SHARED_EMAIL.into()],
                    )
                    .await?;
                let raw = rows
                    .first()
                    .map(|r| r.try_get::<i64>("", "n"))
                    .transpose()?
                    .unwrap_or(0);
                Ok::<_, SessionError>((secure, raw))
            })
        })
        .await?;
    assert_eq!(secure, 1);
    assert_eq!(raw, 1);

    let everyone = h
        .admin
        .query_one(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT count(*)::bigint AS n FROM course_progress WHERE user_email = $1",
            [SHARED_EMAIL.into()],
        ))
        .await?
        .unwrap()
        .try_get::<i64>("", "n")?;
    assert_eq!(everyone, 2);
    Ok(())
}

#[tokio::test]
async fn row_policies_hold_without_the_application_filter() -> Result<()> {
    let h = harness(4).await?;

    let (emails, updated, deleted) = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                let rows = s.query_raw("SELECT user_email FROM course_progress", []).await?;
                let emails = rows
                    .iter()
                    .map(|r| r.try_get::<String>("", "user_email"))
                    .collect::<Result<Vec<_>, _>>()?;
                let updated = s
                    .execute_raw(
                        "UPDATE course_progress SET completed = true WHERE company_id = 'globex'",
                        [],
                    )
                    .await?;
                let deleted = s.execute_raw("DELETE FROM course_progress WHERE company_id <> 'acme'", []).await?;
                Ok::<_, SessionError>((emails, updated, deleted))
            })
        })
        .await?;

    assert_eq!(emails, [SHARED_EMAIL]);
    assert_eq!(updated, 0);
    assert_eq!(deleted, 0);
    assert_eq!(h.total_rows().await?, 3);
    Ok(())
}

#[tokio::test]
async fn writing_another_tenants_row_is_a_policy_violation() -> Result<()> {
    let h = harness(4).await?;

    let err = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                s.execute_raw(
                    "INSERT INTO course_progress (id, company_id, user_email) \
                     VALUES (gen_random_uuid(), 'globex', 'mallory@acme.test')",
                    [],
                )
                .await?;
                Ok::<_, SessionError>(())
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PolicyViolation), "{err:?}");

    let err = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                let moved = s
                    .execute_raw(
                        "UPDATE course_progress SET company_id = 'globex' WHERE company_id = 'acme'",
                        [],
                    )
                    .await?;
                Ok::<_, SessionError>(moved)
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PolicyViolation), "{err:?}");
    assert_eq!(count_as(&h.binder, &ctx("acme")).await?, 1);
    Ok(())
}

#[tokio::test]
async fn inserts_are_stamped_and_foreign_tenants_rejected() -> Result<()> {
    let h = harness(4).await?;

    let row = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                let am = course_progress::ActiveModel {
                    id: ActiveValue::Set(Uuid::new_v4()),
                    user_email: ActiveValue::Set("bo@acme.test".to_owned()),
                    completed: ActiveValue::Set(false),
                    company_id: ActiveValue::NotSet,
                };
                let row = secure_insert::<course_progress::Entity>(am, s).await?;
                Ok::<_, SessionError>(row)
            })
        })
        .await?;
    assert_eq!(row.company_id, "acme");

    let err = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                let am = course_progress::ActiveModel {
                    id: ActiveValue::Set(Uuid::new_v4()),
                    company_id: ActiveValue::Set("globex".to_owned()),
                    user_email: ActiveValue::Set("eve@acme.test".to_owned()),
                    completed: ActiveValue::Set(false),
                };
                secure_insert::<course_progress::Entity>(am, s).await?;
                Ok::<_, SessionError>(())
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Scope(ScopeError::TenantMismatch)), "{err:?}");
    assert_eq!(h.total_rows().await?, 4);
    Ok(())
}

#[tokio::test]
async fn secure_update_touches_only_the_bound_tenant() -> Result<()> {
    let h = harness(4).await?;

    let updated = h
        .binder
        .with_tenant_session(&ctx("globex"), |s| {
            Box::pin(async move {
                let n = course_progress::Entity::update_many()
                    .col_expr(course_progress::Column::Completed, sea_orm::sea_query::Expr::value(true))
                    .secure()
                    .scope_with(s.context())?
                    .exec(s)
                    .await?;
                Ok::<_, SessionError>(n)
            })
        })
        .await?;
    assert_eq!(updated, 2);

    let acme_done = h
        .admin
        .query_one(Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT completed FROM course_progress WHERE id = $1",
            [Uuid::from_str(ACME_ROW)?.into()],
        ))
        .await?
        .unwrap()
        .try_get::<bool>("", "completed")?;
    assert!(acme_done, "acme row keeps its own value");
    Ok(())
}

#[tokio::test]
async fn unbound_session_sees_nothing() -> Result<()> {
    let h = harness(4).await?;
    let unbound = TenantContext::unbound();

    assert_eq!(count_as(&h.binder, &unbound).await?, 0);

    let err = h
        .binder
        .with_tenant_session(&unbound, |s| {
            Box::pin(async move {
                course_progress::Entity::find()
                    .secure()
                    .scope_with(s.context())?
                    .all(s)
                    .await?;
                Ok::<_, SessionError>(())
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Scope(ScopeError::MissingTenant)), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn binding_does_not_survive_pooled_reuse() -> Result<()> {
    let h = harness(1).await?;

    let first = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move { s.current_binding().await.map_err(SessionError::from) })
        })
        .await?;
    assert_eq!(first.as_deref(), Some("acme"));

    let second = h
        .binder
        .with_tenant_session(&TenantContext::unbound(), |s| {
            Box::pin(async move {
                let binding = s.current_binding().await?;
                let visible = raw_count(s).await?;
                Ok::<_, SessionError>((binding, visible))
            })
        })
        .await?;
    assert_eq!(second, (None, 0));
    assert_eq!(h.pool.leak_monitor().incidents().total(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_unit_of_work_rolls_back() -> Result<()> {
    let h = harness(1).await?;

    let res: Result<(), SessionError> = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                s.execute_raw("DELETE FROM course_progress", []).await?;
                Err(SessionError::Scope(ScopeError::Invalid("abort after delete")))
            })
        })
        .await;
    assert!(res.is_err());
    assert_eq!(count_as(&h.binder, &ctx("acme")).await?, 1);
    Ok(())
}

#[tokio::test]
async fn cancelled_unit_of_work_rolls_back() -> Result<()> {
    let h = harness(1).await?;

    let binder = h.binder.clone();
    let cancelled = tokio::time::timeout(
        Duration::from_millis(300),
        binder.with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                s.execute_raw("DELETE FROM course_progress", []).await?;
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, SessionError>(())
            })
        }),
    )
    .await;
    assert!(cancelled.is_err(), "unit of work should have been cancelled");

    // Pool of one: this also proves the connection came back clean.
    assert_eq!(count_as(&h.binder, &ctx("acme")).await?, 1);
    assert_eq!(h.total_rows().await?, 3);
    assert_eq!(h.pool.leak_monitor().incidents().total(), 0);
    Ok(())
}

#[tokio::test]
async fn escaped_session_binding_is_caught_and_connection_discarded() -> Result<()> {
    let h = harness(1).await?;

    // Simulates injected SQL ending the transaction and binding at session level.
    let err = h
        .binder
        .with_tenant_session(&ctx("acme"), |s| {
            Box::pin(async move {
                s.execute_raw("COMMIT", []).await?;
                s.execute_raw("SELECT set_config('app.current_tenant', 'globex', false)", [])
                    .await?;
                Ok::<_, SessionError>(())
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::BindingLeakDetected), "{err:?}");

    let unbound = TenantContext::unbound();
    let mut seen = None;
    for _ in 0..20 {
        match count_as(&h.binder, &unbound).await {
            Ok(n) => {
                seen = Some(n);
                break;
            }
            Err(SessionError::BindingLeakDetected) => {}
            Err(e) => return Err(e.into()),
        }
    }
    assert_eq!(seen, Some(0), "a clean connection must eventually be handed out");
    assert!(h.pool.leak_monitor().incidents().total() >= 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_pool_fails_after_bounded_retries() -> Result<()> {
    let h = harness(1).await?;
    let acme = ctx("acme");
    let globex = ctx("globex");
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let holder = h.binder.with_tenant_session(&acme, move |s| {
        Box::pin(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            raw_count(s).await
        })
    });
    let starved = async {
        let _ = started_rx.await;
        let res = count_as(&h.binder, &globex).await;
        let _ = release_tx.send(());
        res
    };
    let (held, starved) = tokio::join!(holder, starved);

    assert_eq!(held?, 1);
    let err = starved.unwrap_err();
    assert!(matches!(err, SessionError::PoolExhausted { attempts: 2 }), "{err:?}");
    let problem = Problem::from(&err);
    assert_eq!(problem.status.as_u16(), 503);
    assert_eq!(problem.code, "POOL_EXHAUSTED");

    // The held connection went back clean and serves the next session.
    assert_eq!(count_as(&h.binder, &globex).await?, 2);
    Ok(())
}

#[tokio::test]
async fn nested_sessions_are_refused() -> Result<()> {
    let h = harness(2).await?;

    let inner = h.binder.clone();
    let err = h
        .binder
        .with_tenant_session(&ctx("acme"), move |_s| {
            Box::pin(async move {
                let globex = ctx("globex");
                inner
                    .with_tenant_session(&globex, |s| Box::pin(async move { raw_count(s).await }))
                    .await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NestedSession), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn concurrent_sessions_stay_isolated() -> Result<()> {
    let h = harness(3).await?;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..24 {
        let binder = h.binder.clone();
        let (tenant, expected) = if i % 2 == 0 { ("acme", 1) } else { ("globex", 2) };
        tasks.spawn(async move {
            let n = count_as(&binder, &ctx(tenant)).await?;
            Ok::<_, SessionError>((n, expected))
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (n, expected) = joined??;
        assert_eq!(n, expected);
    }
    Ok(())
}

#[tokio::test]
async fn bypass_is_audited_before_it_runs() -> Result<()> {
    let h = harness(2).await?;

    let visible = h
        .binder
        .with_bypass(platform_report_grant(), |s| Box::pin(async move { raw_count(s).await }))
        .await?;
    assert_eq!(visible, 3);

    let audit = h
        .admin
        .query_one(Statement::from_string(
            DbBackend::Postgres,
            "SELECT count(*)::bigint AS n, min(operation) AS op, min(tables_touched::text) AS tables \
             FROM tenancy_bypass_audit",
        ))
        .await?
        .unwrap();
    assert_eq!(audit.try_get::<i64>("", "n")?, 1);
    assert_eq!(audit.try_get::<String>("", "op")?, "platform_report");
    assert_eq!(audit.try_get::<String>("", "tables")?, r#"["course_progress"]"#);

    let tamper = h
        .admin
        .execute_unprepared("DELETE FROM tenancy_bypass_audit")
        .await;
    assert!(tamper.is_err(), "audit rows are append-only");
    Ok(())
}

struct RejectingSink;

#[async_trait]
impl AuditSink for RejectingSink {
    async fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Err(AuditError::Rejected("audit store offline".to_owned()))
    }
}

#[tokio::test]
async fn audit_failure_aborts_bypass_with_zero_mutations() -> Result<()> {
    let h = harness(2).await?;
    let binder = SessionBinder::with_audit_sink(&h.pool, h.cfg.session.clone(), Arc::new(RejectingSink))?;

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let err = binder
        .with_bypass(platform_report_grant(), move |s| {
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                s.execute_raw("DELETE FROM course_progress", []).await?;
                Ok::<_, SessionError>(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::AuditFailed(_)), "{err:?}");
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(h.total_rows().await?, 3);
    Ok(())
}

#[tokio::test]
async fn startup_passes_for_a_protected_schema() -> Result<()> {
    let h = harness(2).await?;

    let report = run_startup_checks(&h.pool, &h.cfg).await?;
    assert_eq!(report.runtime_role, "tenancy_app");
    assert!(report.bypass_role_member);
    assert!(report.tables.iter().any(|t| t.table == "course_progress"));
    Ok(())
}

#[tokio::test]
async fn startup_refuses_a_tenant_table_without_policy() -> Result<()> {
    let h = harness(2).await?;
    h.admin
        .execute_unprepared(
            "CREATE TABLE quiz_attempts (id UUID PRIMARY KEY, company_id TEXT NOT NULL, score INT NOT NULL)",
        )
        .await?;

    let err = run_startup_checks(&h.pool, &h.cfg).await.unwrap_err();
    let StartupError::MissingPolicies { issues } = err else {
        panic!("expected MissingPolicies, got {err:?}");
    };
    assert!(issues.contains(&PolicyIssue::NoPolicy {
        table: "quiz_attempts".to_owned()
    }));
    assert!(issues.iter().all(|i| i.table() == "quiz_attempts"));
    Ok(())
}

#[tokio::test]
async fn startup_refuses_a_policy_that_exposes_every_row() -> Result<()> {
    let h = harness(2).await?;
    h.admin
        .execute_unprepared(
            "CREATE TABLE quiz_attempts (id UUID PRIMARY KEY, company_id TEXT NOT NULL, score INT NOT NULL);
             ALTER TABLE quiz_attempts ENABLE ROW LEVEL SECURITY;
             ALTER TABLE quiz_attempts FORCE ROW LEVEL SECURITY;
             CREATE POLICY tenant_isolation ON quiz_attempts AS PERMISSIVE FOR ALL
               USING (true OR company_id = NULLIF(current_setting('app.current_tenant', true), ''))
               WITH CHECK (true OR company_id = NULLIF(current_setting('app.current_tenant', true), ''));",
        )
        .await?;

    let err = run_startup_checks(&h.pool, &h.cfg).await.unwrap_err();
    let StartupError::MissingPolicies { issues } = err else {
        panic!("expected MissingPolicies, got {err:?}");
    };
    assert!(issues.contains(&PolicyIssue::PredicateMismatch {
        table: "quiz_attempts".to_owned(),
        policy: "tenant_isolation".to_owned(),
        column: "company_id".to_owned(),
    }));
    assert!(issues.iter().all(|i| i.table() == "quiz_attempts"));
    Ok(())
}

#[tokio::test]
async fn startup_refuses_a_privileged_runtime_role() -> Result<()> {
    let h = harness(1).await?;
    let superuser = TenantPool::connect_with(&h.db.url, &h.cfg.database.pool, &h.cfg.session.variable).await?;

    let err = run_startup_checks(&superuser, &h.cfg).await.unwrap_err();
    assert!(matches!(err, StartupError::PrivilegedRole { .. }), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn migration_without_policy_is_rolled_back() -> Result<()> {
    let h = harness(1).await?;
    let store = tenancy_db::PolicyStore::from_config(&h.cfg);

    let err = tenancy_db::run_migrations(
        &h.admin,
        "quizzes",
        vec![Box::new(common::CreateQuizAttemptsWithoutPolicy)],
        &store,
    )
    .await
    .unwrap_err();
    assert!(
        matches!(err, tenancy_db::MigrationError::MissingPolicy { ref migration, .. } if migration == "m0002_quiz_attempts"),
        "{err:?}"
    );

    let exists = h
        .admin
        .query_one(Statement::from_string(
            DbBackend::Postgres,
            "SELECT to_regclass('public.quiz_attempts') IS NOT NULL AS present",
        ))
        .await?
        .unwrap()
        .try_get::<bool>("", "present")?;
    assert!(!exists);
    Ok(())
}

#[tokio::test]
async fn bootstrap_is_idempotent() -> Result<()> {
    let h = harness(1).await?;
    let again = tenancy_db::migrations::run_bootstrap(&h.admin, &h.cfg).await?;
    assert_eq!(again.applied, 0);
    assert_eq!(again.skipped, 2);
    Ok(())
}
