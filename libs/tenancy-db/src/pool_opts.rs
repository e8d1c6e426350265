//! Pool builder configuration and the release/acquire verification hooks.

use std::sync::Arc;

use sea_orm::sqlx::PgConnection;
use sea_orm::sqlx::postgres::PgPoolOptions;

use crate::config::PoolConfig;
use crate::pool::{BindingProbe, Checkpoint, LeakMonitor, PROBE_SQL};

/// Trait for applying pool configuration to a pool builder.
pub trait ApplyPoolOpts {
    fn apply(self, opts: &PoolConfig) -> Self;
}

impl ApplyPoolOpts for PgPoolOptions {
    fn apply(self, opts: &PoolConfig) -> Self {
        self.max_connections(opts.max_conns)
            .min_connections(opts.min_conns)
            .acquire_timeout(opts.acquire_timeout)
            .idle_timeout(opts.idle_timeout)
            .max_lifetime(opts.max_lifetime)
    }
}

/// Install hooks that refuse to keep or hand out a connection whose tenant
/// variable is set or whose current role differs from the login role.
///
/// A rejected connection is closed by the pool and counted in `monitor`.
pub fn with_binding_verification(
    opts: PgPoolOptions,
    variable: &str,
    monitor: &Arc<LeakMonitor>,
) -> PgPoolOptions {
    let release_var = variable.to_owned();
    let release_monitor = Arc::clone(monitor);
    let acquire_var = variable.to_owned();
    let acquire_monitor = Arc::clone(monitor);

    opts.after_release(move |conn, _meta| {
        let variable = release_var.clone();
        let monitor = Arc::clone(&release_monitor);
        Box::pin(async move { Ok(verify(conn, &variable, &monitor, Checkpoint::Release).await) })
    })
    .before_acquire(move |conn, _meta| {
        let variable = acquire_var.clone();
        let monitor = Arc::clone(&acquire_monitor);
        Box::pin(async move { Ok(verify(conn, &variable, &monitor, Checkpoint::Acquire).await) })
    })
}

async fn verify(
    conn: &mut PgConnection,
    variable: &str,
    monitor: &LeakMonitor,
    checkpoint: Checkpoint,
) -> bool {
    let row = sea_orm::sqlx::query_as::<_, (Option<String>, bool)>(PROBE_SQL)
        .bind(variable)
        .fetch_one(&mut *conn)
        .await;

    match row {
        Ok((bound, own_role)) => {
            let probe = BindingProbe { bound, own_role };
            if probe.is_clean() {
                return true;
            }
            let incidents = monitor.record(checkpoint);
            tracing::error!(
                target: "security",
                checkpoint = checkpoint.as_str(),
                leaked_tenant = probe.bound.as_deref().unwrap_or(""),
                role_switched = !probe.own_role,
                incidents,
                "discarding pooled connection with leftover session binding"
            );
            false
        }
        Err(e) => {
            tracing::warn!(
                checkpoint = checkpoint.as_str(),
                error = %e,
                "binding probe failed, discarding connection"
            );
            false
        }
    }
}
