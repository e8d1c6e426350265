use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tenancy_db::{TenancyConfig, TenantPool, connect_migrator, migrations, run_startup_checks};
use tracing_subscriber::EnvFilter;

/// Tenant isolation guard - verifies and bootstraps row-level isolation
#[derive(Parser)]
#[command(name = "tenancy-guard")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the startup self-check against the runtime role and exit
    Check,
    /// Apply the bootstrap migrations with the migration DSN
    Migrate,
    /// Print the effective configuration with credentials redacted
    PrintConfig,
}

fn init_logging(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TenancyConfig> {
    if let Some(path) = path
        && !path.is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.display());
    }
    TenancyConfig::load(path).context("loading tenancy configuration")
}

async fn check(cfg: &TenancyConfig) -> Result<()> {
    let pool = TenantPool::connect(cfg)
        .await
        .context("connecting with the runtime role")?;
    let outcome = run_startup_checks(&pool, cfg).await;
    pool.close().await;
    match outcome {
        Ok(report) => print_json(&report),
        Err(e) => {
            tracing::error!(target: "security", error = %e, "tenant isolation self-check failed");
            Err(e.into())
        }
    }
}

async fn migrate(cfg: &TenancyConfig) -> Result<()> {
    let conn = connect_migrator(cfg)
        .await
        .context("connecting with the migration role")?;
    let result = migrations::run_bootstrap(&conn, cfg).await?;
    print_json(&result)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let cfg = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Check => check(&cfg).await,
        Commands::Migrate => migrate(&cfg).await,
        Commands::PrintConfig => print_json(&cfg.redacted()),
    }
}
