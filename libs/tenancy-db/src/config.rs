//! Engine configuration.
//!
//! Layering: built-in defaults -> optional YAML file -> environment
//! (`TENANCY__SECTION__KEY`, e.g. `TENANCY__DATABASE__DSN`).
//!
//! ```yaml
//! database:
//!   dsn: "postgres://tenancy_app:${TENANCY_DB_PASSWORD}@db:5432/app"
//!   pool:
//!     max_conns: 20
//!     acquire_timeout: 3s
//! session:
//!   variable: app.current_tenant
//!   bypass_role: tenancy_bypass
//!   acquire_retry:
//!     max_attempts: 3
//!     initial_backoff: 50ms
//! policy:
//!   tenant_column: company_id
//! ```

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ident::{IdentError, validate_identifier, validate_setting_name};

/// Environment prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "TENANCY__";

static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
});

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[source] Box<figment::Error>),

    #[error(transparent)]
    Ident(#[from] IdentError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable '{name}' referenced in DSN is not set")]
    MissingEnv {
        name: String,
        #[source]
        source: std::env::VarError,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        Self::Load(Box::new(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TenancyConfig {
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    /// Runtime DSN. Must log in as a role that is neither superuser nor
    /// `BYPASSRLS`. `${VAR}` references are expanded at connect time.
    pub dsn: String,
    /// Optional privileged DSN used only for migrations.
    pub migration_dsn: Option<String>,
    pub pool: PoolConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "postgres://tenancy_app@localhost:5432/app".to_owned(),
            migration_dsn: None,
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolConfig {
    pub max_conns: u32,
    pub min_conns: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 10,
            min_conns: 0,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
    /// Transaction-local custom parameter carrying the tenant id.
    pub variable: String,
    /// Role exempt from tenant policies after an explicit `SET LOCAL ROLE`.
    pub bypass_role: String,
    /// Units of work running longer than this are logged at warn.
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Duration,
    pub acquire_retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            variable: "app.current_tenant".to_owned(),
            bypass_role: "tenancy_bypass".to_owned(),
            slow_threshold: Duration::from_secs(2),
            acquire_retry: RetryConfig::default(),
        }
    }
}

/// Bounded retry for pool exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyConfig {
    pub schema: String,
    /// Column name that marks a table as tenant-owned.
    pub tenant_column: String,
    pub policy_name: String,
    /// Additional tenant tables not declared through entities.
    pub tables: Vec<String>,
    /// Treat every table in `schema` carrying `tenant_column` as tenant-scoped.
    pub discover: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_owned(),
            tenant_column: "company_id".to_owned(),
            policy_name: "tenant_isolation".to_owned(),
            tables: Vec::new(),
            discover: true,
        }
    }
}

impl TenancyConfig {
    /// Load layered configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if a layer fails to parse or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    /// Extract and validate from an already assembled figment.
    ///
    /// # Errors
    /// Returns `ConfigError` on extraction or validation failure.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let cfg: Self = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// Returns `ConfigError` if any identifier or bound is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_setting_name(&self.session.variable)?;
        validate_identifier("bypass role", &self.session.bypass_role)?;
        validate_identifier("schema", &self.policy.schema)?;
        validate_identifier("tenant column", &self.policy.tenant_column)?;
        validate_identifier("policy name", &self.policy.policy_name)?;
        for table in &self.policy.tables {
            validate_identifier("table", table)?;
        }

        let pool = &self.database.pool;
        if pool.max_conns == 0 {
            return Err(ConfigError::Invalid("database.pool.max_conns must be > 0".to_owned()));
        }
        if pool.min_conns > pool.max_conns {
            return Err(ConfigError::Invalid(
                "database.pool.min_conns must not exceed max_conns".to_owned(),
            ));
        }
        if self.session.acquire_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "session.acquire_retry.max_attempts must be >= 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Runtime DSN with `${VAR}` references expanded.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingEnv` if a referenced variable is unset.
    pub fn runtime_dsn(&self) -> Result<String, ConfigError> {
        expand_env_vars(&self.database.dsn)
    }

    /// Migration DSN, falling back to the runtime DSN.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingEnv` if a referenced variable is unset.
    pub fn migration_dsn(&self) -> Result<String, ConfigError> {
        expand_env_vars(
            self.database
                .migration_dsn
                .as_deref()
                .unwrap_or(&self.database.dsn),
        )
    }

    /// Copy safe to print or log.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        out.database.dsn = redact_credentials_in_dsn(&self.database.dsn);
        out.database.migration_dsn = self
            .database
            .migration_dsn
            .as_deref()
            .map(redact_credentials_in_dsn);
        out
    }
}

/// Expand `${VAR}` references from the process environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = input.to_owned();
    for caps in ENV_VAR_RE.captures_iter(input) {
        let name = &caps[1];
        let value = std::env::var(name).map_err(|source| ConfigError::MissingEnv {
            name: name.to_owned(),
            source,
        })?;
        result = result.replace(&caps[0], &value);
    }
    Ok(result)
}

/// Mask the password component of a DSN for logs.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: &str) -> String {
    if !dsn.contains('@') {
        return dsn.to_owned();
    }
    match url::Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_owned(),
    }
}
