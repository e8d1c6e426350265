//! SQL identifier validation and quoting.
//!
//! Policy DDL, role switches and `SET LOCAL` cannot take bind parameters for
//! identifiers, so every name that is interpolated into SQL passes through
//! here first.

use std::sync::LazyLock;

use regex::Regex;

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap()
});

static SETTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z_][a-z0-9_]*\.[a-z_][a-z0-9_]*$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}': {rule}")]
pub struct IdentError {
    pub kind: &'static str,
    pub value: String,
    pub rule: &'static str,
}

/// Accept a plain lowercase SQL identifier (table, column, role, policy).
///
/// # Errors
/// Returns `IdentError` if `value` is not `[a-z_][a-z0-9_]*` of at most 63 bytes.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), IdentError> {
    if IDENT_RE.is_match(value) {
        Ok(())
    } else {
        Err(IdentError {
            kind,
            value: value.to_owned(),
            rule: "expected a lowercase identifier of at most 63 characters",
        })
    }
}

/// Accept a custom configuration parameter name such as `app.current_tenant`.
///
/// # Errors
/// Returns `IdentError` if the name is not of the `prefix.name` form.
pub fn validate_setting_name(value: &str) -> Result<(), IdentError> {
    if SETTING_RE.is_match(value) {
        Ok(())
    } else {
        Err(IdentError {
            kind: "session variable",
            value: value.to_owned(),
            rule: "expected a dotted custom parameter such as app.current_tenant",
        })
    }
}

/// Double-quote a validated identifier.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
