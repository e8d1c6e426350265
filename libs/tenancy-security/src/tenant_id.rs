use std::fmt;
use std::str::FromStr;

/// Maximum accepted length, matching the Postgres identifier limit so that a
/// tenant id can also be used in role or schema names by operators.
pub const MAX_TENANT_ID_LEN: usize = 63;

/// Opaque tenant ("company") identifier.
///
/// The value is never interpreted by the engine beyond validation. The empty
/// string is reserved as the "no tenant" session sentinel and is therefore
/// never a valid id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantIdError {
    #[error("tenant id is empty")]
    Empty,

    #[error("tenant id exceeds {MAX_TENANT_ID_LEN} characters")]
    TooLong,

    #[error("tenant id contains forbidden character '{0}'")]
    ForbiddenChar(char),
}

impl TenantId {
    /// Validate and wrap a raw tenant id.
    ///
    /// Allowed characters are ASCII letters, digits, `_`, `-` and `.`.
    ///
    /// # Errors
    /// Returns `TenantIdError` if the value is empty, too long, or contains a
    /// character outside the allowed set.
    pub fn new(raw: impl Into<String>) -> Result<Self, TenantIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(TenantIdError::TooLong);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(TenantIdError::ForbiddenChar(c));
        }
        Ok(Self(raw))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TenantId").field(&self.0).finish()
    }
}

impl FromStr for TenantId {
    type Err = TenantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
