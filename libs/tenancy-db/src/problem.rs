//! RFC 9457 problem documents for isolation errors.
//!
//! Every isolation failure collapses to the same generic 500 so a response
//! never reveals whether a row of another tenant exists. The detailed error
//! stays in the logs, correlated through `trace_id`.

use http::StatusCode;
use serde::{Serialize, Serializer};
use tenancy_security::ResolveError;

use crate::secure::ScopeError;
use crate::session::SessionError;

pub const APPLICATION_PROBLEM_JSON: &str = "application/problem+json";

const GENERIC_TITLE: &str = "Request failed";

#[allow(clippy::trivially_copy_pass_by_ref)] // serde requires &T signature
fn serialize_status_code<S>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u16(status.as_u16())
}

#[derive(Debug, Clone, Serialize)]
#[must_use]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_url: String,
    pub title: String,
    #[serde(serialize_with = "serialize_status_code")]
    pub status: StatusCode,
    pub detail: String,
    pub instance: String,
    /// Machine-readable code, stable across releases.
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Problem {
    pub fn new(status: StatusCode, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            type_url: "about:blank".to_owned(),
            title: title.into(),
            status,
            detail: detail.into(),
            instance: String::new(),
            code: String::new(),
            trace_id: None,
        }
    }

    pub fn with_instance(mut self, uri: impl Into<String>) -> Self {
        self.instance = uri.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    /// Attach the request correlation id, if there is one.
    pub fn with_request_id(self, request_id: Option<&str>) -> Self {
        match request_id {
            Some(id) => self.with_trace_id(id),
            None => self,
        }
    }

    fn request_failed(code: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            GENERIC_TITLE,
            "The request could not be completed.",
        )
        .with_code(code)
    }
}

impl From<&ResolveError> for Problem {
    fn from(err: &ResolveError) -> Self {
        match err {
            ResolveError::Unauthenticated => Self::new(
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "Authentication is required.",
            )
            .with_code("UNAUTHENTICATED"),
            ResolveError::NoTenant { .. } => Self::new(
                StatusCode::FORBIDDEN,
                "Forbidden",
                "The caller is not associated with a single company.",
            )
            .with_code("NO_TENANT"),
            ResolveError::BypassDenied { .. } => {
                Self::new(StatusCode::FORBIDDEN, "Forbidden", "The operation is not permitted.")
                    .with_code("BYPASS_DENIED")
            }
        }
    }
}

impl From<&SessionError> for Problem {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::PoolExhausted { .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service Unavailable",
                "The service is temporarily overloaded, retry later.",
            )
            .with_code("POOL_EXHAUSTED"),
            SessionError::Scope(scope) => Self::from(scope),
            SessionError::PolicyViolation
            | SessionError::BindingLeakDetected
            | SessionError::NestedSession
            | SessionError::AuditFailed(_)
            | SessionError::Db(_) => Self::request_failed("REQUEST_FAILED"),
        }
    }
}

impl From<&ScopeError> for Problem {
    fn from(_: &ScopeError) -> Self {
        Self::request_failed("REQUEST_FAILED")
    }
}
