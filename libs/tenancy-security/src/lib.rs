#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant identity primitives for the tenancy engine.
//!
//! This crate has no database dependencies. It defines who is acting
//! ([`Principal`]), which tenant a unit of work belongs to ([`TenantContext`]),
//! and how that context is derived ([`TenantResolver`]). Privileged cross-tenant
//! access is only representable through a [`BypassGrant`], which can only be
//! minted by a resolver for an allow-listed [`BypassOperation`].
pub mod bypass;
pub mod context;
pub mod principal;
pub mod resolver;
pub mod tenant_id;

pub use bypass::{BypassGrant, BypassOperation, BypassRequest};
pub use context::{SessionMode, TenantContext};
pub use principal::{Principal, PrincipalKind};
pub use resolver::{PrincipalTenantResolver, ResolveError, TenantResolver};
pub use tenant_id::{TenantId, TenantIdError};
