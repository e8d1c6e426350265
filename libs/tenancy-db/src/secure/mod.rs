//! Application-level tenant filter.
//!
//! Every statement on a tenant-scoped entity is built through a typestate
//! wrapper that cannot execute until `.scope_with(&ctx)` has added the
//! `tenant_col = <bound tenant>` predicate. This is the first of two
//! independent isolation layers; the row policies installed by
//! [`PolicyStore`](crate::policy::PolicyStore) are the second. Removing the
//! predicate never changes results, only cost.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tenancy_db::secure::{SecureEntityExt, TenantScoped};
//! use sea_orm::entity::prelude::*;
//!
//! #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TenantScoped)]
//! #[sea_orm(table_name = "course_progress")]
//! #[tenancy(tenant_col = "company_id")]
//! pub struct Model {
//!     #[sea_orm(primary_key)]
//!     pub id: Uuid,
//!     pub company_id: String,
//!     pub user_email: String,
//! }
//!
//! let rows = binder
//!     .with_tenant_session(&ctx, |session| {
//!         Box::pin(async move {
//!             Ok::<_, SessionError>(
//!                 Entity::find()
//!                     .secure()
//!                     .scope_with(session.context())?
//!                     .all(session)
//!                     .await?,
//!             )
//!         })
//!     })
//!     .await?;
//! ```
//!
//! # Rules
//!
//! | Context | Tenant-scoped entity | Global entity |
//! |---|---|---|
//! | `Normal` with tenant | `col = tenant` | unchanged |
//! | `Normal` without tenant | `ScopeError::MissingTenant` | unchanged |
//! | `Bypass` | unchanged (bypass role) | unchanged |
//!
//! A scoped statement also remembers the context it was scoped for and
//! refuses to run in a session bound to anything else.

pub mod cond;
pub mod db_ops;
pub mod entity_traits;
pub mod error;
pub mod select;


pub use cond::{ScopeStamp, build_tenant_condition};
pub use db_ops::{
    SecureDeleteExt, SecureDeleteMany, SecureUpdateExt, SecureUpdateMany, secure_insert,
};
pub use entity_traits::TenantScopedEntity;
pub use error::ScopeError;
pub use select::{Scoped, SecureEntityExt, SecureSelect, Unscoped};

pub use tenancy_db_macros::TenantScoped;
