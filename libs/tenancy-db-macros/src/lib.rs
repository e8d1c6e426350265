#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
// Proc-macro crate for the tenancy-db application filter
//
//! # tenancy-db-macros
//!
//! ## `#[derive(TenantScoped)]`
//!
//! Implements `TenantScopedEntity` for a SeaORM entity and registers its table
//! in the tenant table registry used by the startup guard.
//!
//! Every entity must make an explicit decision: either name its tenant column
//! or declare itself global. There is no default.
//!
//! ```ignore
//! use sea_orm::entity::prelude::*;
//! use tenancy_db::secure::TenantScoped;
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
//! ```
//!
//! ### Attributes
//! - `tenant_col = "column_name"`: tenant-scoped entity
//! - `global`: not tenant-owned (lookup tables, the bypass audit log)
//! - `table = "name"`: override the table name taken from `#[sea_orm(table_name)]`

use proc_macro::TokenStream;
use proc_macro_error2::proc_macro_error;
use syn::{DeriveInput, parse_macro_input};

mod tenant_scoped;

/// Derive macro for implementing `TenantScopedEntity`.
///
/// Place it on the SeaORM `Model` struct next to `DeriveEntityModel`.
#[proc_macro_derive(TenantScoped, attributes(tenancy))]
#[proc_macro_error]
pub fn derive_tenant_scoped(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    tenant_scoped::expand_derive_tenant_scoped(&input).into()
}
