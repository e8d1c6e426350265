use sea_orm::EntityTrait;

/// Declares whether an entity is tenant-owned and through which column.
///
/// There is no implicit default: every entity must either name its tenant
/// column or be explicitly global.
///
/// # Example (Manual Implementation)
/// ```rust,ignore
/// impl TenantScopedEntity for course_progress::Entity {
///     fn tenant_col() -> Option<Self::Column> {
///         Some(course_progress::Column::CompanyId)
///     }
/// }
/// ```
///
/// # Example (Using Derive Macro)
/// ```rust,ignore
/// use tenancy_db::secure::TenantScoped;
///
/// #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TenantScoped)]
/// #[sea_orm(table_name = "course_progress")]
/// #[tenancy(tenant_col = "company_id")]
/// pub struct Model {
///     #[sea_orm(primary_key)]
///     pub id: Uuid,
///     pub company_id: String,
///     pub user_email: String,
/// }
/// ```
///
/// The derive also registers the table with the startup guard; a manual
/// implementation must list the table in `policy.tables` instead.
pub trait TenantScopedEntity: EntityTrait {
    /// Compile-time marker set by `#[tenancy(global)]`.
    const IS_GLOBAL: bool = false;

    /// Column holding the tenant id, `None` for global entities.
    fn tenant_col() -> Option<Self::Column>;
}
