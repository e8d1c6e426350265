use sea_orm::{ColumnTrait, Condition, EntityTrait};
use tenancy_security::{SessionMode, TenantContext, TenantId};

use crate::secure::TenantScopedEntity;
use crate::secure::error::ScopeError;

/// Builds the tenant predicate for `E` under `ctx`.
///
/// # Rules
/// 1. **Global entity** -> no predicate (`Ok(None)`)
/// 2. **Bypass** -> no predicate; visibility is governed by the bypass role
/// 3. **Normal with tenant** -> `tenant_col = tenant_id`
/// 4. **Normal without tenant** -> `ScopeError::MissingTenant` (fail closed)
///
/// # Errors
/// Returns `ScopeError::MissingTenant` for rule 4.
pub fn build_tenant_condition<E>(ctx: &TenantContext) -> Result<Option<Condition>, ScopeError>
where
    E: TenantScopedEntity + EntityTrait,
    E::Column: ColumnTrait + Copy,
{
    let Some(col) = E::tenant_col() else {
        return Ok(None);
    };

    match ctx.mode() {
        SessionMode::Bypass => Ok(None),
        SessionMode::Normal => {
            let tenant = ctx.tenant_id().ok_or(ScopeError::MissingTenant)?;
            Ok(Some(
                Condition::all().add(ColumnTrait::eq(&col, tenant.as_str())),
            ))
        }
    }
}

/// The part of a context a scoped statement was built for.
///
/// Checked against the executing session so that a statement scoped for one
/// tenant cannot run inside another tenant's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeStamp {
    mode: SessionMode,
    tenant: Option<TenantId>,
}

impl ScopeStamp {
    #[must_use]
    pub fn of(ctx: &TenantContext) -> Self {
        Self {
            mode: ctx.mode(),
            tenant: ctx.tenant_id().cloned(),
        }
    }

    #[must_use]
    pub fn matches(&self, ctx: &TenantContext) -> bool {
        self.mode == ctx.mode() && self.tenant.as_ref() == ctx.tenant_id()
    }
}
