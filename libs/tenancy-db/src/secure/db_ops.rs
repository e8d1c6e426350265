use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, EntityTrait, QueryFilter, Value,
};
use std::marker::PhantomData;
use tenancy_security::{SessionMode, TenantContext};

use crate::secure::cond::{ScopeStamp, build_tenant_condition};
use crate::secure::error::ScopeError;
use crate::secure::{Scoped, TenantScopedEntity, Unscoped};
use crate::session::TenantSession;

/// Tenant-aware insert.
///
/// # Behavior by mode
///
/// - **Normal with tenant**: a tenant column left `NotSet` is stamped with the
///   bound tenant; an explicit value must equal it.
/// - **Normal without tenant**: refused, nothing to stamp.
/// - **Bypass**: the tenant column must be set explicitly, the binder has no
///   tenant to fill in.
///
/// Global entities are inserted untouched.
///
/// # Example
///
/// ```ignore
/// let am = course_progress::ActiveModel {
///     id: Set(Uuid::new_v4()),
///     user_email: Set("a@acme.test".to_owned()),
///     ..Default::default()
/// };
/// let row = secure_insert::<course_progress::Entity>(am, session).await?;
/// ```
///
/// # Errors
///
/// - `ScopeError::MissingTenant` when the row cannot be attributed to a tenant.
/// - `ScopeError::TenantMismatch` when the row names a different tenant.
/// - `ScopeError::Invalid` when the tenant column is not string-typed.
/// - `ScopeError::PolicyViolation` when the row policy rejects the row.
/// - `ScopeError::Db` for any other database failure.
pub async fn secure_insert<E>(
    mut am: E::ActiveModel,
    session: &TenantSession<'_>,
) -> Result<E::Model, ScopeError>
where
    E: TenantScopedEntity + EntityTrait,
    E::Column: ColumnTrait + Copy,
    E::ActiveModel: ActiveModelTrait<Entity = E> + Send,
    E::Model: sea_orm::IntoActiveModel<E::ActiveModel>,
{
    if let Some(col) = E::tenant_col() {
        stamp_tenant(&mut am, col, session.context())?;
    }
    am.insert(session.conn())
        .await
        .map_err(|e| session.classify(e))
}

pub(crate) fn stamp_tenant<A>(
    am: &mut A,
    col: <A::Entity as EntityTrait>::Column,
    ctx: &TenantContext,
) -> Result<(), ScopeError>
where
    A: ActiveModelTrait,
{
    let current = am.get(col);
    match ctx.mode() {
        SessionMode::Bypass => match current {
            ActiveValue::Set(_) | ActiveValue::Unchanged(_) => Ok(()),
            ActiveValue::NotSet => Err(ScopeError::MissingTenant),
        },
        SessionMode::Normal => {
            let tenant = ctx.tenant_id().ok_or(ScopeError::MissingTenant)?;
            let bound = Value::from(tenant.as_str());
            match current {
                ActiveValue::NotSet => am.try_set(col, bound).map_err(|e| {
                    tracing::error!(error = %e, "tenant column cannot hold a tenant id");
                    ScopeError::Invalid("tenant column does not accept a string tenant id")
                }),
                ActiveValue::Set(v) | ActiveValue::Unchanged(v) if v == bound => Ok(()),
                ActiveValue::Set(_) | ActiveValue::Unchanged(_) => {
                    Err(ScopeError::TenantMismatch)
                }
            }
        }
    }
}

/// A type-safe wrapper around `SeaORM`'s `UpdateMany` that enforces tenant scoping.
///
/// # Example
/// ```ignore
/// use tenancy_db::secure::SecureUpdateExt;
///
/// let result = course_progress::Entity::update_many()
///     .col_expr(course_progress::Column::Completed, Expr::value(true))
///     .secure()                    // SecureUpdateMany<E, Unscoped>
///     .scope_with(session.context())? // SecureUpdateMany<E, Scoped>
///     .exec(session)
///     .await?;
/// ```
#[must_use]
#[derive(Clone, Debug)]
pub struct SecureUpdateMany<E: EntityTrait, S> {
    pub(crate) inner: sea_orm::UpdateMany<E>,
    pub(crate) stamp: Option<ScopeStamp>,
    pub(crate) _state: PhantomData<S>,
}

/// Extension trait to convert a regular `SeaORM` `UpdateMany` into a `SecureUpdateMany`.
pub trait SecureUpdateExt<E: EntityTrait>: Sized {
    /// Convert this update operation into a secure (unscoped) update.
    /// You must call `.scope_with()` before executing.
    fn secure(self) -> SecureUpdateMany<E, Unscoped>;
}

impl<E> SecureUpdateExt<E> for sea_orm::UpdateMany<E>
where
    E: EntityTrait,
{
    fn secure(self) -> SecureUpdateMany<E, Unscoped> {
        SecureUpdateMany {
            inner: self,
            stamp: None,
            _state: PhantomData,
        }
    }
}

impl<E> SecureUpdateMany<E, Unscoped>
where
    E: TenantScopedEntity + EntityTrait,
    E::Column: ColumnTrait + Copy,
{
    /// Add the tenant predicate for `ctx`, transitioning to the `Scoped` state.
    ///
    /// # Errors
    /// Returns `ScopeError::MissingTenant` for an unbound `Normal` context.
    pub fn scope_with(
        self,
        ctx: &TenantContext,
    ) -> Result<SecureUpdateMany<E, Scoped>, ScopeError> {
        let inner = match build_tenant_condition::<E>(ctx)? {
            Some(cond) => self.inner.filter(cond),
            None => self.inner,
        };
        Ok(SecureUpdateMany {
            inner,
            stamp: Some(ScopeStamp::of(ctx)),
            _state: PhantomData,
        })
    }
}

impl<E> SecureUpdateMany<E, Scoped>
where
    E: EntityTrait,
{
    /// Add additional filters to the scoped update.
    pub fn filter(mut self, filter: sea_orm::Condition) -> Self {
        self.inner = QueryFilter::filter(self.inner, filter);
        self
    }

    /// Execute the update and return the number of affected rows.
    ///
    /// # Errors
    /// `ScopeError::ContextMismatch` if `session` is bound to another context,
    /// `ScopeError::PolicyViolation` if the new row values fail the policy check,
    /// `ScopeError::Db` otherwise.
    pub async fn exec(self, session: &TenantSession<'_>) -> Result<u64, ScopeError> {
        session.check_scope(self.stamp.as_ref())?;
        let res = self
            .inner
            .exec(session.conn())
            .await
            .map_err(|e| session.classify(e))?;
        Ok(res.rows_affected)
    }
}

/// A type-safe wrapper around `SeaORM`'s `DeleteMany` that enforces tenant scoping.
///
/// # Example
/// ```ignore
/// use tenancy_db::secure::SecureDeleteExt;
///
/// let removed = course_progress::Entity::delete_many()
///     .secure()
///     .scope_with(session.context())?
///     .filter(course_progress::Column::UserEmail.eq(email).into_condition())
///     .exec(session)
///     .await?;
/// ```
#[must_use]
#[derive(Clone, Debug)]
pub struct SecureDeleteMany<E: EntityTrait, S> {
    pub(crate) inner: sea_orm::DeleteMany<E>,
    pub(crate) stamp: Option<ScopeStamp>,
    pub(crate) _state: PhantomData<S>,
}

/// Extension trait to convert a regular `SeaORM` `DeleteMany` into a `SecureDeleteMany`.
pub trait SecureDeleteExt<E: EntityTrait>: Sized {
    /// Convert this delete operation into a secure (unscoped) delete.
    /// You must call `.scope_with()` before executing.
    fn secure(self) -> SecureDeleteMany<E, Unscoped>;
}

impl<E> SecureDeleteExt<E> for sea_orm::DeleteMany<E>
where
    E: EntityTrait,
{
    fn secure(self) -> SecureDeleteMany<E, Unscoped> {
        SecureDeleteMany {
            inner: self,
            stamp: None,
            _state: PhantomData,
        }
    }
}

impl<E> SecureDeleteMany<E, Unscoped>
where
    E: TenantScopedEntity + EntityTrait,
    E::Column: ColumnTrait + Copy,
{
    /// Add the tenant predicate for `ctx`, transitioning to the `Scoped` state.
    ///
    /// # Errors
    /// Returns `ScopeError::MissingTenant` for an unbound `Normal` context.
    pub fn scope_with(
        self,
        ctx: &TenantContext,
    ) -> Result<SecureDeleteMany<E, Scoped>, ScopeError> {
        let inner = match build_tenant_condition::<E>(ctx)? {
            Some(cond) => self.inner.filter(cond),
            None => self.inner,
        };
        Ok(SecureDeleteMany {
            inner,
            stamp: Some(ScopeStamp::of(ctx)),
            _state: PhantomData,
        })
    }
}

impl<E> SecureDeleteMany<E, Scoped>
where
    E: EntityTrait,
{
    /// Add additional filters to the scoped delete.
    /// The tenant predicate remains in place.
    pub fn filter(mut self, filter: sea_orm::Condition) -> Self {
        self.inner = QueryFilter::filter(self.inner, filter);
        self
    }

    /// Execute the delete and return the number of removed rows.
    ///
    /// # Errors
    /// Same as [`SecureUpdateMany::exec`].
    pub async fn exec(self, session: &TenantSession<'_>) -> Result<u64, ScopeError> {
        session.check_scope(self.stamp.as_ref())?;
        let res = self
            .inner
            .exec(session.conn())
            .await
            .map_err(|e| session.classify(e))?;
        Ok(res.rows_affected)
    }
}
