use sea_orm::{
    ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::marker::PhantomData;
use tenancy_security::TenantContext;

use crate::secure::TenantScopedEntity;
use crate::secure::cond::{ScopeStamp, build_tenant_condition};
use crate::secure::error::ScopeError;
use crate::session::TenantSession;

/// Typestate marker: query has not yet been scoped.
/// Cannot execute queries in this state.
#[derive(Debug, Clone, Copy)]
pub struct Unscoped;

/// Typestate marker: query carries the tenant predicate.
#[derive(Debug, Clone, Copy)]
pub struct Scoped;

/// A type-safe wrapper around `SeaORM`'s `Select` that enforces tenant scoping.
///
/// Execution is only available in the `Scoped` state and only against a
/// [`TenantSession`] bound to the same context that scoped the query.
///
/// # Example
/// ```rust,ignore
/// use tenancy_db::secure::SecureEntityExt;
///
/// let rows = course_progress::Entity::find()
///     .secure()                // SecureSelect<E, Unscoped>
///     .scope_with(session.context())? // SecureSelect<E, Scoped>
///     .filter(course_progress::Column::UserEmail.eq(email).into_condition())
///     .all(session)
///     .await?;
/// ```
#[must_use]
#[derive(Clone, Debug)]
pub struct SecureSelect<E: EntityTrait, S> {
    pub(crate) inner: sea_orm::Select<E>,
    pub(crate) stamp: Option<ScopeStamp>,
    pub(crate) _state: PhantomData<S>,
}

/// Extension trait to convert a regular `SeaORM` `Select` into a `SecureSelect`.
pub trait SecureEntityExt<E: EntityTrait>: Sized {
    /// Convert this select query into a secure (unscoped) select.
    /// You must call `.scope_with()` before executing the query.
    fn secure(self) -> SecureSelect<E, Unscoped>;
}

impl<E> SecureEntityExt<E> for sea_orm::Select<E>
where
    E: EntityTrait,
{
    fn secure(self) -> SecureSelect<E, Unscoped> {
        SecureSelect {
            inner: self,
            stamp: None,
            _state: PhantomData,
        }
    }
}

impl<E> SecureSelect<E, Unscoped>
where
    E: TenantScopedEntity + EntityTrait,
    E::Column: ColumnTrait + Copy,
{
    /// Add the tenant predicate for `ctx`, transitioning to the `Scoped` state.
    ///
    /// # Errors
    /// Returns `ScopeError::MissingTenant` when `ctx` is `Normal` without a
    /// tenant and `E` is tenant-scoped.
    pub fn scope_with(self, ctx: &TenantContext) -> Result<SecureSelect<E, Scoped>, ScopeError> {
        let inner = match build_tenant_condition::<E>(ctx)? {
            Some(cond) => self.inner.filter(cond),
            None => self.inner,
        };
        Ok(SecureSelect {
            inner,
            stamp: Some(ScopeStamp::of(ctx)),
            _state: PhantomData,
        })
    }
}

impl<E> SecureSelect<E, Scoped>
where
    E: EntityTrait,
{
    /// Execute the query and return all matching rows.
    ///
    /// # Errors
    /// `ScopeError::ContextMismatch` if `session` is bound to another context,
    /// `ScopeError::Db` if the query fails.
    pub async fn all(self, session: &TenantSession<'_>) -> Result<Vec<E::Model>, ScopeError> {
        session.check_scope(self.stamp.as_ref())?;
        self.inner
            .all(session.conn())
            .await
            .map_err(|e| session.classify(e))
    }

    /// Execute the query and return at most one row.
    ///
    /// # Errors
    /// Same as [`all`](Self::all).
    pub async fn one(self, session: &TenantSession<'_>) -> Result<Option<E::Model>, ScopeError> {
        session.check_scope(self.stamp.as_ref())?;
        self.inner
            .one(session.conn())
            .await
            .map_err(|e| session.classify(e))
    }

    /// Count matching rows.
    ///
    /// # Errors
    /// Same as [`all`](Self::all).
    pub async fn count(self, session: &TenantSession<'_>) -> Result<u64, ScopeError>
    where
        E::Model: sea_orm::FromQueryResult + Send + Sync,
    {
        session.check_scope(self.stamp.as_ref())?;
        self.inner
            .count(session.conn())
            .await
            .map_err(|e| session.classify(e))
    }

    /// Add additional filters to the scoped query.
    /// The tenant predicate remains in place.
    pub fn filter(mut self, filter: sea_orm::Condition) -> Self {
        self.inner = QueryFilter::filter(self.inner, filter);
        self
    }

    /// Add ordering to the scoped query.
    pub fn order_by<C>(mut self, col: C, order: sea_orm::Order) -> Self
    where
        C: sea_orm::IntoSimpleExpr,
    {
        self.inner = QueryOrder::order_by(self.inner, col, order);
        self
    }

    /// Add a limit to the scoped query.
    pub fn limit(mut self, limit: u64) -> Self {
        self.inner = QuerySelect::limit(self.inner, limit);
        self
    }
}
