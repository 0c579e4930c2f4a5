//! Request-time authorization: role resolution plus policy evaluation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use warden_auth::{PolicyEngine, RoleDecision, RoleSet, evaluate_roles};
use warden_core::UserId;

use crate::cache::RoleMembershipCache;
use crate::catalog::{RbacStore, StoreError};

/// Role resolution failed; callers deny the request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorizeError {
    #[error("role lookup failed: {0}")]
    Store(StoreError),

    #[error("operation '{0}' timed out")]
    Timeout(&'static str),
}

/// Answers "may this user call this method on this path".
#[derive(Clone)]
pub struct Authorizer {
    store: Arc<dyn RbacStore>,
    engine: Arc<PolicyEngine>,
    cache: RoleMembershipCache,
    store_timeout: Duration,
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("engine", &self.engine)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Authorizer {
    pub fn new(
        store: Arc<dyn RbacStore>,
        engine: Arc<PolicyEngine>,
        cache: RoleMembershipCache,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            cache,
            store_timeout,
        }
    }

    /// Cache first, then the catalog, backfilling the cache on a miss.
    ///
    /// A cache read error counts as a miss. A user with no roles resolves to
    /// [`RoleSet::Empty`], which is cached too so repeat checks skip the catalog.
    pub async fn resolve_roles(&self, user: UserId) -> Result<RoleSet, AuthorizeError> {
        match self.cache.get(user).await {
            Ok(Some(roles)) => return Ok(roles),
            Ok(None) => {}
            Err(err) => warn!(user_id = %user, error = %err, "role cache read failed; falling back to catalog"),
        }

        let names = match tokio::time::timeout(self.store_timeout, self.store.role_names_for_user(user)).await {
            Ok(Ok(names)) => names,
            Ok(Err(err)) => return Err(AuthorizeError::Store(err)),
            Err(_) => return Err(AuthorizeError::Timeout("role_names_for_user")),
        };
        let roles = RoleSet::from_names(names);

        if let Err(err) = self.cache.set(user, &roles, None).await {
            warn!(user_id = %user, error = %err, "role cache backfill failed");
        }
        Ok(roles)
    }

    pub async fn decide(&self, user: UserId, path: &str, method: &str) -> Result<RoleDecision, AuthorizeError> {
        let roles = self.resolve_roles(user).await?;
        let decision = evaluate_roles(self.engine.as_ref(), &roles, path, method);
        debug!(user_id = %user, path, method, ?decision, "authorization decided");
        Ok(decision)
    }

    pub async fn authorize(&self, user: UserId, path: &str, method: &str) -> Result<bool, AuthorizeError> {
        Ok(self.decide(user, path, method).await?.is_allowed())
    }
}
