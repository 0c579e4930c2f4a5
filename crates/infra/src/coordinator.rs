//! Ordered mutation pipeline across the catalog, the policy engine and the
//! role cache.
//!
//! Every mutation runs the same stages in order:
//!
//! 1. validate input against the catalog (no writes),
//! 2. commit one relational transaction,
//! 3. reload the policy engine from the committed projection,
//! 4. refresh affected cache entries and queue the delayed invalidation.
//!
//! A failed stage stops the pipeline, except that a committed change is never
//! rolled back: a reload failure is reported as [`CoordinatorError::ReloadFailed`]
//! with the relational state already in place. There is no distributed
//! transaction across the three stores.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use warden_auth::{
    EngineError, NewPermission, Permission, PolicyEngine, Role, RoleSet, User, validate_role_name,
    validate_user_name,
};
use warden_core::{DomainError, PermissionId, RoleId, UserId};

use crate::cache::{CacheError, RoleMembershipCache};
use crate::catalog::{CatalogPolicySource, ListQuery, RbacStore, RoleDetails, StoreError, UserDetails};
use crate::invalidation::InvalidationScheduler;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unresolved permission ids: {0:?}")]
    UnresolvedPermissions(Vec<PermissionId>),

    #[error("unresolved role ids: {0:?}")]
    UnresolvedRoles(Vec<RoleId>),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("role is still assigned to users: {0:?}")]
    InUseByUsers(Vec<String>),

    #[error("permission is still attached to roles: {0:?}")]
    PermissionInUse(Vec<String>),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("cache error: {0}")]
    Cache(CacheError),

    /// The relational change is committed; the engine still serves old rules.
    #[error("policy reload failed after commit: {0}")]
    ReloadFailed(EngineError),

    #[error("operation '{0}' timed out")]
    Timeout(&'static str),
}

impl From<DomainError> for CoordinatorError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::Conflict(msg) => Self::AlreadyExists(msg),
        }
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other),
        }
    }
}

/// Drives role, permission and user mutations through the ordered pipeline.
#[derive(Clone)]
pub struct AuthorizationCoordinator {
    store: Arc<dyn RbacStore>,
    source: CatalogPolicySource,
    engine: Arc<PolicyEngine>,
    cache: RoleMembershipCache,
    scheduler: InvalidationScheduler,
    store_timeout: Duration,
}

impl std::fmt::Debug for AuthorizationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCoordinator")
            .field("engine", &self.engine)
            .field("cache", &self.cache)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl AuthorizationCoordinator {
    pub fn new(
        store: Arc<dyn RbacStore>,
        engine: Arc<PolicyEngine>,
        cache: RoleMembershipCache,
        scheduler: InvalidationScheduler,
        store_timeout: Duration,
    ) -> Self {
        Self {
            source: CatalogPolicySource::new(store.clone()),
            store,
            engine,
            cache,
            scheduler,
            store_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pipeline stages
    // ─────────────────────────────────────────────────────────────────────

    /// Resolve permission ids, rejecting the whole set if any id is unknown.
    pub async fn validate_permissions(
        &self,
        ids: &[PermissionId],
    ) -> Result<Vec<Permission>, CoordinatorError> {
        let ids = dedupe(ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let found = self
            .store_call("find_permissions", self.store.find_permissions(&ids))
            .await?;
        let known: HashSet<PermissionId> = found.iter().map(|p| p.id).collect();
        let unresolved: Vec<PermissionId> = ids.into_iter().filter(|id| !known.contains(id)).collect();

        if !unresolved.is_empty() {
            return Err(CoordinatorError::UnresolvedPermissions(unresolved));
        }
        Ok(found)
    }

    /// Resolve role ids, rejecting the whole set if any id is unknown.
    pub async fn validate_roles(&self, ids: &[RoleId]) -> Result<Vec<Role>, CoordinatorError> {
        let ids = dedupe(ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let found = self.store_call("find_roles", self.store.find_roles(&ids)).await?;
        let known: HashSet<RoleId> = found.iter().map(|r| r.id).collect();
        let unresolved: Vec<RoleId> = ids.into_iter().filter(|id| !known.contains(id)).collect();

        if !unresolved.is_empty() {
            return Err(CoordinatorError::UnresolvedRoles(unresolved));
        }
        Ok(found)
    }

    /// Run one relational write under the store deadline.
    ///
    /// A write that times out may still have committed, so the engine is
    /// reloaded anyway before the timeout is reported.
    pub async fn commit<T, F>(&self, op: &'static str, write: F) -> Result<T, CoordinatorError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.store_call(op, write).await {
            Err(CoordinatorError::Timeout(op)) => {
                warn!(op, "commit outcome unknown after timeout; reloading policy");
                let _ = self.reload().await;
                Err(CoordinatorError::Timeout(op))
            }
            other => other,
        }
    }

    /// Replace the engine's rules with the committed projection.
    pub async fn reload(&self) -> Result<usize, CoordinatorError> {
        match self.engine.load_policy(&self.source).await {
            Ok(rules) => {
                debug!(rules, "policy engine reloaded");
                Ok(rules)
            }
            Err(err) => {
                error!(
                    error = %err,
                    consistency = "critical",
                    "policy reload failed after commit; engine serves stale rules until the next successful reload"
                );
                Err(CoordinatorError::ReloadFailed(err))
            }
        }
    }

    /// Invalidate, write the new membership, then queue the second invalidation.
    ///
    /// Cache failures are logged; the queued invalidation is the retry.
    pub async fn refresh_user_cache(&self, user: UserId, roles: &RoleSet) {
        match self.cache.invalidate(user).await {
            Ok(()) => {
                if let Err(err) = self.cache.set(user, roles, None).await {
                    warn!(user_id = %user, error = %err, "role cache write failed");
                }
            }
            // Writing on top of an entry that could not be deleted would merge
            // old and new members.
            Err(err) => warn!(user_id = %user, error = %err, "role cache invalidation failed; skipping write"),
        }
        self.scheduler.schedule(user);
    }

    async fn evict_user(&self, user: UserId) {
        if let Err(err) = self.cache.invalidate(user).await {
            warn!(user_id = %user, error = %err, "role cache invalidation failed");
        }
        self.scheduler.schedule(user);
    }

    async fn store_call<T, F>(&self, op: &'static str, fut: F) -> Result<T, CoordinatorError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result.map_err(CoordinatorError::from),
            Err(_) => Err(CoordinatorError::Timeout(op)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Roles
    // ─────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, description), fields(role = %name), err)]
    pub async fn create_role(
        &self,
        name: &str,
        description: &str,
        permission_ids: &[PermissionId],
    ) -> Result<RoleDetails, CoordinatorError> {
        let name = validate_role_name(name)?;
        let permissions = self.validate_permissions(permission_ids).await?;

        if self
            .store_call("find_role_by_name", self.store.find_role_by_name(&name))
            .await?
            .is_some()
        {
            return Err(CoordinatorError::AlreadyExists(format!("role '{name}'")));
        }

        let role = self
            .commit("insert_role", self.store.insert_role(&name, description, &permissions))
            .await
            .map_err(|e| duplicate_as_exists(e, format!("role '{name}'")))?;

        self.reload().await?;
        info!(role_id = %role.id, permissions = permissions.len(), "role created");
        Ok(RoleDetails { role, permissions })
    }

    #[instrument(skip(self, description), fields(role_id = %id), err)]
    pub async fn update_role(
        &self,
        id: RoleId,
        description: &str,
        permission_ids: &[PermissionId],
    ) -> Result<RoleDetails, CoordinatorError> {
        self.store_call("find_role", self.store.find_role(id))
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("role {id}")))?;
        let permissions = self.validate_permissions(permission_ids).await?;

        let role = self
            .commit("update_role", self.store.update_role(id, description, &permissions))
            .await?;

        self.reload().await?;
        info!(role = %role.name, permissions = permissions.len(), "role updated");
        Ok(RoleDetails { role, permissions })
    }

    #[instrument(skip(self), fields(role_id = %id), err)]
    pub async fn delete_role(&self, id: RoleId) -> Result<Role, CoordinatorError> {
        let role = self
            .store_call("find_role", self.store.find_role(id))
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("role {id}")))?;

        let users = self
            .store_call("users_with_role", self.store.users_with_role(id))
            .await?;
        if !users.is_empty() {
            return Err(CoordinatorError::InUseByUsers(users));
        }

        match self.commit("delete_role", self.store.delete_role(id)).await {
            Ok(()) => {}
            // Assigned between the check and the commit.
            Err(CoordinatorError::Store(StoreError::Constraint(_))) => {
                let users = self
                    .store_call("users_with_role", self.store.users_with_role(id))
                    .await?;
                return Err(CoordinatorError::InUseByUsers(users));
            }
            Err(err) => return Err(err),
        }

        self.reload().await?;
        info!(role = %role.name, "role deleted");
        Ok(role)
    }

    pub async fn role(&self, id: RoleId) -> Result<RoleDetails, CoordinatorError> {
        let role = self
            .store_call("find_role", self.store.find_role(id))
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("role {id}")))?;
        let permissions = self
            .store_call("role_permissions", self.store.role_permissions(id))
            .await?;
        Ok(RoleDetails { role, permissions })
    }

    pub async fn roles(&self, query: &ListQuery) -> Result<Vec<Role>, CoordinatorError> {
        self.store_call("list_roles", self.store.list_roles(query)).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Permissions
    // ─────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, new), fields(permission = %new.name), err)]
    pub async fn create_permission(&self, new: NewPermission) -> Result<Permission, CoordinatorError> {
        let what = format!("permission '{}'", new.name);
        let permission = self
            .commit("insert_permission", self.store.insert_permission(new))
            .await
            .map_err(|e| duplicate_as_exists(e, what))?;
        info!(permission_id = %permission.id, "permission created");
        Ok(permission)
    }

    /// Only the description changes. Path and method feed the policy
    /// projection and are fixed at creation, so no reload follows.
    #[instrument(skip(self, description), fields(permission_id = %id), err)]
    pub async fn update_permission(
        &self,
        id: PermissionId,
        description: &str,
    ) -> Result<Permission, CoordinatorError> {
        let permission = self
            .commit(
                "update_permission_description",
                self.store.update_permission_description(id, description),
            )
            .await?;
        info!(permission = %permission.name, "permission updated");
        Ok(permission)
    }

    pub async fn permission(&self, id: PermissionId) -> Result<Permission, CoordinatorError> {
        self.store_call("find_permissions", self.store.find_permissions(&[id]))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoordinatorError::NotFound(format!("permission {id}")))
    }

    /// Unattached permissions have no policy rules, so no reload follows.
    #[instrument(skip(self), fields(permission_id = %id), err)]
    pub async fn delete_permission(&self, id: PermissionId) -> Result<(), CoordinatorError> {
        let found = self
            .store_call("find_permissions", self.store.find_permissions(&[id]))
            .await?;
        if found.is_empty() {
            return Err(CoordinatorError::NotFound(format!("permission {id}")));
        }

        let roles = self
            .store_call("roles_using_permission", self.store.roles_using_permission(id))
            .await?;
        if !roles.is_empty() {
            return Err(CoordinatorError::PermissionInUse(roles));
        }

        match self.commit("delete_permission", self.store.delete_permission(id)).await {
            Ok(()) => Ok(()),
            Err(CoordinatorError::Store(StoreError::Constraint(_))) => {
                let roles = self
                    .store_call("roles_using_permission", self.store.roles_using_permission(id))
                    .await?;
                Err(CoordinatorError::PermissionInUse(roles))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn permissions(&self, query: &ListQuery) -> Result<Vec<Permission>, CoordinatorError> {
        self.store_call("list_permissions", self.store.list_permissions(query))
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────

    #[instrument(skip(self), err)]
    pub async fn create_user(&self, name: &str, role_ids: &[RoleId]) -> Result<User, CoordinatorError> {
        let name = validate_user_name(name)?;
        let roles = self.validate_roles(role_ids).await?;

        let user = self
            .commit("insert_user", self.store.insert_user(&name, &roles))
            .await
            .map_err(|e| duplicate_as_exists(e, format!("user '{name}'")))?;

        if !roles.is_empty() {
            self.reload().await?;
        }
        info!(user_id = %user.id, roles = roles.len(), "user created");
        Ok(user)
    }

    /// Replace a user's roles and refresh their cache entry.
    ///
    /// The cache is refreshed even when the reload fails, since the catalog
    /// already holds the new roles; the reload error is returned afterwards.
    #[instrument(skip(self), fields(user_id = %user), err)]
    pub async fn reassign_user_roles(
        &self,
        user: UserId,
        role_ids: &[RoleId],
    ) -> Result<RoleSet, CoordinatorError> {
        self.store_call("find_user", self.store.find_user(user))
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("user {user}")))?;
        let roles = self.validate_roles(role_ids).await?;

        self.commit("replace_user_roles", self.store.replace_user_roles(user, &roles))
            .await?;

        let reloaded = self.reload().await;
        let role_set = RoleSet::from_names(roles.iter().map(|r| r.name.clone()));
        self.refresh_user_cache(user, &role_set).await;
        reloaded?;

        info!(roles = role_set.len(), "user roles reassigned");
        Ok(role_set)
    }

    #[instrument(skip(self), fields(user_id = %user), err)]
    pub async fn delete_user(&self, user: UserId) -> Result<(), CoordinatorError> {
        self.store_call("find_user", self.store.find_user(user))
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("user {user}")))?;

        self.commit("delete_user", self.store.delete_user(user)).await?;

        let reloaded = self.reload().await;
        self.evict_user(user).await;
        reloaded?;

        info!("user deleted");
        Ok(())
    }

    pub async fn user(&self, id: UserId) -> Result<UserDetails, CoordinatorError> {
        let user = self
            .store_call("find_user", self.store.find_user(id))
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("user {id}")))?;
        let roles = self
            .store_call("role_names_for_user", self.store.role_names_for_user(id))
            .await?;
        Ok(UserDetails { user, roles })
    }

    pub async fn users(&self, query: &ListQuery) -> Result<Vec<User>, CoordinatorError> {
        self.store_call("list_users", self.store.list_users(query)).await
    }

    /// Warm the cache at login. Zero roles are cached as the empty marker.
    #[instrument(skip(self), fields(user_id = %user), err)]
    pub async fn prime_user_roles(&self, user: UserId) -> Result<RoleSet, CoordinatorError> {
        let names = self
            .store_call("role_names_for_user", self.store.role_names_for_user(user))
            .await?;
        let roles = RoleSet::from_names(names);

        match self.cache.invalidate(user).await {
            Ok(()) => {
                if let Err(err) = self.cache.set(user, &roles, None).await {
                    warn!(error = %err, "login role cache write failed");
                }
            }
            Err(err) => warn!(error = %err, "login role cache invalidation failed"),
        }
        Ok(roles)
    }

    /// Drop the user's cache entry at logout.
    #[instrument(skip(self), fields(user_id = %user), err)]
    pub async fn forget_user_session(&self, user: UserId) -> Result<(), CoordinatorError> {
        self.cache
            .invalidate(user)
            .await
            .map_err(CoordinatorError::Cache)
    }
}

fn dedupe<T: Copy + Eq + std::hash::Hash>(ids: &[T]) -> Vec<T> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn duplicate_as_exists(err: CoordinatorError, what: String) -> CoordinatorError {
    match err {
        CoordinatorError::Store(StoreError::Duplicate(_)) => CoordinatorError::AlreadyExists(what),
        other => other,
    }
}
