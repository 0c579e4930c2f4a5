//! Relational role catalog.
//!
//! The catalog owns permissions, roles, users and their associations, plus the
//! derived `policy_rules` projection. Every write that changes an association
//! rewrites the matching projection rows inside the same transaction, so the
//! projection never disagrees with a committed association.

pub mod in_memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use warden_auth::{EngineError, NewPermission, Permission, PolicyRule, PolicySource, Role, User};
use warden_core::{PermissionId, RoleId, UserId};

pub use in_memory::InMemoryRbacStore;
pub use postgres::{PostgresRbacStore, map_sqlx_error};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected the write (e.g. duplicate name).
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A referential constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Connection, transaction or decoding failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Name-prefix filter and paging for list reads. Rows come back in id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub name_prefix: Option<String>,
    pub offset: u32,
    pub limit: Option<u32>,
}

impl ListQuery {
    /// Every row, unfiltered.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name_prefix.as_deref().is_none_or(|prefix| name.starts_with(prefix))
    }

    /// Filter rows already in id order, then cut the requested page.
    pub fn page<T>(&self, rows: impl Iterator<Item = T>, name: impl Fn(&T) -> &str) -> Vec<T> {
        let skip = usize::try_from(self.offset).unwrap_or(usize::MAX);
        let take = self
            .limit
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        rows.filter(|row| self.matches(name(row)))
            .skip(skip)
            .take(take)
            .collect()
    }
}

/// A role together with its attached permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleDetails {
    #[serde(flatten)]
    pub role: Role,
    pub permissions: Vec<Permission>,
}

/// A user together with the names of the roles it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserDetails {
    #[serde(flatten)]
    pub user: User,
    pub roles: Vec<String>,
}

/// Transactional access to the role catalog.
///
/// Write methods are single transactions: either the rows and their policy
/// projection change together, or nothing changes.
#[async_trait]
pub trait RbacStore: Send + Sync {
    async fn insert_permission(&self, new: NewPermission) -> Result<Permission, StoreError>;

    async fn list_permissions(&self, query: &ListQuery) -> Result<Vec<Permission>, StoreError>;

    /// Change only the description; path and method (and so the policy
    /// projection) stay as they are.
    async fn update_permission_description(
        &self,
        id: PermissionId,
        description: &str,
    ) -> Result<Permission, StoreError>;

    /// Permissions among `ids` that exist. Unknown ids are simply absent.
    async fn find_permissions(&self, ids: &[PermissionId]) -> Result<Vec<Permission>, StoreError>;

    /// Names of roles the permission is attached to.
    async fn roles_using_permission(&self, id: PermissionId) -> Result<Vec<String>, StoreError>;

    /// Fails with `Constraint` while the permission is attached to a role.
    async fn delete_permission(&self, id: PermissionId) -> Result<(), StoreError>;

    async fn find_role(&self, id: RoleId) -> Result<Option<Role>, StoreError>;

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError>;

    /// Roles among `ids` that exist.
    async fn find_roles(&self, ids: &[RoleId]) -> Result<Vec<Role>, StoreError>;

    async fn list_roles(&self, query: &ListQuery) -> Result<Vec<Role>, StoreError>;

    async fn role_permissions(&self, id: RoleId) -> Result<Vec<Permission>, StoreError>;

    /// Names of users holding the role.
    async fn users_with_role(&self, id: RoleId) -> Result<Vec<String>, StoreError>;

    /// Insert a role, attach `permissions` and write its `p` rules.
    async fn insert_role(
        &self,
        name: &str,
        description: &str,
        permissions: &[Permission],
    ) -> Result<Role, StoreError>;

    /// Update the description, replace the permission association and
    /// rewrite the role's `p` rules.
    async fn update_role(
        &self,
        id: RoleId,
        description: &str,
        permissions: &[Permission],
    ) -> Result<Role, StoreError>;

    /// Delete the role, its permission association and its `p` rules.
    /// Fails with `Constraint` while any user holds the role.
    async fn delete_role(&self, id: RoleId) -> Result<(), StoreError>;

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    async fn list_users(&self, query: &ListQuery) -> Result<Vec<User>, StoreError>;

    /// Insert a user holding `roles`, with its `g` rules.
    async fn insert_user(&self, name: &str, roles: &[Role]) -> Result<User, StoreError>;

    /// Names of the roles the user holds.
    async fn role_names_for_user(&self, id: UserId) -> Result<Vec<String>, StoreError>;

    /// Replace the user's role association and regenerate its `g` rules.
    async fn replace_user_roles(&self, id: UserId, roles: &[Role]) -> Result<(), StoreError>;

    /// Delete the user, its role association and its `g` rules.
    async fn delete_user(&self, id: UserId) -> Result<(), StoreError>;

    /// The full policy projection.
    async fn policy_rules(&self) -> Result<Vec<PolicyRule>, StoreError>;
}

/// `p` rules for a role holding `permissions`.
pub fn permission_rules(role: &str, permissions: &[Permission]) -> Vec<PolicyRule> {
    permissions
        .iter()
        .map(|p| PolicyRule::permission(role, &p.path, &p.method))
        .collect()
}

/// `g` rules placing `user` into `roles`.
pub fn grouping_rules(user: UserId, roles: &[Role]) -> Vec<PolicyRule> {
    let member = warden_auth::user_subject(user);
    roles
        .iter()
        .map(|r| PolicyRule::grouping(&member, &r.name))
        .collect()
}

/// Feeds the policy engine from the catalog's projection.
#[derive(Clone)]
pub struct CatalogPolicySource {
    store: Arc<dyn RbacStore>,
}

impl CatalogPolicySource {
    pub fn new(store: Arc<dyn RbacStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PolicySource for CatalogPolicySource {
    async fn load_rules(&self) -> Result<Vec<PolicyRule>, EngineError> {
        self.store
            .policy_rules()
            .await
            .map_err(|e| EngineError::Source(e.to_string()))
    }
}
