use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use warden_auth::{NewPermission, Permission, PolicyRule, Role, User, user_subject};
use warden_core::{PermissionId, RoleId, UserId};

use super::{ListQuery, RbacStore, StoreError, grouping_rules, permission_rules};

#[derive(Debug, Clone, Default)]
struct CatalogState {
    last_id: i64,
    permissions: BTreeMap<PermissionId, Permission>,
    roles: BTreeMap<RoleId, Role>,
    users: BTreeMap<UserId, User>,
    role_permissions: BTreeMap<RoleId, BTreeSet<PermissionId>>,
    user_roles: BTreeMap<UserId, BTreeSet<RoleId>>,
    rules: BTreeSet<PolicyRule>,
}

impl CatalogState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn role(&self, id: RoleId) -> Result<&Role, StoreError> {
        self.roles
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("role {id}")))
    }

    fn user_names_with_role(&self, id: RoleId) -> Vec<String> {
        self.user_roles
            .iter()
            .filter(|(_, roles)| roles.contains(&id))
            .filter_map(|(user, _)| self.users.get(user).map(|u| u.name.clone()))
            .collect()
    }

    fn set_role_permissions(&mut self, role: &Role, permissions: &[Permission]) -> Result<(), StoreError> {
        for p in permissions {
            if !self.permissions.contains_key(&p.id) {
                return Err(StoreError::Constraint(format!("permission {} does not exist", p.id)));
            }
        }
        self.role_permissions
            .insert(role.id, permissions.iter().map(|p| p.id).collect());
        self.rules.retain(|r| !matches!(r, PolicyRule::Permission { role: name, .. } if *name == role.name));
        self.rules.extend(permission_rules(&role.name, permissions));
        Ok(())
    }

    fn set_user_roles(&mut self, user: UserId, roles: &[Role]) -> Result<(), StoreError> {
        for r in roles {
            if !self.roles.contains_key(&r.id) {
                return Err(StoreError::Constraint(format!("role {} does not exist", r.id)));
            }
        }
        self.user_roles
            .insert(user, roles.iter().map(|r| r.id).collect());
        let member = user_subject(user);
        self.rules.retain(|r| !matches!(r, PolicyRule::Grouping { member: m, .. } if *m == member));
        self.rules.extend(grouping_rules(user, roles));
        Ok(())
    }
}

/// In-memory role catalog.
///
/// Intended for tests/dev. Each write runs against a copy of the state that
/// is published only if the whole closure succeeds, mirroring a relational
/// transaction. Failures can be injected to exercise the commit and reload
/// paths of callers.
#[derive(Debug, Default)]
pub struct InMemoryRbacStore {
    state: RwLock<CatalogState>,
    fail_next_commit: AtomicBool,
    fail_policy_reads: AtomicBool,
    role_lookups: AtomicUsize,
}

impl InMemoryRbacStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write transaction fail at commit time.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make `policy_rules` fail until switched off again.
    pub fn fail_policy_reads(&self, fail: bool) {
        self.fail_policy_reads.store(fail, Ordering::SeqCst);
    }

    /// How many times `role_names_for_user` has been called.
    pub fn role_lookups(&self) -> usize {
        self.role_lookups.load(Ordering::SeqCst)
    }

    fn read<T>(&self, f: impl FnOnce(&CatalogState) -> T) -> Result<T, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        Ok(f(&state))
    }

    fn transact<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut CatalogState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        let mut draft = state.clone();
        let out = f(&mut draft)?;

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("commit failed in {op}")));
        }

        *state = draft;
        Ok(out)
    }
}

#[async_trait]
impl RbacStore for InMemoryRbacStore {
    async fn insert_permission(&self, new: NewPermission) -> Result<Permission, StoreError> {
        self.transact("insert_permission", |s| {
            if s.permissions.values().any(|p| p.name == new.name) {
                return Err(StoreError::Duplicate(format!("permission '{}'", new.name)));
            }
            let id = PermissionId::new(s.next_id());
            let permission = new.into_permission(id);
            s.permissions.insert(id, permission.clone());
            Ok(permission)
        })
    }

    async fn list_permissions(&self, query: &ListQuery) -> Result<Vec<Permission>, StoreError> {
        self.read(|s| query.page(s.permissions.values().cloned(), |p| p.name.as_str()))
    }

    async fn update_permission_description(
        &self,
        id: PermissionId,
        description: &str,
    ) -> Result<Permission, StoreError> {
        self.transact("update_permission_description", |s| {
            let permission = s
                .permissions
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("permission {id}")))?;
            permission.description = description.to_string();
            Ok(permission.clone())
        })
    }

    async fn find_permissions(&self, ids: &[PermissionId]) -> Result<Vec<Permission>, StoreError> {
        self.read(|s| ids.iter().filter_map(|id| s.permissions.get(id).cloned()).collect())
    }

    async fn roles_using_permission(&self, id: PermissionId) -> Result<Vec<String>, StoreError> {
        self.read(|s| {
            s.role_permissions
                .iter()
                .filter(|(_, perms)| perms.contains(&id))
                .filter_map(|(role, _)| s.roles.get(role).map(|r| r.name.clone()))
                .collect()
        })
    }

    async fn delete_permission(&self, id: PermissionId) -> Result<(), StoreError> {
        self.transact("delete_permission", |s| {
            if !s.permissions.contains_key(&id) {
                return Err(StoreError::NotFound(format!("permission {id}")));
            }
            if s.role_permissions.values().any(|perms| perms.contains(&id)) {
                return Err(StoreError::Constraint(format!("permission {id} is attached to a role")));
            }
            s.permissions.remove(&id);
            Ok(())
        })
    }

    async fn find_role(&self, id: RoleId) -> Result<Option<Role>, StoreError> {
        self.read(|s| s.roles.get(&id).cloned())
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError> {
        self.read(|s| s.roles.values().find(|r| r.name == name).cloned())
    }

    async fn find_roles(&self, ids: &[RoleId]) -> Result<Vec<Role>, StoreError> {
        self.read(|s| ids.iter().filter_map(|id| s.roles.get(id).cloned()).collect())
    }

    async fn list_roles(&self, query: &ListQuery) -> Result<Vec<Role>, StoreError> {
        self.read(|s| query.page(s.roles.values().cloned(), |r| r.name.as_str()))
    }

    async fn role_permissions(&self, id: RoleId) -> Result<Vec<Permission>, StoreError> {
        self.read(|s| {
            s.role_permissions
                .get(&id)
                .map(|ids| ids.iter().filter_map(|p| s.permissions.get(p).cloned()).collect())
                .unwrap_or_default()
        })
    }

    async fn users_with_role(&self, id: RoleId) -> Result<Vec<String>, StoreError> {
        self.read(|s| s.user_names_with_role(id))
    }

    async fn insert_role(
        &self,
        name: &str,
        description: &str,
        permissions: &[Permission],
    ) -> Result<Role, StoreError> {
        self.transact("insert_role", |s| {
            if s.roles.values().any(|r| r.name == name) {
                return Err(StoreError::Duplicate(format!("role '{name}'")));
            }
            let role = Role {
                id: RoleId::new(s.next_id()),
                name: name.to_string(),
                description: description.to_string(),
            };
            s.roles.insert(role.id, role.clone());
            s.set_role_permissions(&role, permissions)?;
            Ok(role)
        })
    }

    async fn update_role(
        &self,
        id: RoleId,
        description: &str,
        permissions: &[Permission],
    ) -> Result<Role, StoreError> {
        self.transact("update_role", |s| {
            let mut role = s.role(id)?.clone();
            role.description = description.to_string();
            s.roles.insert(id, role.clone());
            s.set_role_permissions(&role, permissions)?;
            Ok(role)
        })
    }

    async fn delete_role(&self, id: RoleId) -> Result<(), StoreError> {
        self.transact("delete_role", |s| {
            let role = s.role(id)?.clone();
            if !s.user_names_with_role(id).is_empty() {
                return Err(StoreError::Constraint(format!("role '{}' is assigned to users", role.name)));
            }
            s.set_role_permissions(&role, &[])?;
            s.role_permissions.remove(&id);
            s.roles.remove(&id);
            Ok(())
        })
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        self.read(|s| s.users.get(&id).cloned())
    }

    async fn list_users(&self, query: &ListQuery) -> Result<Vec<User>, StoreError> {
        self.read(|s| query.page(s.users.values().cloned(), |u| u.name.as_str()))
    }

    async fn insert_user(&self, name: &str, roles: &[Role]) -> Result<User, StoreError> {
        self.transact("insert_user", |s| {
            if s.users.values().any(|u| u.name == name) {
                return Err(StoreError::Duplicate(format!("user '{name}'")));
            }
            let user = User {
                id: UserId::new(s.next_id()),
                name: name.to_string(),
            };
            s.users.insert(user.id, user.clone());
            s.set_user_roles(user.id, roles)?;
            Ok(user)
        })
    }

    async fn role_names_for_user(&self, id: UserId) -> Result<Vec<String>, StoreError> {
        self.role_lookups.fetch_add(1, Ordering::SeqCst);
        self.read(|s| {
            s.user_roles
                .get(&id)
                .map(|ids| ids.iter().filter_map(|r| s.roles.get(r).map(|r| r.name.clone())).collect())
                .unwrap_or_default()
        })
    }

    async fn replace_user_roles(&self, id: UserId, roles: &[Role]) -> Result<(), StoreError> {
        self.transact("replace_user_roles", |s| {
            if !s.users.contains_key(&id) {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
            s.set_user_roles(id, roles)
        })
    }

    async fn delete_user(&self, id: UserId) -> Result<(), StoreError> {
        self.transact("delete_user", |s| {
            if s.users.remove(&id).is_none() {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
            s.set_user_roles(id, &[])?;
            s.user_roles.remove(&id);
            Ok(())
        })
    }

    async fn policy_rules(&self) -> Result<Vec<PolicyRule>, StoreError> {
        if self.fail_policy_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("policy_rules unavailable".to_string()));
        }
        self.read(|s| s.rules.iter().cloned().collect())
    }
}
