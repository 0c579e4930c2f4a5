//! Request and response bodies.

use serde::{Deserialize, Serialize};

use warden_auth::RoleSet;
use warden_core::{PermissionId, RoleId, UserId};
use warden_infra::catalog::ListQuery;

/// Largest page a list route returns.
pub const MAX_PAGE_SIZE: u32 = 500;

/// `?name=<prefix>&offset=<n>&limit=<n>` on the list routes.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub name: Option<String>,
    #[serde(default)]
    pub offset: u32,
    pub limit: Option<u32>,
}

impl From<ListParams> for ListQuery {
    fn from(params: ListParams) -> Self {
        ListQuery {
            name_prefix: params.name.filter(|prefix| !prefix.is_empty()),
            offset: params.offset,
            limit: params.limit.map(|limit| limit.min(MAX_PAGE_SIZE)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePermissionRequest {
    pub name: String,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub description: String,
}

/// Only the description is editable once a permission exists.
#[derive(Debug, Deserialize)]
pub struct UpdatePermissionRequest {
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permission_ids: Vec<PermissionId>,
}

/// Full replacement of a role's description and permission set.
#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permission_ids: Vec<PermissionId>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    #[serde(default)]
    pub role_ids: Vec<RoleId>,
}

#[derive(Debug, Deserialize)]
pub struct ReassignRolesRequest {
    pub role_ids: Vec<RoleId>,
}

#[derive(Debug, Serialize)]
pub struct UserRolesResponse {
    pub user_id: UserId,
    pub roles: Vec<String>,
}

impl UserRolesResponse {
    pub fn new(user_id: UserId, roles: &RoleSet) -> Self {
        Self {
            user_id,
            roles: roles.names().map(str::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_params_cap_the_page_and_ignore_a_blank_prefix() {
        let query = ListQuery::from(ListParams {
            name: Some(String::new()),
            offset: 3,
            limit: Some(10_000),
        });
        assert_eq!(
            query,
            ListQuery {
                name_prefix: None,
                offset: 3,
                limit: Some(MAX_PAGE_SIZE),
            }
        );
        assert_eq!(ListQuery::from(ListParams::default()), ListQuery::all());
    }
}
