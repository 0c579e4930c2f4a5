use serde::{Deserialize, Serialize};

use warden_core::{DomainError, DomainResult, RoleId};

use crate::role_set::EMPTY_ROLE_SENTINEL;
use crate::users::USER_SUBJECT_PREFIX;

/// A named bundle of permissions, assignable to users.
///
/// The role name doubles as the policy subject (`p` rule `v0`), so it is
/// immutable after creation; only the description and the permission set
/// change on update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: String,
}

impl Role {
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Check a role name before it is written anywhere.
///
/// The cache sentinel is reserved: a role with that name would be
/// indistinguishable from "verified zero roles". Names in the user subject
/// namespace are reserved too, since roles and users share the grouping
/// subject space.
pub fn validate_role_name(name: &str) -> DomainResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DomainError::validation("role name must not be empty"));
    }
    if name == EMPTY_ROLE_SENTINEL {
        return Err(DomainError::validation(format!(
            "role name '{EMPTY_ROLE_SENTINEL}' is reserved"
        )));
    }
    if name.starts_with(USER_SUBJECT_PREFIX) {
        return Err(DomainError::validation(format!(
            "role name '{name}' uses the reserved '{USER_SUBJECT_PREFIX}' prefix"
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(DomainError::validation(format!(
            "role name '{name}' must not contain whitespace"
        )));
    }
    Ok(name.to_string())
}
