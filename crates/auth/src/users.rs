use serde::{Deserialize, Serialize};

use warden_core::{DomainError, DomainResult, UserId};

/// An account that roles are assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

impl User {
    /// Subject string used for this user in grouping rules.
    pub fn subject(&self) -> String {
        user_subject(self.id)
    }
}

/// Prefix that keeps user subjects apart from role names in grouping rules.
pub const USER_SUBJECT_PREFIX: &str = "user:";

/// Grouping rules identify users as `user:{id}`.
pub fn user_subject(id: UserId) -> String {
    format!("{USER_SUBJECT_PREFIX}{}", id.get())
}

pub fn validate_user_name(name: &str) -> DomainResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DomainError::validation("user name must not be empty"));
    }
    Ok(name.to_string())
}
