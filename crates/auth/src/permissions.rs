use serde::{Deserialize, Serialize};

use warden_core::{DomainError, DomainResult, PermissionId};

/// An addressable API operation: a path pattern plus an HTTP method.
///
/// `path` may contain `*` (any remainder) and `:param` (one segment) tokens.
/// `method` is stored upper-cased; `*` grants every method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub name: String,
    pub path: String,
    pub method: String,
    pub description: String,
}

/// Validated input for creating a permission row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPermission {
    pub name: String,
    pub path: String,
    pub method: String,
    pub description: String,
}

impl NewPermission {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        method: impl AsRef<str>,
        description: impl Into<String>,
    ) -> DomainResult<Self> {
        let name = name.into().trim().to_string();
        let path = path.into().trim().to_string();
        let method = normalize_method(method.as_ref())?;

        if name.is_empty() {
            return Err(DomainError::validation("permission name must not be empty"));
        }
        if path.is_empty() {
            return Err(DomainError::validation("permission path must not be empty"));
        }
        if path != "*" && !path.starts_with('/') {
            return Err(DomainError::validation(format!(
                "permission path '{path}' must start with '/'"
            )));
        }

        Ok(Self {
            name,
            path,
            method,
            description: description.into(),
        })
    }

    pub fn into_permission(self, id: PermissionId) -> Permission {
        Permission {
            id,
            name: self.name,
            path: self.path,
            method: self.method,
            description: self.description,
        }
    }
}

/// Normalize an HTTP method (or `*`) for storage and matching.
pub fn normalize_method(method: &str) -> DomainResult<String> {
    let method = method.trim();
    if method.is_empty() {
        return Err(DomainError::validation("permission method must not be empty"));
    }
    if method == "*" {
        return Ok(method.to_string());
    }
    if !method.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DomainError::validation(format!("invalid http method '{method}'")));
    }
    Ok(method.to_ascii_uppercase())
}
