use serde::{Deserialize, Serialize};

use warden_core::UserId;

use crate::JwtClaims;

/// Identity of an authenticated principal, as seen by enforcement.
///
/// Enforcement only needs the numeric user id; the name rides along for logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub username: String,
}

impl Principal {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

impl From<&JwtClaims> for Principal {
    fn from(claims: &JwtClaims) -> Self {
        Self::new(claims.sub, claims.username.clone())
    }
}
