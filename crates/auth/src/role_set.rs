//! The resolved role membership of a user.
//!
//! The cache stores "this user has zero roles" as a reserved member string.
//! That string is translated into [`RoleSet::Empty`] at the deserialization
//! boundary and never appears as a role name past it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Reserved cache member meaning "verified zero roles".
pub const EMPTY_ROLE_SENTINEL: &str = "__empty__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleSet {
    /// The user was checked and holds no roles.
    Empty,
    /// The user holds these roles. Never constructed empty by [`RoleSet::from_names`].
    Names(BTreeSet<String>),
}

impl RoleSet {
    /// Build a role set from role names, collapsing to [`RoleSet::Empty`].
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names
            .into_iter()
            .map(Into::into)
            .filter(|n| n != EMPTY_ROLE_SENTINEL)
            .collect();

        if names.is_empty() {
            Self::Empty
        } else {
            Self::Names(names)
        }
    }

    /// Decode raw cache members. An empty member list is a miss (`None`).
    pub fn from_cache_members(members: Vec<String>) -> Option<Self> {
        if members.is_empty() {
            return None;
        }
        Some(Self::from_names(members))
    }

    /// Encode for the cache: the sentinel for `Empty`, the names otherwise.
    pub fn to_cache_members(&self) -> Vec<String> {
        match self {
            Self::Empty => vec![EMPTY_ROLE_SENTINEL.to_string()],
            Self::Names(names) => names.iter().cloned().collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        let names = match self {
            Self::Empty => None,
            Self::Names(names) => Some(names),
        };
        names.into_iter().flatten().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Names(names) => names.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, role: &str) -> bool {
        self.names().any(|n| n == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_names_collapse_to_empty() {
        assert_eq!(RoleSet::from_names(Vec::<String>::new()), RoleSet::Empty);
    }

    #[test]
    fn sentinel_only_members_decode_to_empty() {
        let decoded = RoleSet::from_cache_members(vec![EMPTY_ROLE_SENTINEL.to_string()]);
        assert_eq!(decoded, Some(RoleSet::Empty));
        assert_eq!(decoded.unwrap().names().count(), 0);
    }

    #[test]
    fn missing_members_are_a_miss() {
        assert_eq!(RoleSet::from_cache_members(vec![]), None);
    }

    #[test]
    fn sentinel_never_leaks_next_to_real_names() {
        let decoded = RoleSet::from_cache_members(vec![
            EMPTY_ROLE_SENTINEL.to_string(),
            "admin".to_string(),
        ])
        .unwrap();
        assert_eq!(decoded.names().collect::<Vec<_>>(), vec!["admin"]);
    }

    #[test]
    fn encodes_empty_as_sentinel() {
        assert_eq!(RoleSet::Empty.to_cache_members(), vec![EMPTY_ROLE_SENTINEL]);
        let names = RoleSet::from_names(["b", "a"]);
        assert_eq!(names.to_cache_members(), vec!["a", "b"]);
    }
}
