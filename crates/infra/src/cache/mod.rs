//! Per-user role membership cache.
//!
//! Entries live under `{prefix}:role:{user_id}` as a set of role names. A
//! user verified to hold no roles is stored as the single reserved member
//! [`EMPTY_ROLE_SENTINEL`](warden_auth::EMPTY_ROLE_SENTINEL); callers only ever
//! see [`RoleSet::Empty`] for it. Every write carries a TTL.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use warden_auth::RoleSet;
use warden_core::UserId;

pub use in_memory::InMemorySetCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisSetCache;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// `RoleSet::Names` with no names; use `RoleSet::Empty` instead.
    #[error("refusing to cache an empty role name set")]
    EmptyRoleSet,

    #[error("cache backend failure: {0}")]
    Backend(String),

    #[error("cache operation '{0}' timed out")]
    Timeout(&'static str),
}

/// What a key holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Role,
}

impl CacheCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Role => "role",
        }
    }
}

/// Composed cache key: `{prefix}:{category}:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub prefix: String,
    pub category: CacheCategory,
    pub id: i64,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.prefix, self.category.as_str(), self.id)
    }
}

/// Key-value backend holding string sets.
#[async_trait]
pub trait SetCache: Send + Sync {
    /// Members of the set; empty when the key is absent or expired.
    async fn members(&self, key: &CacheKey) -> Result<Vec<String>, CacheError>;

    /// Add `members` and (re)set the key's TTL in one atomic step.
    async fn add_members(
        &self,
        key: &CacheKey,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// Typed view of the cache for role membership.
#[derive(Clone)]
pub struct RoleMembershipCache {
    backend: Arc<dyn SetCache>,
    prefix: String,
    default_ttl: Duration,
    op_timeout: Duration,
}

impl fmt::Debug for RoleMembershipCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleMembershipCache")
            .field("prefix", &self.prefix)
            .field("default_ttl", &self.default_ttl)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RoleMembershipCache {
    pub fn new(
        backend: Arc<dyn SetCache>,
        prefix: impl Into<String>,
        default_ttl: Duration,
        op_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            default_ttl,
            op_timeout,
        }
    }

    pub fn key(&self, user: UserId) -> CacheKey {
        CacheKey {
            prefix: self.prefix.clone(),
            category: CacheCategory::Role,
            id: user.get(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// `Ok(None)` is a miss; a sentinel entry reads as `Some(RoleSet::Empty)`.
    pub async fn get(&self, user: UserId) -> Result<Option<RoleSet>, CacheError> {
        let key = self.key(user);
        let members = self.bounded("get", self.backend.members(&key)).await?;
        Ok(RoleSet::from_cache_members(members))
    }

    /// Store `roles` for `user`. `ttl: None` uses the default TTL.
    pub async fn set(
        &self,
        user: UserId,
        roles: &RoleSet,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        if matches!(roles, RoleSet::Names(names) if names.is_empty()) {
            return Err(CacheError::EmptyRoleSet);
        }
        let key = self.key(user);
        let members = roles.to_cache_members();
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.bounded("set", self.backend.add_members(&key, &members, ttl))
            .await
    }

    pub async fn invalidate(&self, user: UserId) -> Result<(), CacheError> {
        let key = self.key(user);
        self.bounded("invalidate", self.backend.delete(&key)).await
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout(op))?
    }
}
