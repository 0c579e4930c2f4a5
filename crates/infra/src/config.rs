//! Process configuration, read from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_CACHE_PREFIX: &str = "warden";
pub const DEFAULT_ROLE_CACHE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_INVALIDATION_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var} ('{value}'): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings for the authorization services and the HTTP binary.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    /// Postgres URL; `None` selects the in-memory catalog.
    pub database_url: Option<String>,
    /// Redis URL; `None` selects the in-memory role cache.
    pub redis_url: Option<String>,
    pub cache_prefix: String,
    pub role_cache_ttl: Duration,
    pub invalidation_grace: Duration,
    pub store_timeout: Duration,
    pub jwt_secret: String,
    pub bind_addr: SocketAddr,
    /// Seed an `admin` role and this user into an empty catalog at startup.
    pub bootstrap_admin: Option<String>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            role_cache_ttl: DEFAULT_ROLE_CACHE_TTL,
            invalidation_grace: DEFAULT_INVALIDATION_GRACE,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            bootstrap_admin: None,
        }
    }
}

impl WardenConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let jwt_secret = match get("JWT_SECRET") {
            Some(secret) => secret,
            None => {
                tracing::warn!("JWT_SECRET not set; using insecure dev default");
                defaults.jwt_secret
            }
        };

        let role_cache_ttl = match get("WARDEN_ROLE_CACHE_TTL_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("WARDEN_ROLE_CACHE_TTL_SECS", &raw)?),
            None => defaults.role_cache_ttl,
        };

        let invalidation_grace = match get("WARDEN_INVALIDATION_GRACE_MS") {
            Some(raw) => Duration::from_millis(parse_number("WARDEN_INVALIDATION_GRACE_MS", &raw)?),
            None => defaults.invalidation_grace,
        };

        let store_timeout = match get("WARDEN_STORE_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse_positive("WARDEN_STORE_TIMEOUT_MS", &raw)?),
            None => defaults.store_timeout,
        };

        let bind_addr = match get("WARDEN_BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                var: "WARDEN_BIND_ADDR",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.bind_addr,
        };

        if invalidation_grace >= role_cache_ttl {
            tracing::warn!(
                grace_ms = duration_millis(invalidation_grace),
                ttl_secs = role_cache_ttl.as_secs(),
                "invalidation grace delay is not shorter than the role cache TTL"
            );
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            cache_prefix: get("WARDEN_CACHE_PREFIX").unwrap_or(defaults.cache_prefix),
            role_cache_ttl,
            invalidation_grace,
            store_timeout,
            jwt_secret,
            bind_addr,
            bootstrap_admin: get("WARDEN_BOOTSTRAP_ADMIN"),
        })
    }
}

/// Milliseconds for log fields, saturating at `u64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_number(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match parse_number(var, raw)? {
        0 => Err(ConfigError::Invalid {
            var,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        n => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<WardenConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WardenConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.cache_prefix, "warden");
        assert_eq!(cfg.role_cache_ttl, Duration::from_secs(30));
        assert_eq!(cfg.invalidation_grace, Duration::from_secs(5));
        assert_eq!(cfg.store_timeout, Duration::from_secs(2));
        assert_eq!(cfg.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(cfg.bootstrap_admin, None);
    }

    #[test]
    fn values_are_read_and_blank_means_unset() {
        let cfg = config_from(&[
            ("DATABASE_URL", "postgres://localhost/warden"),
            ("REDIS_URL", "  "),
            ("WARDEN_CACHE_PREFIX", "api"),
            ("WARDEN_ROLE_CACHE_TTL_SECS", "60"),
            ("WARDEN_INVALIDATION_GRACE_MS", "250"),
            ("WARDEN_BIND_ADDR", "127.0.0.1:9000"),
            ("WARDEN_BOOTSTRAP_ADMIN", "root"),
        ])
        .unwrap();

        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/warden"));
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.cache_prefix, "api");
        assert_eq!(cfg.role_cache_ttl, Duration::from_secs(60));
        assert_eq!(cfg.invalidation_grace, Duration::from_millis(250));
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(cfg.bootstrap_admin.as_deref(), Some("root"));
    }

    #[test]
    fn zero_ttl_and_garbage_are_rejected() {
        let err = config_from(&[("WARDEN_ROLE_CACHE_TTL_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WARDEN_ROLE_CACHE_TTL_SECS", .. }));

        assert!(config_from(&[("WARDEN_STORE_TIMEOUT_MS", "soon")]).is_err());
        assert!(config_from(&[("WARDEN_BIND_ADDR", "localhost")]).is_err());
    }

    #[test]
    fn huge_durations_saturate_in_log_fields() {
        assert_eq!(duration_millis(Duration::from_millis(250)), 250);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);

        let cfg = config_from(&[("WARDEN_INVALIDATION_GRACE_MS", &u64::MAX.to_string())]).unwrap();
        assert_eq!(cfg.invalidation_grace, Duration::from_millis(u64::MAX));
    }
}
