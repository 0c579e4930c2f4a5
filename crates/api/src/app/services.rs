//! Service wiring: catalog, role cache, policy engine, coordinator, authorizer.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use warden_auth::{NewPermission, PolicyEngine, PolicyModel, User};
use warden_infra::cache::{InMemorySetCache, RoleMembershipCache, SetCache};
use warden_infra::catalog::{CatalogPolicySource, InMemoryRbacStore, ListQuery, PostgresRbacStore, RbacStore};
use warden_infra::config::WardenConfig;
use warden_infra::{AuthorizationCoordinator, Authorizer, CoordinatorError, InvalidationScheduler};

#[cfg(feature = "redis")]
use warden_infra::cache::RedisSetCache;

pub const BOOTSTRAP_ROLE: &str = "admin";
pub const BOOTSTRAP_PERMISSION: &str = "admin.all";

/// Everything the handlers and middleware need.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub coordinator: AuthorizationCoordinator,
    pub authorizer: Authorizer,
}

/// Build services from configuration, choosing Postgres/Redis when URLs are set.
pub async fn build_services(config: &WardenConfig) -> anyhow::Result<AppServices> {
    let store = build_store(config).await?;
    let cache = build_cache(config).await?;
    let services = assemble(store, cache, config).await?;

    if let Some(username) = &config.bootstrap_admin {
        seed_admin(&services.coordinator, username)
            .await
            .context("bootstrap admin seed failed")?;
    }
    Ok(services)
}

/// Wire services over explicit backends. The engine is loaded before return.
pub async fn assemble(
    store: Arc<dyn RbacStore>,
    cache_backend: Arc<dyn SetCache>,
    config: &WardenConfig,
) -> anyhow::Result<AppServices> {
    let cache = RoleMembershipCache::new(
        cache_backend,
        config.cache_prefix.clone(),
        config.role_cache_ttl,
        config.store_timeout,
    );

    let engine = Arc::new(
        PolicyEngine::new(PolicyModel::default())
            .await
            .context("policy model rejected")?,
    );
    let rules = engine
        .load_policy(&CatalogPolicySource::new(store.clone()))
        .await
        .context("initial policy load failed")?;
    info!(rules, "policy engine loaded");

    // The worker runs until every scheduler handle is dropped.
    let (scheduler, _worker) = InvalidationScheduler::spawn(cache.clone(), config.invalidation_grace);

    let coordinator = AuthorizationCoordinator::new(
        store.clone(),
        engine.clone(),
        cache.clone(),
        scheduler,
        config.store_timeout,
    );
    let authorizer = Authorizer::new(store, engine, cache, config.store_timeout);

    Ok(AppServices {
        coordinator,
        authorizer,
    })
}

async fn build_store(config: &WardenConfig) -> anyhow::Result<Arc<dyn RbacStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresRbacStore::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            store.ensure_schema().await.context("failed to apply schema")?;
            info!("using Postgres role catalog");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory role catalog");
            Ok(Arc::new(InMemoryRbacStore::new()))
        }
    }
}

async fn build_cache(config: &WardenConfig) -> anyhow::Result<Arc<dyn SetCache>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        let cache = RedisSetCache::connect(url)
            .await
            .context("failed to connect to Redis")?;
        info!("using Redis role cache");
        return Ok(Arc::new(cache));
    }

    #[cfg(not(feature = "redis"))]
    if config.redis_url.is_some() {
        warn!("REDIS_URL set but the `redis` feature is disabled; using in-memory role cache");
    }

    Ok(Arc::new(InMemorySetCache::new()))
}

/// Seed an admin role covering `/admin/*` and one user holding it.
///
/// Only runs against an empty catalog; returns `None` otherwise.
pub async fn seed_admin(
    coordinator: &AuthorizationCoordinator,
    username: &str,
) -> Result<Option<User>, CoordinatorError> {
    let any_role = ListQuery {
        limit: Some(1),
        ..ListQuery::default()
    };
    if !coordinator.roles(&any_role).await?.is_empty() {
        info!("catalog already has roles; skipping admin seed");
        return Ok(None);
    }

    let permission = coordinator
        .create_permission(NewPermission::new(
            BOOTSTRAP_PERMISSION,
            "/admin/*",
            "*",
            "full access to the admin surface",
        )?)
        .await?;
    let role = coordinator
        .create_role(BOOTSTRAP_ROLE, "bootstrap administrator", &[permission.id])
        .await?
        .role;
    let user = coordinator.create_user(username, &[role.id]).await?;

    info!(user_id = %user.id, username = %user.name, "bootstrap admin created");
    Ok(Some(user))
}
