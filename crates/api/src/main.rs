use std::sync::Arc;

use anyhow::Context;

use warden_infra::config::WardenConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    warden_observability::init();

    let config = WardenConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(warden_api::app::services::build_services(&config).await?);
    let app = warden_api::app::build_app(services, &config.jwt_secret);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}
