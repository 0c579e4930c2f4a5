//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: catalog, cache, engine, coordinator and authorizer wiring
//! - `routes/`: HTTP handlers, one file per resource
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>, jwt_secret: &str) -> Router {
    let jwt = Arc::new(warden_auth::Hs256JwtValidator::new(jwt_secret.as_bytes().to_vec()));
    let auth_state = middleware::AuthState { jwt };

    let enforced = routes::admin_router().layer(axum::middleware::from_fn_with_state(
        services.clone(),
        middleware::authz_middleware,
    ));

    // Authentication runs first, then the services extension is attached.
    let authenticated = Router::new()
        .merge(enforced)
        .merge(routes::session_router())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    auth_state,
                    middleware::auth_middleware,
                ))
                .layer(Extension(services)),
        );

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(authenticated)
}
