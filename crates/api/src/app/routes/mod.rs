use axum::{Router, routing::post};

pub mod permissions;
pub mod roles;
pub mod session;
pub mod system;
pub mod users;

/// Admin surface. Every request here passes enforcement.
pub fn admin_router() -> Router {
    Router::new().nest(
        "/admin",
        Router::new()
            .merge(permissions::router())
            .merge(roles::router())
            .merge(users::router()),
    )
}

/// Authenticated but not enforced: a principal managing its own session.
pub fn session_router() -> Router {
    Router::new()
        .route("/auth/session", post(session::start_session))
        .route("/auth/logout", post(session::logout))
}
