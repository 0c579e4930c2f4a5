use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::app::dto::UserRolesResponse;
use crate::app::{errors, services::AppServices};
use crate::context::PrincipalContext;

/// POST /auth/session - warm the caller's role cache entry after login
pub async fn start_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> Response {
    let user_id = principal.user_id();
    match services.coordinator.prime_user_roles(user_id).await {
        Ok(roles) => {
            tracing::info!(user_id = %user_id, username = principal.username(), "session started");
            (StatusCode::OK, Json(UserRolesResponse::new(user_id, &roles))).into_response()
        }
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// POST /auth/logout - drop the caller's role cache entry
pub async fn logout(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> Response {
    match services.coordinator.forget_user_session(principal.user_id()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}
