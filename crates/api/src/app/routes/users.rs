use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
};

use warden_core::UserId;

use crate::app::dto::{CreateUserRequest, ListParams, ReassignRolesRequest, UserRolesResponse};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/:id", get(get_user).delete(delete_user))
        .route("/users/:id/roles", put(reassign_roles))
}

/// GET /admin/users?name=&offset=&limit=
pub async fn list_users(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<ListParams>,
) -> Response {
    match services.coordinator.users(&params.into()).await {
        Ok(users) => (StatusCode::OK, Json(serde_json::json!({ "users": users }))).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// GET /admin/users/:id - user with its role names
pub async fn get_user(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<UserId>) -> Response {
    match services.coordinator.user(id).await {
        Ok(details) => (StatusCode::OK, Json(details)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// POST /admin/users
pub async fn create_user(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CreateUserRequest>,
) -> Response {
    match services.coordinator.create_user(&body.name, &body.role_ids).await {
        Ok(user) => (StatusCode::CREATED, Json(user)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// PUT /admin/users/:id/roles - replace the user's whole role set
pub async fn reassign_roles(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<UserId>,
    Json(body): Json<ReassignRolesRequest>,
) -> Response {
    match services.coordinator.reassign_user_roles(id, &body.role_ids).await {
        Ok(roles) => (StatusCode::OK, Json(UserRolesResponse::new(id, &roles))).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// DELETE /admin/users/:id
pub async fn delete_user(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<UserId>) -> Response {
    match services.coordinator.delete_user(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}
