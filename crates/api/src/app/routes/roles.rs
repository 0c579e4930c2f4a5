use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use warden_core::RoleId;

use crate::app::dto::{CreateRoleRequest, ListParams, UpdateRoleRequest};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/:id", get(get_role).put(update_role).delete(delete_role))
}

/// GET /admin/roles?name=&offset=&limit=
pub async fn list_roles(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<ListParams>,
) -> Response {
    match services.coordinator.roles(&params.into()).await {
        Ok(roles) => (StatusCode::OK, Json(serde_json::json!({ "roles": roles }))).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// POST /admin/roles
pub async fn create_role(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CreateRoleRequest>,
) -> Response {
    match services
        .coordinator
        .create_role(&body.name, &body.description, &body.permission_ids)
        .await
    {
        Ok(details) => (StatusCode::CREATED, Json(details)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// GET /admin/roles/:id - role with its permissions
pub async fn get_role(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<RoleId>) -> Response {
    match services.coordinator.role(id).await {
        Ok(details) => (StatusCode::OK, Json(details)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// PUT /admin/roles/:id - replace description and permission set
pub async fn update_role(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<RoleId>,
    Json(body): Json<UpdateRoleRequest>,
) -> Response {
    match services
        .coordinator
        .update_role(id, &body.description, &body.permission_ids)
        .await
    {
        Ok(details) => (StatusCode::OK, Json(details)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// DELETE /admin/roles/:id - refused while any user holds the role
pub async fn delete_role(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<RoleId>) -> Response {
    match services.coordinator.delete_role(id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}
