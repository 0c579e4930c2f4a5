use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use warden_auth::NewPermission;
use warden_core::PermissionId;
use warden_infra::CoordinatorError;

use crate::app::dto::{CreatePermissionRequest, ListParams, UpdatePermissionRequest};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/permissions", get(list_permissions).post(create_permission))
        .route(
            "/permissions/:id",
            get(get_permission).put(update_permission).delete(delete_permission),
        )
}

/// GET /admin/permissions?name=&offset=&limit=
pub async fn list_permissions(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<ListParams>,
) -> Response {
    match services.coordinator.permissions(&params.into()).await {
        Ok(permissions) => (
            StatusCode::OK,
            Json(serde_json::json!({ "permissions": permissions })),
        )
            .into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// POST /admin/permissions
pub async fn create_permission(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CreatePermissionRequest>,
) -> Response {
    let new = match NewPermission::new(body.name, body.path, body.method, body.description) {
        Ok(new) => new,
        Err(e) => return errors::coordinator_error_to_response(CoordinatorError::from(e)),
    };

    match services.coordinator.create_permission(new).await {
        Ok(permission) => (StatusCode::CREATED, Json(permission)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// GET /admin/permissions/:id
pub async fn get_permission(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<PermissionId>,
) -> Response {
    match services.coordinator.permission(id).await {
        Ok(permission) => (StatusCode::OK, Json(permission)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// PUT /admin/permissions/:id - description only
pub async fn update_permission(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<PermissionId>,
    Json(body): Json<UpdatePermissionRequest>,
) -> Response {
    match services.coordinator.update_permission(id, &body.description).await {
        Ok(permission) => (StatusCode::OK, Json(permission)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

/// DELETE /admin/permissions/:id - refused while any role holds the permission
pub async fn delete_permission(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<PermissionId>,
) -> Response {
    match services.coordinator.delete_permission(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}
