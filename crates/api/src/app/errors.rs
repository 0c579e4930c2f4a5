use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use warden_infra::CoordinatorError;
use warden_infra::catalog::StoreError;

pub fn coordinator_error_to_response(err: CoordinatorError) -> Response {
    match err {
        CoordinatorError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        CoordinatorError::UnresolvedPermissions(ids) => json_error_with(
            StatusCode::BAD_REQUEST,
            "unresolved_permissions",
            "some permission ids do not exist",
            json!({ "permission_ids": ids }),
        ),
        CoordinatorError::UnresolvedRoles(ids) => json_error_with(
            StatusCode::BAD_REQUEST,
            "unresolved_roles",
            "some role ids do not exist",
            json!({ "role_ids": ids }),
        ),
        CoordinatorError::AlreadyExists(what) => {
            json_error(StatusCode::CONFLICT, "already_exists", format!("{what} already exists"))
        }
        CoordinatorError::NotFound(what) => json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
        CoordinatorError::InUseByUsers(users) => json_error_with(
            StatusCode::CONFLICT,
            "role_in_use",
            "role is still assigned to users",
            json!({ "users": users }),
        ),
        CoordinatorError::PermissionInUse(roles) => json_error_with(
            StatusCode::CONFLICT,
            "permission_in_use",
            "permission is still attached to roles",
            json!({ "roles": roles }),
        ),
        CoordinatorError::Store(StoreError::Duplicate(msg)) => json_error(StatusCode::CONFLICT, "already_exists", msg),
        CoordinatorError::Store(StoreError::Constraint(msg)) => {
            json_error(StatusCode::CONFLICT, "constraint_violation", msg)
        }
        CoordinatorError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
        CoordinatorError::ReloadFailed(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "reload_failed",
            format!("change committed but policy reload failed: {e}"),
        ),
        CoordinatorError::Cache(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "cache_unavailable", e.to_string()),
        CoordinatorError::Timeout(op) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "timeout",
            format!("operation '{op}' timed out"),
        ),
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Like [`json_error`], with extra fields merged into the body.
pub fn json_error_with(status: StatusCode, code: &'static str, message: impl Into<String>, details: Value) -> Response {
    let mut body = json!({
        "error": code,
        "message": message.into(),
    });
    if let (Some(fields), Value::Object(extra)) = (body.as_object_mut(), details) {
        fields.extend(extra);
    }
    (status, axum::Json(body)).into_response()
}
