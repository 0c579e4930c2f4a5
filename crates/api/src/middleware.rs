use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use warden_auth::{JwtValidator, Principal, RoleDecision};

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::context::PrincipalContext;

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
}

/// Bearer authentication. Inserts [`PrincipalContext`] on success.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = extract_bearer(req.headers())
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "missing bearer token"))?;

    let claims = state.jwt.validate(token, Utc::now()).map_err(|e| {
        debug!(error = %e, "bearer token rejected");
        json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "invalid bearer token")
    })?;

    req.extensions_mut()
        .insert(PrincipalContext::new(Principal::from(&claims)));

    Ok(next.run(req).await)
}

/// Enforcement: resolve the principal's roles and check the request's path and
/// method. Anything other than an explicit allow is a 403, including a request
/// that reaches enforcement with no principal attached.
pub async fn authz_middleware(
    State(services): State<Arc<AppServices>>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(principal) = req.extensions().get::<PrincipalContext>().cloned() else {
        warn!("request reached enforcement without a principal; denying");
        return json_error(StatusCode::FORBIDDEN, "forbidden", "no authenticated principal");
    };
    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();
    let user_id = principal.user_id();

    match services.authorizer.decide(user_id, &path, &method).await {
        Ok(RoleDecision::Allow { role }) => {
            debug!(user_id = %user_id, %path, %method, %role, "request allowed");
            next.run(req).await
        }
        Ok(RoleDecision::Deny(reason)) => {
            info!(user_id = %user_id, %path, %method, ?reason, "request denied");
            json_error(StatusCode::FORBIDDEN, "forbidden", format!("{method} {path} is not permitted"))
        }
        Err(err) => {
            warn!(user_id = %user_id, %path, %method, error = %err, "role resolution failed; denying");
            json_error(StatusCode::FORBIDDEN, "forbidden", "authorization could not be completed")
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[tokio::test]
    async fn enforcement_without_a_principal_is_forbidden() {
        use axum::{Router, routing::get};
        use warden_infra::cache::InMemorySetCache;
        use warden_infra::catalog::InMemoryRbacStore;
        use warden_infra::config::WardenConfig;

        let services = Arc::new(
            crate::app::services::assemble(
                Arc::new(InMemoryRbacStore::new()),
                Arc::new(InMemorySetCache::new()),
                &WardenConfig::default(),
            )
            .await
            .unwrap(),
        );
        let app = Router::new()
            .route("/admin/roles", get(|| async { "reached" }))
            .layer(axum::middleware::from_fn_with_state(services, authz_middleware));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let res = reqwest::get(format!("http://{addr}/admin/roles")).await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::FORBIDDEN);
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["error"], "forbidden");

        server.abort();
    }

    #[test]
    fn bearer_token_is_extracted() {
        assert_eq!(extract_bearer(&headers("Bearer abc.def")), Some("abc.def"));
        assert_eq!(extract_bearer(&headers("Bearer   ")), None);
        assert_eq!(extract_bearer(&headers("Basic abc")), None);
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }
}
