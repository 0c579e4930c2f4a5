use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};

use warden_api::app::services::{AppServices, assemble, seed_admin};
use warden_auth::JwtClaims;
use warden_core::UserId;
use warden_infra::cache::InMemorySetCache;
use warden_infra::catalog::InMemoryRbacStore;
use warden_infra::config::WardenConfig;

const JWT_SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    admin_token: String,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = WardenConfig {
            invalidation_grace: Duration::from_millis(100),
            ..WardenConfig::default()
        };
        let services: Arc<AppServices> = Arc::new(
            assemble(
                Arc::new(InMemoryRbacStore::new()),
                Arc::new(InMemorySetCache::new()),
                &config,
            )
            .await
            .expect("failed to assemble services"),
        );
        let admin = seed_admin(&services.coordinator, "root")
            .await
            .expect("seed failed")
            .expect("catalog should be empty");

        // Same router as prod, bound to an ephemeral port.
        let app = warden_api::app::build_app(services, JWT_SECRET);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            admin_token: mint_jwt(admin.id, "root"),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, method: reqwest::Method, path: &str, token: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = self.client.request(method, self.url(path)).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req.send().await.unwrap();
        let status = res.status();
        let body = res.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn admin_post(&self, path: &str, body: Value) -> Value {
        let (status, body) = self
            .send(reqwest::Method::POST, path, &self.admin_token, Some(body))
            .await;
        assert_eq!(status, StatusCode::CREATED, "POST {path} failed: {body}");
        body
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(user: UserId, username: &str) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: user,
        username: username.to_string(),
        issued_at: now - ChronoDuration::seconds(5),
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

/// A `role-reader` role allowed to list roles, held by a fresh user.
async fn role_reader(srv: &TestServer, username: &str) -> (i64, i64, String) {
    let permission = srv
        .admin_post(
            "/admin/permissions",
            json!({ "name": format!("{username}.roles.list"), "path": "/admin/roles", "method": "get" }),
        )
        .await;
    let role = srv
        .admin_post(
            "/admin/roles",
            json!({ "name": format!("{username}-reader"), "permission_ids": [permission["id"]] }),
        )
        .await;
    let user = srv
        .admin_post("/admin/users", json!({ "name": username, "role_ids": [role["id"]] }))
        .await;

    let user_id = user["id"].as_i64().unwrap();
    (
        user_id,
        role["id"].as_i64().unwrap(),
        mint_jwt(UserId::new(user_id), username),
    )
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = srv.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;

    let res = srv.client.get(srv.url("/admin/roles")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let (status, body) = srv
        .send(reqwest::Method::GET, "/admin/roles", "not-a-jwt", None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");
}

#[tokio::test]
async fn granted_permission_allows_only_matching_requests() {
    let srv = TestServer::spawn().await;
    let (_, role_id, token) = role_reader(&srv, "ada").await;

    let (status, body) = srv.send(reqwest::Method::GET, "/admin/roles", &token, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["roles"].as_array().unwrap().iter().any(|r| r["name"] == "ada-reader"));

    let (status, body) = srv
        .send(reqwest::Method::DELETE, &format!("/admin/roles/{role_id}"), &token, None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let (status, _) = srv.send(reqwest::Method::GET, "/admin/permissions", &token, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_user_is_denied() {
    let srv = TestServer::spawn().await;
    let token = mint_jwt(UserId::new(9_999), "ghost");

    let (status, _) = srv.send(reqwest::Method::GET, "/admin/roles", &token, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn reassigning_to_no_roles_revokes_access_immediately() {
    let srv = TestServer::spawn().await;
    let (user_id, _, token) = role_reader(&srv, "bob").await;

    let (status, _) = srv.send(reqwest::Method::GET, "/admin/roles", &token, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = srv
        .send(
            reqwest::Method::PUT,
            &format!("/admin/users/{user_id}/roles"),
            &srv.admin_token,
            Some(json!({ "role_ids": [] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["roles"], json!([]));

    let (status, _) = srv.send(reqwest::Method::GET, "/admin/roles", &token, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Still denied once the delayed invalidation has run and roles are re-read.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (status, _) = srv.send(reqwest::Method::GET, "/admin/roles", &token, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn duplicate_role_and_unresolved_permissions_are_rejected() {
    let srv = TestServer::spawn().await;
    let permission = srv
        .admin_post(
            "/admin/permissions",
            json!({ "name": "docs.read", "path": "/docs/*", "method": "GET" }),
        )
        .await;
    srv.admin_post(
        "/admin/roles",
        json!({ "name": "dup", "permission_ids": [permission["id"]] }),
    )
    .await;

    let (status, body) = srv
        .send(
            reqwest::Method::POST,
            "/admin/roles",
            &srv.admin_token,
            Some(json!({ "name": "dup", "permission_ids": [permission["id"]] })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "already_exists");

    let (status, body) = srv
        .send(
            reqwest::Method::POST,
            "/admin/roles",
            &srv.admin_token,
            Some(json!({ "name": "other", "permission_ids": [permission["id"], 4040] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["permission_ids"], json!([4040]));
}

#[tokio::test]
async fn assigned_role_and_attached_permission_cannot_be_deleted() {
    let srv = TestServer::spawn().await;
    let (user_id, role_id, _) = role_reader(&srv, "carol").await;

    let (status, body) = srv
        .send(
            reqwest::Method::DELETE,
            &format!("/admin/roles/{role_id}"),
            &srv.admin_token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["users"], json!(["carol"]));

    let (status, body) = srv
        .send(reqwest::Method::GET, &format!("/admin/roles/{role_id}"), &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let permission_id = body["permissions"][0]["id"].as_i64().unwrap();

    let (status, body) = srv
        .send(
            reqwest::Method::DELETE,
            &format!("/admin/permissions/{permission_id}"),
            &srv.admin_token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["roles"], json!(["carol-reader"]));

    let (status, _) = srv
        .send(reqwest::Method::DELETE, &format!("/admin/users/{user_id}"), &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = srv
        .send(
            reqwest::Method::DELETE,
            &format!("/admin/roles/{role_id}"),
            &srv.admin_token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn session_start_and_logout() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv
        .send(reqwest::Method::POST, "/auth/session", &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["roles"], json!(["admin"]));

    let (status, _) = srv
        .send(reqwest::Method::POST, "/auth/logout", &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Roles are re-read from the catalog on the next request.
    let (status, _) = srv
        .send(reqwest::Method::GET, "/admin/roles", &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn permission_can_be_read_and_redescribed() {
    let srv = TestServer::spawn().await;
    let permission = srv
        .admin_post(
            "/admin/permissions",
            json!({ "name": "docs.read", "path": "/docs/*", "method": "GET", "description": "old" }),
        )
        .await;
    let id = permission["id"].as_i64().unwrap();

    let (status, body) = srv
        .send(
            reqwest::Method::PUT,
            &format!("/admin/permissions/{id}"),
            &srv.admin_token,
            Some(json!({ "description": "read any document" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "read any document");
    assert_eq!(body["path"], "/docs/*");

    let (status, body) = srv
        .send(reqwest::Method::GET, &format!("/admin/permissions/{id}"), &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "read any document");

    let (status, body) = srv
        .send(reqwest::Method::GET, "/admin/permissions?name=docs.", &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["permissions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["docs.read"]);

    let (status, _) = srv
        .send(reqwest::Method::GET, "/admin/permissions/4040", &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn users_can_be_listed_and_inspected() {
    let srv = TestServer::spawn().await;
    let (user_id, _, _) = role_reader(&srv, "dana").await;
    role_reader(&srv, "dave").await;

    let (status, body) = srv
        .send(reqwest::Method::GET, &format!("/admin/users/{user_id}"), &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "dana");
    assert_eq!(body["roles"], json!(["dana-reader"]));

    let (status, body) = srv
        .send(reqwest::Method::GET, "/admin/users?name=da", &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["users"].as_array().unwrap().len(), 2);

    let (status, body) = srv
        .send(reqwest::Method::GET, "/admin/users?offset=1&limit=1", &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let page = body["users"].as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["name"], "dana");

    let (status, body) = srv
        .send(reqwest::Method::GET, "/admin/roles?name=dave", &srv.admin_token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["roles"].as_array().unwrap().len(), 1);
    assert_eq!(body["roles"][0]["name"], "dave-reader");
}

#[tokio::test]
async fn role_in_the_user_subject_namespace_is_rejected() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv
        .send(
            reqwest::Method::POST,
            "/admin/roles",
            &srv.admin_token,
            Some(json!({ "name": "user:1" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}
