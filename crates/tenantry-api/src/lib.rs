//! tenantry-api — REST API for Tenantry.
//!
//! Identity comes from the authenticating proxy: `Remote-Email` (required
//! unless noted) and `Remote-Groups` (comma-separated, `admin` marks a
//! system administrator). Every body is the `{success, data?, error?}`
//! envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/projects` | Tenants of the caller |
//! | POST | `/api/projects` | Create a tenant (202, job ticket) |
//! | POST | `/api/projects/duplicate` | Duplicate a tenant (202, job ticket) |
//! | DELETE | `/api/projects/{name}` | Delete a tenant (`X-Delete-Password`) |
//! | GET | `/api/projects/status/{job_id}` | Job status, no identity |
//! | GET | `/api/projects/internal/enc-key/{name}` | Encrypted service key (`X-Shared-Token`), no identity |
//! | GET/POST | `/api/projects/{name}/members` | List / add members |
//! | DELETE | `/api/projects/{name}/members/{member_id}` | Remove a member |
//! | GET | `/api/projects/{name}/status` | Container fleet status |
//! | POST | `/api/projects/{name}/start` | Start containers |
//! | POST | `/api/projects/{name}/stop` | Stop containers |
//! | POST | `/api/projects/{name}/restart` | Restart containers |
//! | GET | `/api/projects/{name}/logs/{service}` | Log tail (`?lines=N`) |
//! | POST | `/api/projects/{name}/transfer` | Transfer ownership |
//! | POST | `/api/projects/admin/projects-info` | Tenants administered by a user |
//! | GET | `/api/admin/projects/{name}/all-users` | Members of a tenant |
//! | GET | `/healthz` | Liveness |

pub mod error;
pub mod handlers;
pub mod identity;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tenantry_orchestrator::TenantService;

pub use error::{ApiError, ApiResponse};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<TenantService>,
}

/// Build the complete API router.
pub fn build_router(service: Arc<TenantService>) -> Router {
    let state = ApiState { service };

    Router::new()
        .route(
            "/api/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route("/api/projects/duplicate", post(handlers::duplicate_project))
        .route("/api/projects/status/{job_id}", get(handlers::job_status))
        .route(
            "/api/projects/internal/enc-key/{name}",
            get(handlers::encrypted_service_key),
        )
        .route(
            "/api/projects/admin/projects-info",
            post(handlers::admin_projects_info),
        )
        .route("/api/projects/{name}", delete(handlers::delete_project))
        .route(
            "/api/projects/{name}/members",
            get(handlers::list_members).post(handlers::add_member),
        )
        .route(
            "/api/projects/{name}/members/{member_id}",
            delete(handlers::remove_member),
        )
        .route("/api/projects/{name}/status", get(handlers::fleet_status))
        .route("/api/projects/{name}/start", post(handlers::start_project))
        .route("/api/projects/{name}/stop", post(handlers::stop_project))
        .route("/api/projects/{name}/restart", post(handlers::restart_project))
        .route(
            "/api/projects/{name}/logs/{service}",
            get(handlers::container_logs),
        )
        .route("/api/projects/{name}/transfer", post(handlers::transfer_project))
        .route(
            "/api/admin/projects/{name}/all-users",
            get(handlers::admin_project_members),
        )
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tenantry_core::TenantSlug;
    use tenantry_orchestrator::testing::{Harness, TEST_DELETE_PASSWORD, TEST_SHARED_TOKEN};
    use tower::ServiceExt;

    use super::*;

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(user) = user {
            builder = builder.header("Remote-Email", user);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, user: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Remote-Email", user)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn setup() -> (Harness, Router) {
        let h = Harness::new().unwrap();
        let router = build_router(h.service.clone());
        (h, router)
    }

    #[tokio::test]
    async fn healthz() {
        let (_h, router) = setup();
        let (status, body) = send(&router, get("/healthz", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let (_h, router) = setup();
        let (status, body) = send(&router, get("/api/projects", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("Remote-Email"));

        let (status, _) = send(&router, get("/api/projects", Some("   "))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn job_status_needs_no_identity() {
        let (_h, router) = setup();
        let (status, body) = send(&router, get("/api/projects/status/abc", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["job_id"], "abc");
        assert_eq!(body["data"]["status"], "unknown");
    }

    #[tokio::test]
    async fn create_is_accepted_with_ticket() {
        let (h, router) = setup();
        h.script_tokens("anon", "svc");
        let (status, body) = send(
            &router,
            post_json("/api/projects", "alice", r#"{"name":"demo_proj"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "queued");
        assert!(body["data"]["job_id"].as_str().is_some());

        let (status, body) = send(
            &router,
            post_json("/api/projects", "alice", r#"{"name":"demo_proj"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn invalid_names_and_bodies_are_bad_requests() {
        let (_h, router) = setup();
        let (status, body) = send(
            &router,
            post_json("/api/projects", "alice", r#"{"name":"select"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = send(&router, post_json("/api/projects", "alice", "{not json")).await;
        assert!(status.is_client_error());
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn delete_requires_password_header() {
        let (h, router) = setup();
        h.store
            .create_tenant(&TenantSlug::parse("demo").unwrap(), "alice", "job-1")
            .unwrap();

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/projects/demo")
            .header("Remote-Email", "alice")
            .header("X-Delete-Password", "nope")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/projects/demo")
            .header("Remote-Email", "alice")
            .header("X-Delete-Password", TEST_DELETE_PASSWORD)
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["project"], "demo");
        assert_eq!(body["data"]["status"], "success");
    }

    #[tokio::test]
    async fn enc_key_uses_shared_token() {
        let (h, router) = setup();
        h.store
            .create_tenant(&TenantSlug::parse("demo").unwrap(), "alice", "job-1")
            .unwrap();

        let (status, _) = send(&router, get("/api/projects/internal/enc-key/demo", None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let req = Request::builder()
            .uri("/api/projects/internal/enc-key/demo")
            .header("X-Shared-Token", TEST_SHARED_TOKEN)
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["enc_service_key"].is_null());
    }

    #[tokio::test]
    async fn members_flow_and_bad_role() {
        let (h, router) = setup();
        h.store
            .create_tenant(&TenantSlug::parse("demo").unwrap(), "alice", "job-1")
            .unwrap();

        let (status, _) = send(
            &router,
            post_json("/api/projects/demo/members", "alice", r#"{"user_id":"bob","role":"owner"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &router,
            post_json("/api/projects/demo/members", "alice", r#"{"user_id":"bob"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ok"], true);

        let (status, body) = send(&router, get("/api/projects/demo/members", Some("bob"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let req = Request::builder()
            .method("DELETE")
            .uri("/api/projects/demo/members/alice")
            .header("Remote-Email", "bob")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn fleet_ps_failure_is_bad_gateway() {
        let (h, router) = setup();
        h.store
            .create_tenant(&TenantSlug::parse("demo").unwrap(), "alice", "job-1")
            .unwrap();
        h.runner.on_fail("ps -a", 1, "daemon down");

        let (status, body) = send(&router, get("/api/projects/demo/status", Some("alice"))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("daemon down"));
    }

    #[tokio::test]
    async fn admin_routes_require_admin_group() {
        let (h, router) = setup();
        h.store
            .create_tenant(&TenantSlug::parse("demo").unwrap(), "alice", "job-1")
            .unwrap();

        let (status, _) = send(
            &router,
            get("/api/admin/projects/demo/all-users", Some("alice")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let req = Request::builder()
            .uri("/api/admin/projects/demo/all-users")
            .header("Remote-Email", "root")
            .header("Remote-Groups", "admin")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["project_name"], "demo");
        assert_eq!(body["data"]["current_members"][0]["user_id"], "alice");
    }
}
