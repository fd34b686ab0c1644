//! End-to-end API flows over the in-memory store and scripted tools.
//!
//! Drives the full router: identity headers, job dispatch, the ledger,
//! credential encryption and the delete sequence.

use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tenantry_api::build_router;
use tenantry_orchestrator::testing::{Harness, TEST_DELETE_PASSWORD, ps_line};
use tower::ServiceExt;

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn request(method: &str, uri: &str, user: &str, body: Option<&str>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Remote-Email", user);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Poll the job endpoint until the job leaves `queued`/`running`.
async fn wait_for_job(router: &Router, job_id: &str) -> String {
    for _ in 0..500 {
        let req = Request::builder()
            .uri(format!("/api/projects/status/{job_id}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::OK);
        let state = body["data"]["status"].as_str().unwrap().to_string();
        if state != "queued" && state != "running" {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}

async fn create(router: &Router, user: &str, name: &str) -> String {
    let (status, body) = send(
        router,
        request(
            "POST",
            "/api/projects",
            user,
            Some(&format!(r#"{{"name":"{name}"}}"#)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    body["data"]["job_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_project_lists_decrypted_anon_key() {
    let h = Harness::new().unwrap();
    h.script_tokens("eyJhbm9uIjp0cnVlfQ", "eyJzZXJ2aWNlIjp0cnVlfQ");
    let router = build_router(h.service.clone());

    let job_id = create(&router, "alice", "demo_proj").await;
    assert_eq!(wait_for_job(&router, &job_id).await, "done");

    let (status, body) = send(&router, request("GET", "/api/projects", "alice", None)).await;
    assert_eq!(status, StatusCode::OK);
    let projects = body["data"].as_array().unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["name"], "demo_proj");
    assert_eq!(projects[0]["anon_token"], "eyJhbm9uIjp0cnVlfQ");

    // Someone else sees nothing.
    let (_, body) = send(&router, request("GET", "/api/projects", "bob", None)).await;
    assert!(body["data"].as_array().unwrap().is_empty());

    // The stored service key is encrypted, not the raw token.
    let stored = h.store.get_tenant("demo_proj").unwrap().unwrap();
    assert_ne!(stored.service_role.as_deref(), Some("eyJzZXJ2aWNlIjp0cnVlfQ"));
}

#[tokio::test]
async fn failed_provisioning_is_reported_by_job_status() {
    let h = Harness::new().unwrap();
    h.runner.on_fail("generate_project.sh", 1, "out of ports");
    let router = build_router(h.service.clone());

    let job_id = create(&router, "alice", "demo_proj").await;
    assert_eq!(wait_for_job(&router, &job_id).await, "failed");

    // The tenant exists but has no credentials, so it is not listed.
    let (_, body) = send(&router, request("GET", "/api/projects", "alice", None)).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_flow() {
    let h = Harness::new().unwrap();
    h.script_tokens("anon", "svc");
    let router = build_router(h.service.clone());

    let job_id = create(&router, "alice", "source_proj").await;
    assert_eq!(wait_for_job(&router, &job_id).await, "done");

    let body = r#"{"original_name":"source_proj","new_name":"copy_proj","copy_data":true}"#;
    let (status, _) = send(
        &router,
        request("POST", "/api/projects/duplicate", "bob", Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, resp) = send(
        &router,
        request("POST", "/api/projects/duplicate", "alice", Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = resp["data"]["job_id"].as_str().unwrap().to_string();
    assert_eq!(wait_for_job(&router, &job_id).await, "done");
    assert_eq!(
        h.runner
            .count("duplicate_project.sh source_proj copy_proj with-data"),
        1
    );

    let (_, body) = send(&router, request("GET", "/api/projects", "alice", None)).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn delete_with_failing_cleanup_script_is_partial_success() {
    let h = Harness::new().unwrap();
    h.script_tokens("anon", "svc");
    let router = build_router(h.service.clone());

    let job_id = create(&router, "alice", "demo_proj").await;
    assert_eq!(wait_for_job(&router, &job_id).await, "done");

    h.runner.on_ok(
        "ps -a",
        &[
            ps_line("supabase-db-demo_proj", "running"),
            ps_line("supabase-auth-demo_proj", "running"),
        ]
        .join("\n"),
    );
    h.runner
        .on_fail("delete_project.sh", 1, "rm: cannot remove 'projects/demo_proj'");

    let req = Request::builder()
        .method("DELETE")
        .uri("/api/projects/demo_proj")
        .header("Remote-Email", "alice")
        .header("X-Delete-Password", TEST_DELETE_PASSWORD)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, req).await;
    assert_eq!(status, StatusCode::OK);
    let report = &body["data"];
    assert_eq!(report["project"], "demo_proj");
    assert_eq!(report["status"], "partial_success");
    let errors = report["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(
        errors[0]
            .as_str()
            .unwrap()
            .starts_with("directory cleanup failed")
    );

    // Bookkeeping is gone and the job is no longer known.
    let (_, body) = send(&router, request("GET", "/api/projects", "alice", None)).await;
    assert!(body["data"].as_array().unwrap().is_empty());
    let req = Request::builder()
        .uri(format!("/api/projects/status/{job_id}"))
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&router, req).await;
    assert_eq!(body["data"]["status"], "unknown");

    // Both shared containers were paused and unpaused.
    assert_eq!(h.runner.count("unpause realtime-dev.supabase-realtime"), 1);
    assert_eq!(h.runner.count("unpause supabase-pooler"), 1);
}

#[tokio::test]
async fn fleet_lifecycle_over_http() {
    let h = Harness::new().unwrap();
    h.script_tokens("anon", "svc");
    let router = build_router(h.service.clone());

    let job_id = create(&router, "alice", "demo_proj").await;
    assert_eq!(wait_for_job(&router, &job_id).await, "done");

    h.runner.on_ok(
        "ps -a",
        &[
            ps_line("supabase-nginx-demo_proj", "exited"),
            ps_line("supabase-meta-demo_proj", "exited"),
        ]
        .join("\n"),
    );
    h.runner.on_fail("start supabase-nginx-demo_proj", 1, "port in use");

    let (status, body) = send(
        &router,
        request("POST", "/api/projects/demo_proj/start", "alice", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let report = &body["data"];
    assert_eq!(report["success"], false);
    assert_eq!(report["started_containers"][0], "supabase-meta-demo_proj");
    assert_eq!(
        report["errors"][0],
        "Error starting supabase-nginx-demo_proj: port in use"
    );
    assert!(
        h.runner.position("start supabase-meta-demo_proj")
            < h.runner.position("start supabase-nginx-demo_proj")
    );

    let (status, body) = send(
        &router,
        request("GET", "/api/projects/demo_proj/status", "alice", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "stopped");
    assert_eq!(body["data"]["total"], 2);
}

#[tokio::test]
async fn transfer_ownership_over_http() {
    let h = Harness::new().unwrap();
    h.script_tokens("anon", "svc");
    let router = build_router(h.service.clone());

    let job_id = create(&router, "alice", "demo_proj").await;
    assert_eq!(wait_for_job(&router, &job_id).await, "done");

    let req = Request::builder()
        .method("POST")
        .uri("/api/projects/demo_proj/transfer")
        .header("Remote-Email", "root")
        .header("Remote-Groups", "admin")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"new_owner_id":" Bob "}"#))
        .unwrap();
    let (status, body) = send(&router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "transferred");
    assert_eq!(body["data"]["new_owner_id"], "bob");

    // bob is now an admin and can add members; alice was demoted.
    let (status, _) = send(
        &router,
        request(
            "POST",
            "/api/projects/demo_proj/members",
            "bob",
            Some(r#"{"user_id":"carol"}"#),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &router,
        request(
            "POST",
            "/api/projects/demo_proj/members",
            "alice",
            Some(r#"{"user_id":"dave"}"#),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
