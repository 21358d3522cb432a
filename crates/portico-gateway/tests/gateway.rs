//! End-to-end dispatch through the gateway.

mod common;

use common::{DOWN_SERVICE, Harness};
use portico_core::{Department, Role};
use serde_json::json;

#[tokio::test]
async fn test_health() {
    let h = Harness::start().await;
    let (status, body) = h.get("/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_backend_health_reports_degraded() {
    let h = Harness::start().await;
    let (status, body) = h.get("/health/backends", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "degraded");

    let backends = body["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 8);
    let down = backends.iter().find(|b| b["name"] == DOWN_SERVICE).unwrap();
    assert_eq!(down["healthy"], false);
    let auth = backends.iter().find(|b| b["name"] == "auth").unwrap();
    assert_eq!(auth["healthy"], true);
    assert!(auth["latencyMs"].is_u64());
}

#[tokio::test]
async fn test_register_then_login_through_gateway() {
    let h = Harness::start().await;
    let (status, registered) = h
        .post(
            "/auth/register",
            json!({
                "username": "alice",
                "email": "alice@example.com",
                "password": "secret1",
                "firstName": "Alice",
                "lastName": "Liddell",
            }),
        )
        .await;
    assert_eq!(status, 201, "{registered}");
    assert!(registered["accessToken"].is_string());
    assert!(registered["refreshToken"].is_string());
    assert!(registered["user"].get("passwordHash").is_none());

    let (access, refresh) = h.login("alice", "secret1").await;
    assert_ne!(registered["accessToken"], access.as_str());
    assert_ne!(registered["refreshToken"], refresh.as_str());
}

#[tokio::test]
async fn test_missing_token_never_reaches_backend() {
    let h = Harness::start().await;
    let (status, body) = h.get("/tickets/1", None).await;
    assert_eq!(status, 401);
    assert_eq!(
        body["error"],
        "Unauthorized - Missing or invalid token format"
    );
    assert_eq!(h.calls("tickets"), 0);

    let (status, body) = h.get("/tickets/1", Some("garbage")).await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "Unauthorized - Invalid or expired token");
    assert_eq!(h.calls("tickets"), 0);
}

#[tokio::test]
async fn test_authenticated_request_is_rewritten_and_forwarded() {
    let h = Harness::start().await;
    h.seed("bob", Role::Employee, Department::None);
    let (access, _) = h.login("bob", "secret1").await;

    let (status, body) = h.get("/tickets/7?state=open", Some(&access)).await;
    assert_eq!(status, 200);
    assert_eq!(body["service"], "tickets");
    assert_eq!(body["path"], "/api/tickets/7");
    assert_eq!(body["query"], "state=open");
    assert_eq!(h.calls("tickets"), 1);
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let h = Harness::start().await;
    h.seed("bob", Role::Employee, Department::None);
    let (access, _) = h.login("bob", "secret1").await;

    let resp = h
        .client
        .post(h.url("/requests"))
        .bearer_auth(&access)
        .json(&json!({ "item": "paper" }))
        .send()
        .await
        .unwrap();
    let (status, body) = common::read(resp).await;
    assert_eq!(status, 200);
    assert_eq!(body["method"], "POST");
    assert_eq!(body["path"], "/api/requests");
}

#[tokio::test]
async fn test_department_prefix_routes_to_its_backend() {
    let h = Harness::start().await;
    h.seed("lab", Role::Employee, Department::Laboratorio);
    let (access, _) = h.login("lab", "secret1").await;

    let (status, body) = h.get("/api/laboratorio/x", Some(&access)).await;
    assert_eq!(status, 200);
    assert_eq!(body["service"], "laboratorio");
    assert_eq!(body["path"], "/api/x");
    assert_eq!(h.calls("informatica"), 0);
}

#[tokio::test]
async fn test_department_mismatch_is_forbidden() {
    let h = Harness::start().await;
    h.seed("lab", Role::Employee, Department::Laboratorio);
    let (access, _) = h.login("lab", "secret1").await;

    let (status, body) = h.get("/api/informatica/x", Some(&access)).await;
    assert_eq!(status, 403);
    assert_eq!(body["error"], "Forbidden - Insufficient permissions");
    assert_eq!(h.calls("informatica"), 0);
}

#[tokio::test]
async fn test_self_registration_cannot_pick_a_department() {
    let h = Harness::start().await;
    let (status, body) = h
        .post(
            "/auth/register",
            json!({
                "username": "mallory",
                "email": "mallory@example.com",
                "password": "secret1",
                "firstName": "Mallory",
                "lastName": "Smith",
                "department": "laboratorio",
            }),
        )
        .await;
    assert_eq!(status, 201, "{body}");
    assert_eq!(body["user"]["department"], "none");
    let access = body["accessToken"].as_str().unwrap();

    let (status, _) = h.get("/api/laboratorio/secret", Some(access)).await;
    assert_eq!(status, 403);
    assert_eq!(h.calls("laboratorio"), 0);
}

#[tokio::test]
async fn test_director_passes_every_check() {
    let h = Harness::start().await;
    h.seed("boss", Role::Director, Department::None);
    let (access, _) = h.login("boss", "secret1").await;

    let (status, _) = h.get("/api/informatica/x", Some(&access)).await;
    assert_eq!(status, 200);
    let (status, _) = h.get("/reports/monthly", Some(&access)).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_reports_require_permission() {
    let h = Harness::start().await;
    h.seed("emp", Role::Employee, Department::None);
    h.seed("admin", Role::Administrator, Department::None);

    let (access, _) = h.login("emp", "secret1").await;
    let (status, _) = h.get("/reports", Some(&access)).await;
    assert_eq!(status, 403);
    assert_eq!(h.calls("reports"), 0);

    let (access, _) = h.login("admin", "secret1").await;
    let (status, body) = h.get("/reports", Some(&access)).await;
    assert_eq!(status, 200);
    assert_eq!(body["path"], "/api/reports");
}

#[tokio::test]
async fn test_public_route_needs_no_token() {
    let h = Harness::start().await;
    let (status, body) = h.get("/calendar/events", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["path"], "/events");
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let h = Harness::start().await;
    let (status, body) = h.get("/nowhere", None).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_backend_down_is_bad_gateway() {
    let h = Harness::start().await;
    h.seed("bob", Role::Employee, Department::None);
    let (access, _) = h.login("bob", "secret1").await;

    let (status, body) = h.get("/inventory/items", Some(&access)).await;
    assert_eq!(status, 502);
    assert_eq!(body["error"], "Bad Gateway");
    assert_eq!(body["code"], "UPSTREAM_UNAVAILABLE");
    assert_eq!(body["message"], "inventory service is unavailable");
    let text = body.to_string().to_lowercase();
    assert!(!text.contains("refused"));
    assert!(!text.contains("error sending"));
}
