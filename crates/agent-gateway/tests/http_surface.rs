//! End-to-end HTTP surface tests, driven straight against the router
//! with `tower::ServiceExt::oneshot` — no listening socket needed.
//! Covers the S1/S2/S3/S5 scenarios from the spec's testable-properties
//! list; S4 (session-level serialization) and S6 (disconnect survives
//! the turn) are covered at the `SessionManager` level in
//! `session_manager.rs`'s own tests, where the fake subprocess fixture
//! already lives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ag_domain::config::Config;
use ag_gateway::session_manager::SessionManager;
use ag_gateway::state::AppState;
use ag_store::MemoryStore;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

/// A stand-in agent subprocess: echoes one `text_delta` and `done` per
/// prompt line, matching the fixture used in
/// `session_manager.rs`/`ag_client::process`'s own tests.
fn echo_script() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("fake_agent.sh");
    std::fs::write(
        &script_path,
        "#!/bin/sh\nwhile IFS= read -r line; do\n  echo '{\"type\":\"text_delta\",\"text\":\"hi there\"}'\n  echo '{\"type\":\"done\"}'\ndone\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    (dir, script_path.to_str().unwrap().to_string())
}

fn test_state(base_dir: &std::path::Path, agent_script: &str) -> AppState {
    let mut config = Config::default();
    config.sessions.base_dir = base_dir.to_str().unwrap().to_string();
    config.sessions.max_sessions_per_user = 2;

    let sessions = Arc::new(SessionManager::new(
        Arc::new(MemoryStore::new()),
        config.sessions.clone(),
        config.agent.clone(),
        agent_script.to_string(),
        HashMap::new(),
    ));

    AppState {
        config: Arc::new(config),
        sessions,
        api_token_hash: Arc::new(None),
        started_at: Instant::now(),
        storage_label: "memory",
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// S1: create -> chat -> close.
#[tokio::test]
async fn create_chat_close_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let (_script_dir, script) = echo_script();
    let state = test_state(tmp.path(), &script);
    let app = ag_gateway::api::router::build_router(state);

    let create_res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/sessions",
            json!({ "user_id": "alice" }),
        ))
        .await
        .unwrap();
    assert_eq!(create_res.status(), StatusCode::OK);
    let session = body_json(create_res).await;
    assert_eq!(session["status"], "active");
    assert_eq!(session["message_count"], 0);
    let session_id = session["session_id"].as_str().unwrap().to_string();

    let chat_res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/chat",
            json!({ "session_id": session_id, "message": "hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(chat_res.status(), StatusCode::OK);
    let chat_body = body_json(chat_res).await;
    assert_eq!(chat_body["text"], "hi there");

    let get_res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/api/v1/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let info = body_json(get_res).await;
    assert_eq!(info["message_count"], 1);

    let close_res = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(close_res.status(), StatusCode::NO_CONTENT);

    let missing_res = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/api/v1/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing_res.status(), StatusCode::NOT_FOUND);
}

/// S2: path traversal in `subdir` is rejected with 400.
#[tokio::test]
async fn path_traversal_subdir_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (_script_dir, script) = echo_script();
    let state = test_state(tmp.path(), &script);
    let app = ag_gateway::api::router::build_router(state);

    let res = app
        .oneshot(json_request(
            "POST",
            "/api/v1/sessions",
            json!({ "user_id": "bob", "subdir": "../etc" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = body_json(res).await;
    assert!(body["detail"].as_str().unwrap().contains("'..'"));
}

/// S3: per-user quota rejects the third session with 429.
#[tokio::test]
async fn per_user_quota_rejects_third_session() {
    let tmp = tempfile::tempdir().unwrap();
    let (_script_dir, script) = echo_script();
    let state = test_state(tmp.path(), &script);
    let app = ag_gateway::api::router::build_router(state);

    for subdir in ["s1", "s2"] {
        let res = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/sessions",
                json!({ "user_id": "carol", "subdir": subdir }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let third = app
        .oneshot(json_request(
            "POST",
            "/api/v1/sessions",
            json!({ "user_id": "carol", "subdir": "s3" }),
        ))
        .await
        .unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(third).await;
    assert_eq!(body["kind"], "quota_exceeded");
}

/// Chat against an unknown session_id returns 404, not a panic.
#[tokio::test]
async fn chat_unknown_session_returns_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (_script_dir, script) = echo_script();
    let state = test_state(tmp.path(), &script);
    let app = ag_gateway::api::router::build_router(state);

    let res = app
        .oneshot(json_request(
            "POST",
            "/api/v1/chat",
            json!({ "session_id": "does-not-exist", "message": "hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

/// `GET /health` needs no bearer token even when one is configured.
#[tokio::test]
async fn health_is_unauthenticated() {
    let tmp = tempfile::tempdir().unwrap();
    let (_script_dir, script) = echo_script();
    let mut state = test_state(tmp.path(), &script);
    state.api_token_hash = Arc::new(Some(vec![0u8; 32]));
    let app = ag_gateway::api::router::build_router(state);

    let res = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "ok");
}

/// Mutating endpoints require the bearer token once one is configured.
#[tokio::test]
async fn protected_routes_require_bearer_token_when_configured() {
    let tmp = tempfile::tempdir().unwrap();
    let (_script_dir, script) = echo_script();
    let app = ag_gateway::api::router::build_router(test_state_with_token(
        tmp.path(),
        &script,
        "correct-token",
    ));

    let unauthenticated = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/sessions",
            json!({ "user_id": "dave" }),
        ))
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let mut authed_req = json_request("POST", "/api/v1/sessions", json!({ "user_id": "dave" }));
    authed_req
        .headers_mut()
        .insert("authorization", "Bearer correct-token".parse().unwrap());
    let res = app.oneshot(authed_req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

fn test_state_with_token(
    base_dir: &std::path::Path,
    agent_script: &str,
    token: &str,
) -> AppState {
    use sha2::{Digest, Sha256};
    let mut state = test_state(base_dir, agent_script);
    state.api_token_hash = Arc::new(Some(Sha256::digest(token.as_bytes()).to_vec()));
    state
}
