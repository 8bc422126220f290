//! Integration tests for the HTTP surface
//!
//! Drives the router directly with `tower::ServiceExt::oneshot` — no socket
//! involved. Covers auth, validation errors, the session CRUD status codes
//! and the snapshot/buffer endpoints end to end.

#![cfg(unix)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use vibetunnel::auth::AuthSettings;
use vibetunnel::config::{Credentials, ServerConfig};
use vibetunnel::hq::proxy::proxy_client;
use vibetunnel::live::Broadcaster;
use vibetunnel::server::{build_router, AppState};
use vibetunnel::session::SessionManager;
use vibetunnel::term::BufferCache;

fn test_app(dir: &tempfile::TempDir, credentials: Option<Credentials>) -> Router {
    let config = ServerConfig {
        bind: "127.0.0.1".parse().unwrap(),
        port: 0,
        credentials: credentials.clone(),
        hq_mode: false,
        hq: None,
        control_path: dir.path().to_path_buf(),
        static_path: None,
    };
    let broadcaster = Broadcaster::new();
    let manager = SessionManager::new(config.control_path.clone(), broadcaster.clone()).unwrap();
    let state = Arc::new(AppState {
        config,
        manager,
        broadcaster,
        buffers: Arc::new(BufferCache::new()),
        registry: None,
        proxy_client: proxy_client().unwrap(),
        auth: AuthSettings {
            credentials,
            bearer_token: None,
        },
    });
    build_router(state)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_session(app: &Router, command: Vec<&str>) -> String {
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/sessions",
            json!({"command": command, "workingDir": "/tmp", "cols": 80, "rows": 24}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    body["sessionId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);
    let response = app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_auth_rejects_and_challenges() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(
        &dir,
        Some(Credentials {
            username: "admin".into(),
            password: "secret".into(),
        }),
    );

    let response = app.clone().oneshot(get("/api/sessions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(challenge, "Basic realm=\"VibeTunnel\"");

    let mut authed = get("/api/sessions");
    let encoded = BASE64.encode("admin:secret");
    authed.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Basic {encoded}").parse().unwrap(),
    );
    let response = app.oneshot(authed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_session_validation() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);

    let empty_command = app
        .clone()
        .oneshot(post_json(
            "/api/sessions",
            json!({"command": [], "workingDir": "/tmp"}),
        ))
        .await
        .unwrap();
    assert_eq!(empty_command.status(), StatusCode::BAD_REQUEST);
    let body = body_json(empty_command).await;
    assert!(body["error"].is_string());

    let bad_dir = app
        .clone()
        .oneshot(post_json(
            "/api/sessions",
            json!({"command": ["sh"], "workingDir": "/nope/missing"}),
        ))
        .await
        .unwrap();
    assert_eq!(bad_dir.status(), StatusCode::BAD_REQUEST);

    let bad_cols = app
        .oneshot(post_json(
            "/api/sessions",
            json!({"command": ["sh"], "workingDir": "/tmp", "cols": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(bad_cols.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);
    for uri in [
        "/api/sessions/ffffffffffffffffffffffffffffffff",
        "/api/sessions/ffffffffffffffffffffffffffffffff/snapshot",
        "/api/sessions/ffffffffffffffffffffffffffffffff/stream",
        "/api/sessions/ffffffffffffffffffffffffffffffff/buffer",
    ] {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_session_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);

    let id = create_session(&app, vec!["sh", "-c", "printf hi; sleep 30"]).await;

    // Listed and fetchable.
    let list = body_json(app.clone().oneshot(get("/api/sessions")).await.unwrap()).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    let shown = app
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(shown.status(), StatusCode::OK);
    let shown = body_json(shown).await;
    assert_eq!(shown["sessionId"], id.as_str());

    // Snapshot shows the echoed output within a second.
    let mut saw_hi = false;
    for _ in 0..20 {
        let snapshot = app
            .clone()
            .oneshot(get(&format!("/api/sessions/{id}/snapshot")))
            .await
            .unwrap();
        assert_eq!(snapshot.status(), StatusCode::OK);
        let snapshot = body_json(snapshot).await;
        assert_eq!(snapshot["session_id"], id.as_str());
        assert_eq!(snapshot["header"]["width"], 80);
        let rendered = snapshot["events"].to_string();
        if rendered.contains("hi") {
            saw_hi = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(saw_hi, "snapshot never showed the echoed output");

    // Resize is recorded.
    let resize = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{id}/resize"),
            json!({"cols": 100, "rows": 30}),
        ))
        .await
        .unwrap();
    assert_eq!(resize.status(), StatusCode::OK);
    let snapshot = body_json(
        app.clone()
            .oneshot(get(&format!("/api/sessions/{id}/snapshot")))
            .await
            .unwrap(),
    )
    .await;
    let events = snapshot["events"].as_array().unwrap();
    assert!(events
        .iter()
        .any(|e| e[1] == "r" && e[2] == "100x30"));

    // Kill answers 200, the repeat answers 410 with success still true.
    let killed = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(killed.status(), StatusCode::OK);
    assert_eq!(body_json(killed).await["success"], true);

    let again = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::GONE);
    assert_eq!(body_json(again).await["success"], true);

    // Cleanup removes the directory.
    let cleaned = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}/cleanup")))
        .await
        .unwrap();
    assert_eq!(cleaned.status(), StatusCode::NO_CONTENT);
    assert!(!dir.path().join(&id).exists());
}

#[tokio::test]
async fn test_cleanup_refuses_running_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);
    let id = create_session(&app, vec!["sh", "-c", "sleep 30"]).await;

    let refused = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}/cleanup")))
        .await
        .unwrap();
    assert_eq!(refused.status(), StatusCode::CONFLICT);

    let killed = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(killed.status(), StatusCode::OK);

    let cleaned = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}/cleanup")))
        .await
        .unwrap();
    assert_eq!(cleaned.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_input_endpoint_accepts_both_fields() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);
    let id = create_session(&app, vec!["cat"]).await;

    for body in [json!({"input": "one\n"}), json!({"text": "two\n"})] {
        let response = app
            .clone()
            .oneshot(post_json(&format!("/api/sessions/{id}/input"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let missing = app
        .clone()
        .oneshot(post_json(&format!("/api/sessions/{id}/input"), json!({})))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let killed = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(killed.status(), StatusCode::OK);

    let gone = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{id}/input"),
            json!({"input": "late\n"}),
        ))
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::GONE);
}

#[tokio::test]
async fn test_resize_validation_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);
    let id = create_session(&app, vec!["sh", "-c", "sleep 30"]).await;

    let bad = app
        .clone()
        .oneshot(post_json(
            &format!("/api/sessions/{id}/resize"),
            json!({"cols": -1, "rows": 24}),
        ))
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    let _ = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_buffer_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);
    let id = create_session(&app, vec!["sh", "-c", "printf buffered; sleep 30"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let binary = app
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}/buffer?format=binary")))
        .await
        .unwrap();
    assert_eq!(binary.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(binary.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    assert_eq!(&bytes[..4], b"SNAP");
    let decoded = vibetunnel::term::BufferSnapshot::decode(&bytes).unwrap();
    assert_eq!(decoded.cols, 80);

    let json_form = app
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}/buffer?format=json")))
        .await
        .unwrap();
    assert_eq!(json_form.status(), StatusCode::OK);
    let body = body_json(json_form).await;
    assert_eq!(body["cols"], 80);
    assert_eq!(body["rows"], 24);

    let stats = app
        .clone()
        .oneshot(get(&format!("/api/sessions/{id}/buffer/stats")))
        .await
        .unwrap();
    assert_eq!(stats.status(), StatusCode::OK);
    let stats = body_json(stats).await;
    assert_eq!(stats["lines"], 24);
    assert_eq!(stats["cells"], 24 * 80);

    let _ = app
        .clone()
        .oneshot(delete(&format!("/api/sessions/{id}")))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_remotes_endpoints_require_hq_mode() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);
    let response = app.clone().oneshot(get("/api/remotes")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_json(
            "/api/remotes/register",
            json!({"id": "r1", "name": "edge", "url": "http://e:1", "token": "t"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cleanup_exited_returns_no_content_locally() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);
    let response = app
        .oneshot(post_json("/api/cleanup-exited", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_fs_browse_and_mkdir() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(&dir, None);

    let escape = app
        .clone()
        .oneshot(get("/api/fs/browse?path=/"))
        .await
        .unwrap();
    assert_eq!(escape.status(), StatusCode::BAD_REQUEST);

    let listing = app.clone().oneshot(get("/api/fs/browse?path=~")).await.unwrap();
    assert_eq!(listing.status(), StatusCode::OK);
    let listing = body_json(listing).await;
    assert!(listing["absolutePath"].is_string());
    assert!(listing["files"].is_array());

    let bad_name = app
        .oneshot(post_json(
            "/api/mkdir",
            json!({"parent": "~", "name": "../evil"}),
        ))
        .await
        .unwrap();
    assert_eq!(bad_name.status(), StatusCode::BAD_REQUEST);
}
