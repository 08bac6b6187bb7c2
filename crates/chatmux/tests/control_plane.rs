//! HTTP control plane tests, driven through the router with
//! `tower::ServiceExt::oneshot` (no sockets).

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chatmux::control::{ADMIN_KEY_HEADER, AttachmentRoute, build_control_plane};
use chatmux::prelude::*;
use chatmux::session::FsAttachmentSink;
use serde_json::{Value, json};
use tower::ServiceExt;

const ADMIN_KEY: &str = "admin-key";
const WAIT: Duration = Duration::from_secs(3);

struct App {
    router: Router,
    registry: Arc<SessionRegistry>,
    factory: LoopbackFactory,
    sink: Arc<MemoryAttachmentSink>,
}

fn app_with(admin_key: Option<&str>) -> App {
    let factory = LoopbackFactory::new();
    let sink = Arc::new(MemoryAttachmentSink::new());
    let registry = Arc::new(
        SessionRegistry::builder(
            Arc::new(factory.clone()),
            Arc::new(HmacTokenIssuer::new("test-secret")),
        )
        .artifacts(Arc::new(MemoryArtifactStore::new()))
        .attachments(sink.clone())
        .build(),
    );
    let router = build_control_plane(
        Arc::clone(&registry),
        admin_key.map(str::to_owned),
        AttachmentRoute::Sink(sink.clone()),
    );
    App {
        router,
        registry,
        factory,
        sink,
    }
}

fn app() -> App {
    app_with(Some(ADMIN_KEY))
}

fn sid(raw: &str) -> SessionId {
    SessionId::new(raw).unwrap()
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn admin_get(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(ADMIN_KEY_HEADER, key)
        .body(Body::empty())
        .unwrap()
}

/// Creates `id` over HTTP, scans its challenge and waits for `Ready`.
async fn ready_session(app: &App, id: &str) {
    let (status, _) = call(&app.router, post("/create-session", json!({ "sessionId": id }))).await;
    assert_eq!(status, StatusCode::OK);

    let handle = app.registry.get(&sid(id)).await.unwrap();
    tokio::time::timeout(WAIT, handle.wait_for(|s| s.status == SessionStatus::AwaitingChallenge))
        .await
        .unwrap()
        .unwrap();
    app.factory.latest(&sid(id)).await.unwrap().scan().await.unwrap();
    tokio::time::timeout(WAIT, handle.wait_for(|s| s.status == SessionStatus::Ready))
        .await
        .unwrap()
        .unwrap();
}

async fn token_for(app: &App, id: &str) -> String {
    let (status, body) = call(
        &app.router,
        admin_get(&format!("/sessions/{id}/token"), ADMIN_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["authToken"].as_str().unwrap().to_owned()
}

// ---------------------------------------------------------------------------
// Health / listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_reports_session_count() {
    let app = app();
    let (status, body) = call(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "sessions": 0 }));

    call(&app.router, post("/create-session", json!({ "sessionId": "ventas" }))).await;
    let (_, body) = call(&app.router, get("/health")).await;
    assert_eq!(body["sessions"], 1);
}

#[tokio::test]
async fn test_list_sessions_reports_status_and_readiness() {
    let app = app();
    ready_session(&app, "ventas").await;
    call(&app.router, post("/create-session", json!({ "sessionId": "soporte" }))).await;

    let (status, body) = call(&app.router, get("/sessions")).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = body.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["sessionId"], "soporte");
    assert_eq!(sessions[0]["ready"], false);
    assert_eq!(sessions[1]["sessionId"], "ventas");
    assert_eq!(sessions[1]["ready"], true);
    assert_eq!(sessions[1]["status"], "ready");
}

#[tokio::test]
async fn test_get_session_unknown_returns_404() {
    let app = app();
    let (status, body) = call(&app.router, get("/sessions/nadie")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nadie"));
}

// ---------------------------------------------------------------------------
// create-session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_session_returns_success_without_token() {
    let app = app();
    let (status, body) = call(&app.router, post("/create-session", json!({ "sessionId": "ventas" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "sessionId": "ventas" }));
    assert!(app.registry.get(&sid("ventas")).await.is_some());
}

#[tokio::test]
async fn test_create_session_duplicate_returns_400() {
    let app = app();
    call(&app.router, post("/create-session", json!({ "sessionId": "ventas" }))).await;
    let (status, body) = call(&app.router, post("/create-session", json!({ "sessionId": "ventas" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("already exists"));
    assert_eq!(app.factory.construction_count(&sid("ventas")).await, 1);
}

#[tokio::test]
async fn test_create_session_rejects_missing_and_invalid_ids() {
    let app = app();
    for body in [json!({}), json!({ "sessionId": "" }), json!({ "sessionId": "../etc" })] {
        let (status, _) = call(&app.router, post("/create-session", body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    }
    assert!(app.registry.is_empty().await);
}

#[tokio::test]
async fn test_create_session_malformed_json_returns_400() {
    let app = app();
    let request = Request::builder()
        .method("POST")
        .uri("/create-session")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = call(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid JSON body");
}

// ---------------------------------------------------------------------------
// close-session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_close_session_unknown_returns_404() {
    let app = app();
    let (status, _) = call(&app.router, post("/close-session", json!({ "sessionId": "nadie" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_close_session_destroys_adapter_and_removes_entry() {
    let app = app();
    ready_session(&app, "ventas").await;

    let (status, body) = call(&app.router, post("/close-session", json!({ "sessionId": "ventas" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(app.registry.get(&sid("ventas")).await.is_none());
    assert!(app.factory.latest(&sid("ventas")).await.unwrap().is_destroyed());
}

#[tokio::test]
async fn test_close_session_failed_shutdown_returns_500_with_details() {
    let app = app();
    ready_session(&app, "ventas").await;
    app.factory.fail_destroy(true);

    let (status, body) = call(&app.router, post("/close-session", json!({ "sessionId": "ventas" }))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "failed to close session");
    assert!(body["details"].is_string());
    assert!(app.registry.get(&sid("ventas")).await.is_none());
}

// ---------------------------------------------------------------------------
// send-message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_send_message_missing_fields_returns_400() {
    let app = app();
    let (status, _) = call(
        &app.router,
        post("/send-message", json!({ "number": "5215550001", "message": "hola" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_send_message_forged_token_returns_401() {
    let app = app();
    let (status, _) = call(
        &app.router,
        post(
            "/send-message",
            json!({ "number": "5215550001", "message": "hola", "authToken": "a.b.c" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_send_message_with_token_reaches_adapter() {
    let app = app();
    ready_session(&app, "ventas").await;
    let token = token_for(&app, "ventas").await;

    let (status, body) = call(
        &app.router,
        post(
            "/send-message",
            json!({ "number": "5215550001", "message": "hola", "authToken": token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);

    let sent = app.factory.latest(&sid("ventas")).await.unwrap().sent().await;
    assert_eq!(sent, vec![(ChatId::from_number("5215550001"), "hola".to_owned())]);
}

#[tokio::test]
async fn test_send_message_after_close_returns_404() {
    let app = app();
    ready_session(&app, "ventas").await;
    let token = token_for(&app, "ventas").await;
    call(&app.router, post("/close-session", json!({ "sessionId": "ventas" }))).await;

    let (status, _) = call(
        &app.router,
        post(
            "/send-message",
            json!({ "number": "5215550001", "message": "hola", "authToken": token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Admin routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_session_token_requires_admin_key() {
    let app = app();
    ready_session(&app, "ventas").await;

    let (status, _) = call(&app.router, get("/sessions/ventas/token")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app.router, admin_get("/sessions/ventas/token", "wrong")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_session_token_disabled_without_admin_key() {
    let app = app_with(None);
    ready_session(&app, "ventas").await;

    let (status, _) = call(&app.router, admin_get("/sessions/ventas/token", ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_session_token_before_ready_returns_409() {
    let app = app();
    call(&app.router, post("/create-session", json!({ "sessionId": "ventas" }))).await;

    let (status, _) = call(&app.router, admin_get("/sessions/ventas/token", ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_session_token_reports_expiry() {
    let app = app();
    ready_session(&app, "ventas").await;

    let (status, body) = call(&app.router, admin_get("/sessions/ventas/token", ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionId"], "ventas");
    assert!(body["expiresAt"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_purge_artifacts_refuses_live_session() {
    let app = app();
    ready_session(&app, "ventas").await;

    let purge = |key: &str| {
        Request::builder()
            .method("POST")
            .uri("/purge-artifacts")
            .header("content-type", "application/json")
            .header(ADMIN_KEY_HEADER, key)
            .body(Body::from(json!({ "sessionId": "ventas" }).to_string()))
            .unwrap()
    };

    let (status, _) = call(&app.router, purge("wrong")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&app.router, purge(ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    call(&app.router, post("/close-session", json!({ "sessionId": "ventas" }))).await;
    let (status, body) = call(&app.router, purge(ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_attachments_served_from_sink() {
    let app = app();
    let stored = app
        .sink
        .store(&sid("ventas"), "file_1.png", b"\x89PNG")
        .await
        .unwrap();

    let response = app.router.clone().oneshot(get(&stored.path)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"\x89PNG");

    let (status, _) = call(&app.router, get("/attachments/ventas/missing.png")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_attachments_served_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(FsAttachmentSink::new(dir.path()));
    let registry = Arc::new(
        SessionRegistry::builder(
            Arc::new(LoopbackFactory::new()),
            Arc::new(HmacTokenIssuer::new("test-secret")),
        )
        .artifacts(Arc::new(MemoryArtifactStore::new()))
        .attachments(sink.clone())
        .build(),
    );
    let router = build_control_plane(registry, None, AttachmentRoute::Dir(dir.path().to_path_buf()));

    let stored = sink
        .store(&sid("ventas"), "file_1.pdf", b"%PDF-1.7")
        .await
        .unwrap();
    assert!(dir.path().join("ventas").join(&stored.file_name).exists());

    let response = router.clone().oneshot(get(&stored.path)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"%PDF-1.7");

    let response = router
        .oneshot(get("/attachments/ventas/missing.pdf"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
