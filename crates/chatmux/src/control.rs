//! HTTP control plane.
//!
//! A thin axum router over [`SessionRegistry`]: each handler validates its
//! input, calls one registry operation and maps the outcome to a status
//! code with a JSON body. Errors always look like
//! `{ "error": "...", "details"?: "..." }`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatmux_protocol::{ChatId, SessionId};
use chatmux_session::{
    ATTACHMENT_URL_PREFIX, AttachmentSink, SessionError, SessionRegistry, SessionStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;

/// Header carrying the administrative key.
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Where `/attachments/...` requests are answered from.
#[derive(Clone)]
pub enum AttachmentRoute {
    /// Static files under a directory (the filesystem sink's root).
    Dir(PathBuf),
    /// Read back through an arbitrary sink.
    Sink(Arc<dyn AttachmentSink>),
}

#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry>,
    admin_key: Option<Arc<str>>,
    sink: Option<Arc<dyn AttachmentSink>>,
}

/// Builds the control plane router (shared between the server and tests).
pub fn build_control_plane(
    registry: Arc<SessionRegistry>,
    admin_key: Option<String>,
    attachments: AttachmentRoute,
) -> Router {
    let sink = match &attachments {
        AttachmentRoute::Sink(sink) => Some(Arc::clone(sink)),
        AttachmentRoute::Dir(_) => None,
    };
    let state = AppState {
        registry,
        admin_key: admin_key.map(Arc::from),
        sink,
    };

    let router = Router::new()
        .route("/health", get(health))
        .route("/create-session", post(create_session))
        .route("/close-session", post(close_session))
        .route("/send-message", post(send_message))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", get(get_session))
        .route("/sessions/{session_id}/token", get(session_token))
        .route("/purge-artifacts", post(purge_artifacts));

    let router = match attachments {
        AttachmentRoute::Dir(root) => router.nest_service(ATTACHMENT_URL_PREFIX, ServeDir::new(root)),
        AttachmentRoute::Sink(_) => router.route("/attachments/{*path}", get(read_attachment)),
    };

    router.with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An error response: status plus `{error, details?}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    details: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            details: None,
        }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.details {
            Some(details) => json!({ "error": self.error, "details": details }),
            None => json!({ "error": self.error }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match &err {
            SessionError::AlreadyExists(_) => Self::bad_request(err.to_string()),
            SessionError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            SessionError::AuthInvalid(_) | SessionError::AuthExpired => {
                Self::new(StatusCode::UNAUTHORIZED, err.to_string())
            }
            SessionError::NotReady { .. } | SessionError::SessionLive(_) => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            SessionError::SendFailed(_, source) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to send message")
                    .with_details(source.to_string())
            }
            SessionError::TerminationFailed(_, source) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "failed to close session")
                    .with_details(source.to_string())
            }
            SessionError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            SessionError::AttachmentFetchFailed(_) | SessionError::Storage(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    .with_details(err.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    number: Option<String>,
    message: Option<String>,
    auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    session_id: SessionId,
    status: SessionStatus,
    ready: bool,
}

/// Unwraps the JSON body, turning axum's rejection into our error shape.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request("invalid JSON body").with_details(rejection.body_text()))
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_session_id(raw: Option<String>) -> ApiResult<SessionId> {
    let raw = required(raw).ok_or_else(|| ApiError::bad_request("sessionId is required"))?;
    SessionId::new(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.admin_key.as_deref() else {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "administrative routes are disabled"));
    };
    let presented = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !safe_equal(presented, expected) {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "invalid admin key"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "sessions": state.registry.len().await }))
}

async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let session_id = parse_session_id(body(payload)?.session_id)?;
    state.registry.create(session_id.clone()).await?;
    Ok(Json(json!({ "success": true, "sessionId": session_id })))
}

async fn close_session(
    State(state): State<AppState>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let session_id = parse_session_id(body(payload)?.session_id)?;
    state.registry.close(&session_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("session {session_id} closed"),
    })))
}

async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = body(payload)?;
    let (Some(number), Some(message), Some(token)) = (
        required(request.number),
        required(request.message),
        required(request.auth_token),
    ) else {
        return Err(ApiError::bad_request("number, message and authToken are required"));
    };

    let session_id = state
        .registry
        .send_message(&token, ChatId::from_number(&number), message)
        .await?;
    tracing::debug!(%session_id, "message accepted");
    Ok(Json(json!({ "success": true, "message": "message sent" })))
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions: Vec<SessionView> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|summary| SessionView {
            session_id: summary.session_id,
            ready: summary.status.is_ready(),
            status: summary.status,
        })
        .collect();
    Json(sessions)
}

async fn get_session(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session_id = parse_session_id(Some(raw))?;
    let handle = state
        .registry
        .get(&session_id)
        .await
        .ok_or_else(|| ApiError::from(SessionError::NotFound(session_id.clone())))?;
    let status = handle.status();
    Ok(Json(SessionView {
        session_id,
        ready: status.is_ready(),
        status,
    }))
}

/// Hands out the session's current access token to an administrator.
async fn session_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw): Path<String>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let session_id = parse_session_id(Some(raw))?;
    let handle = state
        .registry
        .get(&session_id)
        .await
        .filter(|handle| handle.is_live())
        .ok_or_else(|| ApiError::from(SessionError::NotFound(session_id.clone())))?;
    let Some(token) = handle.access_token() else {
        return Err(SessionError::NotReady {
            session_id,
            status: handle.status(),
        }
        .into());
    };
    Ok(Json(json!({
        "sessionId": session_id,
        "authToken": token.token,
        "expiresAt": token.claims.exp,
    })))
}

async fn purge_artifacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let session_id = parse_session_id(body(payload)?.session_id)?;
    state.registry.purge_artifacts(&session_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("artifacts of {session_id} purged"),
    })))
}

async fn read_attachment(
    State(state): State<AppState>,
    Path(rest): Path<String>,
) -> ApiResult<Response> {
    let Some(sink) = state.sink else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "attachment not found"));
    };
    let path = format!("{ATTACHMENT_URL_PREFIX}/{rest}");
    match sink.read(&path).await? {
        Some(bytes) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response()),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "attachment not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_equal() {
        assert!(safe_equal("admin", "admin"));
        assert!(!safe_equal("admin", "admiN"));
        assert!(!safe_equal("admin", "admin2"));
        assert!(!safe_equal("", "admin"));
    }

    #[test]
    fn test_session_error_status_mapping() {
        let id = SessionId::new("ventas").unwrap();
        let cases = [
            (SessionError::AlreadyExists(id.clone()), StatusCode::BAD_REQUEST),
            (SessionError::NotFound(id.clone()), StatusCode::NOT_FOUND),
            (SessionError::AuthExpired, StatusCode::UNAUTHORIZED),
            (SessionError::AuthInvalid("x".into()), StatusCode::UNAUTHORIZED),
            (
                SessionError::NotReady {
                    session_id: id.clone(),
                    status: SessionStatus::Disconnected,
                },
                StatusCode::CONFLICT,
            ),
            (SessionError::SessionLive(id.clone()), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_termination_failure_carries_details() {
        let err = ApiError::from(SessionError::TerminationFailed(
            SessionId::new("ventas").unwrap(),
            chatmux_session::AdapterError::Shutdown("browser hung".into()),
        ));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error, "failed to close session");
        assert!(err.details.unwrap().contains("browser hung"));
    }

    #[test]
    fn test_parse_session_id_rejects_missing_and_invalid() {
        assert!(parse_session_id(None).is_err());
        assert!(parse_session_id(Some("  ".into())).is_err());
        assert!(parse_session_id(Some("../etc".into())).is_err());
        assert_eq!(
            parse_session_id(Some("ventas".into())).unwrap().as_str(),
            "ventas"
        );
    }
}
