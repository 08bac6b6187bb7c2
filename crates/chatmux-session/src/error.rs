//! Error types for the session layer.

use chatmux_protocol::SessionId;

use crate::SessionStatus;

/// Errors that can occur while managing sessions.
///
/// The control plane maps each variant to an HTTP status; see the
/// `chatmux` crate. Per-message failures (`AttachmentFetchFailed`) are
/// logged by the handle and never reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A live session with this id is already registered.
    #[error("session {0} already exists")]
    AlreadyExists(SessionId),

    /// No session with this id is registered (or the token's session is
    /// gone).
    #[error("session {0} does not exist")]
    NotFound(SessionId),

    /// The access token is malformed or its signature does not verify.
    #[error("invalid access token: {0}")]
    AuthInvalid(String),

    /// The access token verified but its validity window has passed.
    #[error("access token expired")]
    AuthExpired,

    /// The operation needs an authenticated session.
    #[error("session {session_id} is not ready (status: {status})")]
    NotReady {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// The adapter rejected an outbound message.
    #[error("sending through session {0} failed: {1}")]
    SendFailed(SessionId, #[source] AdapterError),

    /// An inbound attachment could not be retrieved.
    #[error("attachment fetch failed: {0}")]
    AttachmentFetchFailed(String),

    /// The adapter failed to shut down cleanly. The session is closed
    /// from the registry's point of view regardless.
    #[error("closing session {0} failed: {1}")]
    TerminationFailed(SessionId, #[source] AdapterError),

    /// An administrative operation was refused because the session is
    /// still live.
    #[error("session {0} is live; close it first")]
    SessionLive(SessionId),

    /// Artifact or attachment persistence failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The handle's actor has stopped and can no longer take commands.
    #[error("session {0} is unavailable")]
    Unavailable(SessionId),
}

impl SessionError {
    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }
}

/// Failures reported by a [`ClientAdapter`](crate::ClientAdapter) or an
/// [`AdapterFactory`](crate::AdapterFactory).
///
/// Adapters wrap an external protocol client, so the payload is the
/// client's own message rather than a structured cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Building or starting the connection failed.
    #[error("initialization failed: {0}")]
    Initialize(String),

    /// The outbound message was rejected.
    #[error("send failed: {0}")]
    Send(String),

    /// Downloading an attachment failed.
    #[error("download failed: {0}")]
    Download(String),

    /// Releasing resources or destroying the client failed.
    #[error("shutdown failed: {0}")]
    Shutdown(String),
}
