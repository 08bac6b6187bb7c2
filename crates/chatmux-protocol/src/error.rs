//! Error types for the protocol layer.

/// Errors that can occur in the protocol layer.
///
/// Each chatmux crate defines its own error enum; a `ProtocolError` always
/// means the problem is in (de)serialization or identifier validation,
/// never in networking or session state.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields, or an
    /// unknown `type` tag on an observer command.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A session identifier failed validation.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// The message is well-formed but violates protocol rules.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
