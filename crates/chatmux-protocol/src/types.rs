//! Core wire types for chatmux.
//!
//! Everything in this module either identifies a session or travels to an
//! observer: session identifiers, the protocol's chat addresses, and the
//! lifecycle/message events fanned out to WebSocket subscribers.

use serde::{Deserialize, Serialize};

use std::fmt;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Caller-supplied identifier of one logical chat account.
///
/// A session id doubles as the name of the session's artifact and
/// attachment directories, so it is validated on construction: it must be
/// non-empty, at most [`SessionId::MAX_LEN`] bytes, and must not contain
/// path separators, `..`, or control characters.
///
/// Serde goes through the same validation (`try_from = "String"`), so a
/// `SessionId` deserialized from a request body is always safe to use as a
/// path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Longest accepted identifier, in bytes.
    pub const MAX_LEN: usize = 128;

    /// Validates and wraps a raw identifier.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidSessionId`] when the identifier is
    /// empty, too long, or not usable as a single path component.
    pub fn new(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ProtocolError::InvalidSessionId(
                "session id must not be empty".into(),
            ));
        }
        if raw.len() > Self::MAX_LEN {
            return Err(ProtocolError::InvalidSessionId(format!(
                "session id longer than {} bytes",
                Self::MAX_LEN
            )));
        }
        if raw == "." || raw.contains("..") {
            return Err(ProtocolError::InvalidSessionId(format!(
                "session id {raw:?} is not a valid path component"
            )));
        }
        if raw
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(ProtocolError::InvalidSessionId(format!(
                "session id {raw:?} contains a forbidden character"
            )));
        }
        Ok(Self(raw))
    }

    /// Borrows the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a chat on the underlying protocol (`<number>@c.us`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    /// Suffix that marks an individual-chat address.
    pub const USER_SUFFIX: &'static str = "@c.us";

    /// Normalizes a bare phone number into the addressed-chat form.
    ///
    /// Inputs that already carry the suffix are left untouched, so the
    /// function is idempotent.
    ///
    /// ```rust
    /// use chatmux_protocol::ChatId;
    ///
    /// assert_eq!(ChatId::from_number("5215550001").as_str(), "5215550001@c.us");
    /// assert_eq!(ChatId::from_number("5215550001@c.us").as_str(), "5215550001@c.us");
    /// ```
    pub fn from_number(number: &str) -> Self {
        let number = number.trim();
        if number.contains(Self::USER_SUFFIX) {
            Self(number.to_string())
        } else {
            Self(format!("{number}{}", Self::USER_SUFFIX))
        }
    }

    /// Borrows the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// SessionEvent — what observers receive
// ---------------------------------------------------------------------------

/// A stored attachment, as referenced from a [`SessionEvent::Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    /// Stable retrieval path, e.g. `/attachments/alice/file_1700000000000.png`.
    pub path: String,
    /// File name inside the session's attachment directory.
    pub file_name: String,
    /// Content type declared by the sender.
    pub mime_type: String,
}

/// A session-scoped event pushed to observers.
///
/// Every variant carries the `session_id` so observers watching several
/// concurrent sessions can tell them apart.
///
/// The serde layout is "adjacently tagged": the topic goes in `event` and
/// the fields in `data`, which is the shape observers subscribe to:
///
/// ```text
/// { "event": "qr", "data": { "sessionId": "alice", "qr": "2@AbC..." } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum SessionEvent {
    /// The protocol issued a scan-to-authenticate challenge.
    #[serde(rename = "qr")]
    Challenge { session_id: SessionId, qr: String },

    /// The session authenticated and can send messages.
    Ready { session_id: SessionId },

    /// An inbound message (or an attachment notice).
    Message {
        session_id: SessionId,
        from: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<AttachmentRef>,
        /// Local time the message was processed, `DD-MM-YYYY HH:MM:SS`.
        timestamp: String,
    },

    /// The transport dropped; an automatic reconnect follows.
    Disconnected { session_id: SessionId, reason: String },

    /// The reconnect ceiling was reached; the session is terminated.
    ReconnectAbandoned { session_id: SessionId, attempts: u32 },

    /// The session was closed on request.
    Closed { session_id: SessionId },
}

impl SessionEvent {
    /// The session this event belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Challenge { session_id, .. }
            | Self::Ready { session_id }
            | Self::Message { session_id, .. }
            | Self::Disconnected { session_id, .. }
            | Self::ReconnectAbandoned { session_id, .. }
            | Self::Closed { session_id } => session_id,
        }
    }

    /// The topic name this event is published under (the `event` tag).
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Challenge { .. } => "qr",
            Self::Ready { .. } => "ready",
            Self::Message { .. } => "message",
            Self::Disconnected { .. } => "disconnected",
            Self::ReconnectAbandoned { .. } => "reconnect_abandoned",
            Self::Closed { .. } => "closed",
        }
    }
}

// ---------------------------------------------------------------------------
// ObserverCommand — what observers may send back
// ---------------------------------------------------------------------------

/// Client → server messages on the observer channel.
///
/// Observers start subscribed to every session. They can narrow the feed
/// to a set of sessions or widen it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ObserverCommand {
    /// Only forward events for these sessions.
    Subscribe { session_ids: Vec<SessionId> },

    /// Forward events for every session (the initial state).
    SubscribeAll,
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: &str) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    // =====================================================================
    // SessionId
    // =====================================================================

    #[test]
    fn test_session_id_new_accepts_plain_names() {
        assert_eq!(sid("ventas-01").as_str(), "ventas-01");
        assert_eq!(sid("soporte_mx").to_string(), "soporte_mx");
    }

    #[test]
    fn test_session_id_new_rejects_empty() {
        assert!(matches!(
            SessionId::new(""),
            Err(ProtocolError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn test_session_id_new_rejects_path_traversal() {
        for raw in ["..", "a/b", "..\\x", "a..b", ".", "tab\there"] {
            assert!(
                SessionId::new(raw).is_err(),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_session_id_new_rejects_overlong() {
        let raw = "x".repeat(SessionId::MAX_LEN + 1);
        assert!(SessionId::new(raw).is_err());
    }

    #[test]
    fn test_session_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&sid("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
    }

    #[test]
    fn test_session_id_deserialize_validates() {
        let ok: SessionId = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(ok, sid("alice"));

        let bad: Result<SessionId, _> = serde_json::from_str("\"../etc\"");
        assert!(bad.is_err());
    }

    // =====================================================================
    // ChatId
    // =====================================================================

    #[test]
    fn test_chat_id_from_number_appends_suffix() {
        assert_eq!(
            ChatId::from_number("5216621234567").as_str(),
            "5216621234567@c.us"
        );
    }

    #[test]
    fn test_chat_id_from_number_keeps_existing_suffix() {
        assert_eq!(
            ChatId::from_number("5216621234567@c.us").as_str(),
            "5216621234567@c.us"
        );
    }

    #[test]
    fn test_chat_id_from_number_trims_whitespace() {
        assert_eq!(ChatId::from_number(" 123 ").as_str(), "123@c.us");
    }

    // =====================================================================
    // SessionEvent
    // =====================================================================

    #[test]
    fn test_session_event_challenge_json_format() {
        let event = SessionEvent::Challenge {
            session_id: sid("alice"),
            qr: "2@abc".into(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "qr");
        assert_eq!(json["data"]["sessionId"], "alice");
        assert_eq!(json["data"]["qr"], "2@abc");
    }

    #[test]
    fn test_session_event_message_without_attachment_omits_field() {
        let event = SessionEvent::Message {
            session_id: sid("alice"),
            from: "521@c.us".into(),
            body: "hola".into(),
            attachment: None,
            timestamp: "01-02-2025 13:45:00".into(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "message");
        assert_eq!(json["data"]["from"], "521@c.us");
        assert_eq!(json["data"]["timestamp"], "01-02-2025 13:45:00");
        assert!(json["data"].get("attachment").is_none());
    }

    #[test]
    fn test_session_event_message_attachment_uses_camel_case() {
        let event = SessionEvent::Message {
            session_id: sid("alice"),
            from: "521@c.us".into(),
            body: String::new(),
            attachment: Some(AttachmentRef {
                path: "/attachments/alice/file_1.png".into(),
                file_name: "file_1.png".into(),
                mime_type: "image/png".into(),
            }),
            timestamp: "01-02-2025 13:45:00".into(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["data"]["attachment"]["fileName"], "file_1.png");
        assert_eq!(json["data"]["attachment"]["mimeType"], "image/png");
    }

    #[test]
    fn test_session_event_topic_matches_serialized_tag() {
        let events = [
            SessionEvent::Ready { session_id: sid("a") },
            SessionEvent::Disconnected {
                session_id: sid("a"),
                reason: "NAVIGATION".into(),
            },
            SessionEvent::ReconnectAbandoned {
                session_id: sid("a"),
                attempts: 3,
            },
            SessionEvent::Closed { session_id: sid("a") },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.topic());
            assert_eq!(event.session_id(), &sid("a"));
        }
    }

    // =====================================================================
    // ObserverCommand
    // =====================================================================

    #[test]
    fn test_observer_command_subscribe_json_format() {
        let json = r#"{"type":"Subscribe","sessionIds":["alice","bob"]}"#;
        let cmd: ObserverCommand = serde_json::from_str(json).unwrap();
        assert_eq!(
            cmd,
            ObserverCommand::Subscribe {
                session_ids: vec![sid("alice"), sid("bob")]
            }
        );
    }

    #[test]
    fn test_observer_command_unknown_type_returns_error() {
        let result: Result<ObserverCommand, _> =
            serde_json::from_str(r#"{"type":"Unsubscribe"}"#);
        assert!(result.is_err());
    }
}
