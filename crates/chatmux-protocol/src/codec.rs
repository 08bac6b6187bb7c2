//! Codec trait and implementations for serializing observer frames.
//!
//! The observer channel carries [`SessionEvent`](crate::SessionEvent)s out
//! and [`ObserverCommand`](crate::ObserverCommand)s in. How those become
//! bytes is the codec's business; the transport only moves bytes and the
//! session layer only produces events.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes Rust values to bytes and decodes them back.
///
/// `Send + Sync + 'static` because one codec instance is shared by every
/// observer connection task for the life of the server.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or don't
    /// match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Observers are typically browser dashboards, so JSON is the only codec
/// shipped. It sits behind the `json` feature (enabled by default).
///
/// ## Example
///
/// ```rust
/// use chatmux_protocol::{Codec, JsonCodec, SessionEvent, SessionId};
///
/// let codec = JsonCodec;
/// let event = SessionEvent::Ready { session_id: SessionId::new("alice").unwrap() };
///
/// let bytes = codec.encode(&event).unwrap();
/// let decoded: SessionEvent = codec.decode(&bytes).unwrap();
/// assert_eq!(event, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
