//! The seam between a session handle and a concrete protocol client.
//!
//! chatmux does not speak any chat protocol itself. A [`ClientAdapter`]
//! wraps one client connection (for WhatsApp Web, a headless browser
//! driven by a client library) and reports what happens on it through
//! [`AdapterEvents`]. An [`AdapterFactory`] builds a fresh adapter each
//! time a handle connects or reconnects.
//!
//! # Generations
//!
//! Every adapter a handle builds gets a new *generation* number, stamped
//! on each event it emits. After a reconnect the handle ignores events
//! from older generations, so a dying client cannot flip the state of
//! its replacement.

use std::sync::Arc;

use async_trait::async_trait;
use chatmux_protocol::{ChatId, SessionId};
use tokio::sync::mpsc;

use crate::{AdapterError, ArtifactScope};

/// Sender id the protocol uses for status updates. Messages from it are
/// never forwarded.
pub const STATUS_BROADCAST_SENDER: &str = "status@broadcast";

/// A message received by the protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Protocol-assigned id, used to fetch the attachment later.
    pub id: String,
    pub from: String,
    /// Text, or the caption of a media message.
    pub body: String,
    pub has_attachment: bool,
}

impl InboundMessage {
    pub fn is_status_broadcast(&self) -> bool {
        self.from == STATUS_BROADCAST_SENDER
    }
}

/// Downloaded attachment content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// What an adapter reports about its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The protocol issued a challenge (QR payload) to complete.
    Challenge(String),
    /// The client is authenticated.
    Ready,
    Message(InboundMessage),
    /// The connection dropped, with the client's reason.
    Disconnected(String),
}

/// Generation-stamped event channel handed to each adapter.
#[derive(Debug, Clone)]
pub struct AdapterEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, AdapterEvent)>,
}

impl AdapterEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, AdapterEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports an event. Returns `false` once the handle is gone.
    pub fn emit(&self, event: AdapterEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// One live client connection for one session.
///
/// `initialize` is called once, from its own task, right after the factory
/// returns; it may run for as long as the connection lasts. The handle
/// calls `release_resources` and then `destroy` after a disconnect, and
/// only `destroy` on close.
#[async_trait]
pub trait ClientAdapter: Send + Sync + 'static {
    /// Starts the client. An error is treated as a disconnect.
    async fn initialize(&self) -> Result<(), AdapterError>;

    async fn send_message(&self, chat: &ChatId, body: &str) -> Result<(), AdapterError>;

    /// Fetches the media of `message`. `Ok(None)` means the protocol had
    /// nothing to download.
    async fn download_attachment(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<AttachmentPayload>, AdapterError>;

    /// Frees heavyweight resources (browser processes) before the adapter
    /// is discarded after a disconnect.
    async fn release_resources(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Shuts the client down.
    async fn destroy(&self) -> Result<(), AdapterError>;
}

/// Builds adapters.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use chatmux_protocol::{ChatId, SessionId};
/// use chatmux_session::{
///     AdapterError, AdapterEvent, AdapterEvents, AdapterFactory, ArtifactScope,
///     AttachmentPayload, ClientAdapter, InboundMessage,
/// };
///
/// struct Echo {
///     events: AdapterEvents,
/// }
///
/// #[async_trait]
/// impl ClientAdapter for Echo {
///     async fn initialize(&self) -> Result<(), AdapterError> {
///         self.events.emit(AdapterEvent::Ready);
///         Ok(())
///     }
///
///     async fn send_message(&self, chat: &ChatId, body: &str) -> Result<(), AdapterError> {
///         self.events.emit(AdapterEvent::Message(InboundMessage {
///             id: "echo".into(),
///             from: chat.to_string(),
///             body: body.into(),
///             has_attachment: false,
///         }));
///         Ok(())
///     }
///
///     async fn download_attachment(
///         &self,
///         _message: &InboundMessage,
///     ) -> Result<Option<AttachmentPayload>, AdapterError> {
///         Ok(None)
///     }
///
///     async fn destroy(&self) -> Result<(), AdapterError> {
///         Ok(())
///     }
/// }
///
/// struct EchoFactory;
///
/// #[async_trait]
/// impl AdapterFactory for EchoFactory {
///     async fn create(
///         &self,
///         _session_id: &SessionId,
///         _artifacts: ArtifactScope,
///         events: AdapterEvents,
///     ) -> Result<Arc<dyn ClientAdapter>, AdapterError> {
///         Ok(Arc::new(Echo { events }))
///     }
/// }
/// ```
#[async_trait]
pub trait AdapterFactory: Send + Sync + 'static {
    /// Builds a new, not yet initialized adapter for `session_id`.
    async fn create(
        &self,
        session_id: &SessionId,
        artifacts: ArtifactScope,
        events: AdapterEvents,
    ) -> Result<Arc<dyn ClientAdapter>, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_broadcast_sender_is_detected() {
        let mut message = InboundMessage {
            id: "1".into(),
            from: STATUS_BROADCAST_SENDER.into(),
            body: "story".into(),
            has_attachment: false,
        };
        assert!(message.is_status_broadcast());

        message.from = "5216621234567@c.us".into();
        assert!(!message.is_status_broadcast());
    }

    #[tokio::test]
    async fn test_adapter_events_stamp_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = AdapterEvents::new(7, tx);

        assert!(events.emit(AdapterEvent::Ready));
        assert_eq!(rx.recv().await, Some((7, AdapterEvent::Ready)));
    }

    #[test]
    fn test_adapter_events_emit_after_handle_gone_returns_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = AdapterEvents::new(1, tx);
        drop(rx);
        assert!(!events.emit(AdapterEvent::Disconnected("gone".into())));
    }
}
