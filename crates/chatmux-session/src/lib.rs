//! Multi-session lifecycle management for chatmux.
//!
//! This crate owns everything between an HTTP request and a protocol
//! client:
//!
//! 1. **Registry**: one [`SessionHandle`] per session id
//!    ([`SessionRegistry`])
//! 2. **Lifecycle**: each handle's state machine, reconnects and token
//!    minting, run by an actor per session
//! 3. **Adapters**: the [`ClientAdapter`] / [`AdapterFactory`] seam to a
//!    concrete protocol client
//! 4. **Persistence**: auth artifacts ([`AuthArtifactStore`]) and inbound
//!    attachments ([`AttachmentSink`])
//! 5. **Fan-out**: session events to observers ([`EventBroadcaster`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Control plane / observer channel (above)  ← HTTP and WebSocket surfaces
//!     ↕
//! Session layer (this crate)  ← handles, adapters, tokens, storage
//!     ↕
//! Protocol layer (below)  ← SessionId, ChatId, SessionEvent
//! ```

mod adapter;
mod artifact;
mod attachment;
mod broadcast;
mod config;
mod error;
mod handle;
pub mod loopback;
mod pipeline;
mod registry;
mod token;

pub use adapter::{
    AdapterEvent, AdapterEvents, AdapterFactory, AttachmentPayload, ClientAdapter,
    InboundMessage, STATUS_BROADCAST_SENDER,
};
pub use artifact::{ArtifactScope, AuthArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use attachment::{
    ATTACHMENT_URL_PREFIX, AttachmentSink, FsAttachmentSink, MemoryAttachmentSink,
    StoredAttachment, attachment_file_name, extension_for,
};
pub use broadcast::EventBroadcaster;
pub use config::{DEFAULT_TIMEZONE, ReconnectPolicy, SessionConfig, SessionStatus, TokenRefresh};
pub use error::{AdapterError, SessionError};
pub use handle::{HandleSnapshot, SessionHandle};
pub use pipeline::{TIMESTAMP_FORMAT, local_timestamp};
pub use registry::{
    DEFAULT_ATTACHMENTS_DIR, DEFAULT_SESSIONS_DIR, SessionRegistry, SessionRegistryBuilder,
    SessionSummary,
};
pub use token::{AccessToken, HmacTokenIssuer, TokenClaims, TokenIssuer};
