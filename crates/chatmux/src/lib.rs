//! # chatmux
//!
//! Run many chat-protocol client sessions in one process.
//!
//! Each session is keyed by a caller-chosen id and owns one protocol
//! client behind the [`ClientAdapter`](chatmux_session::ClientAdapter)
//! seam. chatmux drives its lifecycle (challenge, ready, reconnect,
//! close), persists its auth artifacts, mints per-session access tokens,
//! and pushes every event to observers over a WebSocket channel. A small
//! HTTP control plane creates, closes and sends through sessions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatmux::prelude::*;
//!
//! # async fn run() -> Result<(), ChatmuxError> {
//! let server = ChatmuxServer::builder()
//!     .http_addr("0.0.0.0:3000")
//!     .events_addr("0.0.0.0:3001")
//!     .adapter_factory(Arc::new(LoopbackFactory::new()))
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
pub mod control;
mod error;
mod observer;
mod server;
mod telemetry;

pub use config::ServerConfig;
pub use error::ChatmuxError;
pub use server::{ChatmuxServer, ChatmuxServerBuilder};
pub use telemetry::init_tracing;

pub use chatmux_protocol as protocol;
pub use chatmux_session as session;
pub use chatmux_transport as transport;

/// The types most applications need.
pub mod prelude {
    pub use crate::control::{AttachmentRoute, build_control_plane};
    pub use crate::{
        ChatmuxError, ChatmuxServer, ChatmuxServerBuilder, ServerConfig, init_tracing,
    };
    pub use chatmux_protocol::{AttachmentRef, ChatId, ObserverCommand, SessionEvent, SessionId};
    pub use chatmux_session::loopback::{LoopbackAdapter, LoopbackFactory};
    pub use chatmux_session::{
        AdapterError, AdapterEvent, AdapterEvents, AdapterFactory, ArtifactScope,
        AttachmentPayload, AttachmentSink, AuthArtifactStore, ClientAdapter, HmacTokenIssuer,
        InboundMessage, MemoryArtifactStore, MemoryAttachmentSink, ReconnectPolicy,
        SessionConfig, SessionError, SessionHandle, SessionRegistry, SessionStatus, TokenIssuer,
    };
}
