//! Wire types for chatmux.
//!
//! This crate defines what the rest of the workspace agrees on:
//!
//! - **Identity** ([`SessionId`], [`ChatId`]) — who a session is and how a
//!   chat on the underlying protocol is addressed.
//! - **Events** ([`SessionEvent`], [`AttachmentRef`]) — what observers
//!   receive, and [`ObserverCommand`] — what they may send back.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how those become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (SessionEvent) → Session (lifecycle manager)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{AttachmentRef, ChatId, ObserverCommand, SessionEvent, SessionId};
