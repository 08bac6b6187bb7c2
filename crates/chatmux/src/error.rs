//! Unified error type for chatmux.

use chatmux_protocol::ProtocolError;
use chatmux_session::SessionError;
use chatmux_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `chatmux` meta-crate you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant lets `?` convert sub-crate errors.
#[derive(Debug, thiserror::Error)]
pub enum ChatmuxError {
    /// An observer transport error (bind, accept, send).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A wire-level error (encode, decode, invalid session id).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (lifecycle, tokens, storage).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Binding or serving the control plane failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use chatmux_protocol::SessionId;

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let chatmux_err: ChatmuxError = err.into();
        assert!(matches!(chatmux_err, ChatmuxError::Transport(_)));
        assert!(chatmux_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidSessionId("a/b".into());
        let chatmux_err: ChatmuxError = err.into();
        assert!(matches!(chatmux_err, ChatmuxError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::NotFound(SessionId::new("ventas").unwrap());
        let chatmux_err: ChatmuxError = err.into();
        assert!(matches!(chatmux_err, ChatmuxError::Session(_)));
        assert!(chatmux_err.to_string().contains("ventas"));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let chatmux_err: ChatmuxError = err.into();
        assert!(matches!(chatmux_err, ChatmuxError::Io(_)));
    }
}
