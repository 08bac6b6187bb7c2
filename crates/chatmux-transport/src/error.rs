use std::net::SocketAddr;

/// Errors that can occur on the observer transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending a frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receiving a frame failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Binding the listener or accepting a TCP connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The peer connected but the WebSocket upgrade failed.
    #[error("websocket handshake with {0} failed: {1}")]
    Handshake(SocketAddr, String),
}
