//! Client error types.

use thiserror::Error;

/// Failures reported by a [`Transport`](crate::transport::Transport).
///
/// Payloads are strings so a single outcome can be handed to every caller
/// waiting on the same teardown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("failed to send: {0}")]
    Send(String),

    #[error("failed to receive: {0}")]
    Receive(String),

    #[error("failed to close: {0}")]
    Close(String),

    #[error("transport is not connected")]
    NotConnected,
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] hubwire_protocol::ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("timed out waiting for the server to respond to the handshake message")]
    HandshakeTimeout,

    #[error("received an error during handshake: {0}")]
    Handshake(String),

    /// The hub method failed; carries the server's error text.
    #[error("{0}")]
    Hub(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("{0}")]
    Configuration(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("server timeout elapsed without receiving a message from the server")]
    ServerTimeout,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::HandshakeTimeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::ServerTimeout => true,
            ClientError::Protocol(e) => e.is_framing(),
            _ => false,
        }
    }
}
