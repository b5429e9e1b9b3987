//! Request-client-local errors (spec.md §4.3) and the engine's vsock/IO
//! error wrapper, grounded on `capsa_net::error::NetError`'s small
//! per-subsystem `thiserror` enum.

use vmbridge_core::TransportError;

/// Errors returned by a single [`crate::client::RequestClient`] call.
/// Local to the call: the caller decides what to do (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("no content")]
    NoContent,

    #[error("invalid response: {0}")]
    InvalidResponse(u16),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("guest error: {0}")]
    GuestError(String),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ClientError::Timeout,
            TransportError::ConnectFailed(reason) => ClientError::ConnectionFailed(reason),
            TransportError::Closed => ClientError::ConnectionFailed("connection closed".into()),
            other => ClientError::ConnectionFailed(other.to_string()),
        }
    }
}

/// Errors surfaced by the port-forward / event-stream machinery that
/// aren't tied to a single request/response call.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(String),
}
