//! Client error types.

use electrum_protocol::RpcError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] electrum_protocol::ProtocolError),

    /// A request was attempted while the client was disconnected.
    #[error("connection lost")]
    ConnectionLost,

    /// The write path found no live transport (the handshake failed).
    #[error("not connected")]
    NotConnected,

    /// The connection closed while the request was outstanding.
    #[error("connection closed")]
    ClosedWhileInFlight,

    #[error("connect timeout")]
    Timeout,

    #[error("server error: {0}")]
    Server(RpcError),

    /// A response referenced ids with no pending request.
    #[error("protocol violation: no pending request for id(s) {ids:?}")]
    ProtocolViolation { ids: Vec<u64> },

    /// An inbound document could not be parsed or classified.
    #[error("malformed message #{sequence}: {reason}")]
    MalformedMessage { sequence: u64, reason: String },

    #[error("no response for batch member id {0}")]
    MissingBatchResponse(u64),

    #[error("request id {0} is already pending")]
    DuplicateId(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        ClientError::Server(err)
    }
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionLost => true,
            ClientError::NotConnected => true,
            ClientError::ClosedWhileInFlight => true,
            ClientError::TlsHandshake(_) => true,
            _ => false,
        }
    }

    /// Returns the underlying transport error, if this is one.
    pub fn as_transport(&self) -> Option<&std::io::Error> {
        match self {
            ClientError::Transport(e) => Some(e),
            _ => None,
        }
    }
}
