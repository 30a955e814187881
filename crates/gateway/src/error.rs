//! Gateway error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or unsupported client request. The message is sent back
    /// to the client in an error frame; the session stays open.
    #[error("{0}")]
    Protocol(String),

    /// Channel send error (the session's writer is gone).
    #[error("channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
