//! Error types for the plugmon-rpc crate.

use crate::transport::CodecError;

/// Errors that can occur with the plugin and control clients
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Rejected by daemon ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
