use plugmon_rpc::CodecError;
use plugmon_types::{ConnectionId, DecodeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Either a service id or a name is required")]
    IdentityConflict,

    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Queue capacity exceeded")]
    CapacityExceeded,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection {0} is already attached")]
    DuplicateConnection(ConnectionId),

    #[error("Connection is already running")]
    AlreadyRunning,
}

impl Error {
    pub fn handler(handler: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
