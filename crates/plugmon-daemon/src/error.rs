//! Error types for the plugmon daemon.

use plugmon_types::Envelope;

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] plugmon_core::Error),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] plugmon_rpc::CodecError),

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// A required request field is absent
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// A request field is present but unusable
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// No service matches the locator
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Handshake did not arrive in time
    #[error("Handshake timed out")]
    HandshakeTimeout,
}

impl DaemonError {
    pub(crate) fn invalid_field(field: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidField {
            field,
            reason: reason.to_string(),
        }
    }
}

impl From<DaemonError> for Envelope {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::InvalidParams(_)
            | DaemonError::MissingField(_)
            | DaemonError::InvalidField { .. }
            | DaemonError::Core(
                plugmon_core::Error::IdentityConflict
                | plugmon_core::Error::DuplicateConnection(_)
                | plugmon_core::Error::Decode(_),
            ) => Envelope::bad_request(err.to_string()),
            DaemonError::ServiceNotFound(_) => Envelope::not_found(err.to_string()),
            DaemonError::Io(_)
            | DaemonError::Json(_)
            | DaemonError::Core(_)
            | DaemonError::Codec(_)
            | DaemonError::HandshakeTimeout => Envelope::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_bad_requests() {
        let envelope = Envelope::from(DaemonError::MissingField("description"));
        assert_eq!(envelope.code, 400);
        assert!(envelope.msg.unwrap().contains("description"));

        let envelope = Envelope::from(DaemonError::invalid_field("level", "unknown level 'loud'"));
        assert_eq!(envelope.code, 400);
        assert!(envelope.msg.unwrap().contains("level"));
    }

    #[test]
    fn test_identity_conflict_is_bad_request() {
        let envelope = Envelope::from(DaemonError::Core(plugmon_core::Error::IdentityConflict));
        assert_eq!(envelope.code, 400);
    }

    #[test]
    fn test_duplicate_connection_is_bad_request() {
        let id = plugmon_types::ConnectionId::new();
        let envelope = Envelope::from(DaemonError::Core(
            plugmon_core::Error::DuplicateConnection(id),
        ));
        assert_eq!(envelope.code, 400);
        assert!(envelope.msg.unwrap().contains(&id.to_string()));
    }

    #[test]
    fn test_unknown_service_is_not_found() {
        let envelope = Envelope::from(DaemonError::ServiceNotFound("name/ghost".to_string()));
        assert_eq!(envelope.code, 404);
        assert!(envelope.msg.unwrap().contains("name/ghost"));
    }

    #[test]
    fn test_internal_errors() {
        let io = std::io::Error::other("disk on fire");
        let envelope = Envelope::from(DaemonError::from(io));
        assert_eq!(envelope.code, 500);
        assert!(!envelope.is_success());
    }
}
