//! Error types for the live subscription engine.

use thiserror::Error;

/// Main error type for subscription operations.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Malformed or incomplete client request.
    #[error("{0}")]
    BadRequest(String),

    /// Unknown resource type, missing record, or unknown request id.
    #[error("{0}")]
    NotFound(String),

    /// The principal may not see the target.
    #[error("{0}")]
    Forbidden(String),

    /// A resource collaborator (query, permission check, renderer) failed.
    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    #[error("Resource already registered: {0}")]
    DuplicateResource(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The client side of the connection is gone.
    #[error("Connection closed")]
    Disconnected,
}

impl LiveError {
    /// Status code reported to the client in an error frame.
    pub fn code(&self) -> u16 {
        match self {
            LiveError::BadRequest(_) => 400,
            LiveError::Forbidden(_) => 403,
            LiveError::NotFound(_) => 404,
            LiveError::Collaborator(_)
            | LiveError::DuplicateResource(_)
            | LiveError::Serialization(_)
            | LiveError::Disconnected => 500,
        }
    }

    /// Whether this error came from a client mistake rather than the server.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code())
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(e: serde_json::Error) -> Self {
        LiveError::Serialization(e.to_string())
    }
}

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, LiveError>;
