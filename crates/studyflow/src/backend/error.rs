//! Backend error types.

use thiserror::Error;

use crate::entity::EntityId;

/// Errors returned by a [`JobBackend`](super::JobBackend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Connection refused, DNS failure, or any transport-level exception.
    #[error("Network error: {0}")]
    Network(String),

    /// The transport gave up waiting for a response.
    #[error("Request timed out")]
    Timeout,

    /// The endpoint answered with a non-success status.
    #[error("Backend rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    #[error("Failed to decode backend response: {0}")]
    Decode(String),

    #[error("Invalid backend configuration: {0}")]
    Config(String),
}

impl BackendError {
    /// Returns true if the error is likely transient and the job may still be alive.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Network(_) | BackendError::Timeout => true,
            BackendError::Rejected { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }

    /// Message suitable for an entity's `errorMessage` field.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Rejected { message, .. } if !message.is_empty() => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Network("dns".to_string()).is_transient());
        assert!(BackendError::Timeout.is_transient());
        assert!(BackendError::Rejected {
            status: 504,
            message: String::new()
        }
        .is_transient());
        assert!(!BackendError::Rejected {
            status: 400,
            message: "bad".to_string()
        }
        .is_transient());
        assert!(!BackendError::NotFound(EntityId::new("x")).is_transient());
    }

    #[test]
    fn test_user_message_prefers_server_text() {
        let err = BackendError::Rejected {
            status: 422,
            message: "File too large".to_string(),
        };
        assert_eq!(err.user_message(), "File too large");

        let empty = BackendError::Rejected {
            status: 500,
            message: String::new(),
        };
        assert!(empty.user_message().contains("500"));
    }
}
