use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::entity::{EntityId, EntityStatus};

#[derive(Error, Debug)]
pub enum StudyflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("No authenticated user")]
    NotAuthenticated,

    #[error("Entity {entity_id} is {status} and cannot be retried")]
    NotRetryable {
        entity_id: EntityId,
        status: EntityStatus,
    },

    #[error("Entity {0} is not tracked")]
    UnknownEntity(EntityId),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Coarse classification of a [`JobError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorKind {
    Timeout,
    NetworkError,
    Permanent,
}

/// Outcome of a failed job submission.
///
/// `Timeout` and `Network` say nothing about the job itself: it may still be
/// running server-side. Only `Permanent` is a confirmed failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Submission for {entity_id} timed out after {}s", .after.as_secs())]
    Timeout { entity_id: EntityId, after: Duration },

    #[error("Network error submitting {entity_id}: {message}")]
    Network { entity_id: EntityId, message: String },

    #[error("Job for {entity_id} failed: {message}")]
    Permanent { entity_id: EntityId, message: String },
}

impl JobError {
    pub fn kind(&self) -> JobErrorKind {
        match self {
            JobError::Timeout { .. } => JobErrorKind::Timeout,
            JobError::Network { .. } => JobErrorKind::NetworkError,
            JobError::Permanent { .. } => JobErrorKind::Permanent,
        }
    }

    /// True when time (a later push event or foreground scan) may resolve it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, JobError::Permanent { .. })
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            JobError::Timeout { entity_id, .. }
            | JobError::Network { entity_id, .. }
            | JobError::Permanent { entity_id, .. } => entity_id,
        }
    }

    /// Maps a backend failure onto the submission error taxonomy.
    pub fn from_backend(entity_id: &EntityId, err: BackendError, timeout: Duration) -> Self {
        match err {
            BackendError::Timeout => JobError::Timeout {
                entity_id: entity_id.clone(),
                after: timeout,
            },
            e if e.is_transient() => JobError::Network {
                entity_id: entity_id.clone(),
                message: e.to_string(),
            },
            e => JobError::Permanent {
                entity_id: entity_id.clone(),
                message: e.user_message(),
            },
        }
    }
}

/// Push channel failures. Logged only, never surfaced as an entity failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Push channel unavailable: {0}")]
    Unavailable(String),

    #[error("Push channel error: {0}")]
    Channel(String),

    #[error("Push channel timed out")]
    TimedOut,

    #[error("Push channel closed by server")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StudyflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> EntityId {
        EntityId::new("nb-1")
    }

    #[test]
    fn test_backend_timeout_maps_to_timeout() {
        let err = JobError::from_backend(&id(), BackendError::Timeout, Duration::from_secs(60));
        assert_eq!(err.kind(), JobErrorKind::Timeout);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_network_maps_to_network_error() {
        let err = JobError::from_backend(
            &id(),
            BackendError::Network("connection refused".to_string()),
            Duration::from_secs(30),
        );
        assert_eq!(err.kind(), JobErrorKind::NetworkError);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_gateway_errors_are_network_class() {
        let err = JobError::from_backend(
            &id(),
            BackendError::Rejected {
                status: 503,
                message: "upstream unavailable".to_string(),
            },
            Duration::from_secs(30),
        );
        assert_eq!(err.kind(), JobErrorKind::NetworkError);
    }

    #[test]
    fn test_validation_error_is_permanent() {
        let err = JobError::from_backend(
            &id(),
            BackendError::Rejected {
                status: 422,
                message: "unsupported file type".to_string(),
            },
            Duration::from_secs(30),
        );
        assert_eq!(err.kind(), JobErrorKind::Permanent);
        assert!(!err.is_recoverable());
        match err {
            JobError::Permanent { message, .. } => assert_eq!(message, "unsupported file type"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
