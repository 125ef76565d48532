//! Job submission bounded by a timeout race.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::backend::{JobBackend, SubmitRequest};
use crate::entity::EntityId;
use crate::error::JobError;

/// Which deadline a submission races against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// User-initiated submission or retry.
    Fresh,
    /// Re-submission by the foreground recovery scanner.
    Recovery,
}

/// Accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub entity_id: EntityId,
    pub correlation_id: Uuid,
    pub accepted: bool,
    pub submitted_at: DateTime<Utc>,
}

/// Invokes the extraction endpoint for one entity.
///
/// Never touches the status cache. The backend is expected to push the
/// resulting status change.
pub struct ProcessingJobClient {
    backend: Arc<dyn JobBackend>,
    fresh_timeout: Duration,
    recovery_timeout: Duration,
}

impl ProcessingJobClient {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        fresh_timeout: Duration,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            fresh_timeout,
            recovery_timeout,
        }
    }

    pub fn timeout_for(&self, mode: SubmitMode) -> Duration {
        match mode {
            SubmitMode::Fresh => self.fresh_timeout,
            SubmitMode::Recovery => self.recovery_timeout,
        }
    }

    /// Submits the job for `entity_id`.
    ///
    /// When the deadline wins, the request future is dropped, so its late
    /// completion is never observed.
    pub async fn submit(&self, entity_id: &EntityId, mode: SubmitMode) -> Result<JobHandle, JobError> {
        let timeout = self.timeout_for(mode);
        let request = SubmitRequest {
            entity_id: entity_id.clone(),
            correlation_id: Uuid::new_v4(),
        };
        debug!(
            "Submitting {} ({:?}, correlation {}, timeout {}s)",
            entity_id,
            mode,
            request.correlation_id,
            timeout.as_secs()
        );

        let response = match tokio::time::timeout(timeout, self.backend.submit_job(&request)).await {
            Err(_) => {
                warn!(
                    "Submission of {} timed out after {}s (correlation {})",
                    entity_id,
                    timeout.as_secs(),
                    request.correlation_id
                );
                return Err(JobError::Timeout {
                    entity_id: entity_id.clone(),
                    after: timeout,
                });
            }
            Ok(Err(e)) => {
                let err = JobError::from_backend(entity_id, e, timeout);
                warn!("Submission of {} failed: {}", entity_id, err);
                return Err(err);
            }
            Ok(Ok(response)) => response,
        };

        if !response.accepted {
            let message = response
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "Submission was not accepted".to_string());
            warn!("Submission of {} not accepted: {}", entity_id, message);
            return Err(JobError::Permanent {
                entity_id: entity_id.clone(),
                message,
            });
        }

        Ok(JobHandle {
            entity_id: entity_id.clone(),
            correlation_id: request.correlation_id,
            accepted: true,
            submitted_at: Utc::now(),
        })
    }
}
