//! Remote processing backend.
//!
//! The tracker talks to the backend through [`JobBackend`]: job submission,
//! full entity re-fetch, the stuck-entity status query, and the `failed`
//! write issued after a permanent error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityId, EntityRecord, UserId};

pub mod error;
pub mod http;
pub mod memory;

pub use error::BackendError;
pub use http::HttpBackend;
pub use memory::{InMemoryBackend, SubmitBehavior};

/// Body of a job submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub entity_id: EntityId,
    /// Sent as a header, not in the body.
    #[serde(skip)]
    pub correlation_id: Uuid,
}

/// Response of the job submission endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmitResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: None,
        }
    }
}

/// Remote operations the tracker depends on.
///
/// Submission must be safe to re-invoke for a job that is already running;
/// the tracker relies on the backend treating duplicates as no-ops.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Invokes the extraction endpoint for one entity.
    async fn submit_job(&self, request: &SubmitRequest) -> Result<SubmitResponse, BackendError>;

    /// Fetches the full entity, payload included.
    async fn fetch_entity(&self, id: &EntityId) -> Result<EntityRecord, BackendError>;

    /// Lists the owner's `extracting` entities last updated before `updated_before`.
    async fn list_stuck(
        &self,
        owner: &UserId,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>, BackendError>;

    /// Writes `status = failed` with the given message and returns the new row.
    async fn mark_failed(&self, id: &EntityId, message: &str)
        -> Result<EntityRecord, BackendError>;
}
