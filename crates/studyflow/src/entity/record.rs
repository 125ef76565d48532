//! Entity records as delivered by the backend, and the UI-facing projection.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::status::EntityStatus;

// ─── Identifiers ────────────────────────────────────────────────────────────

/// Opaque entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of the user owning an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ─── Record ─────────────────────────────────────────────────────────────────

/// Kind of study material the entity was created from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Document,
    Audio,
    Image,
    WebPage,
}

/// Job progress counters reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    /// Completion percentage, 0–100.
    #[serde(default)]
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_units: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_units: Option<u32>,
}

/// Fields produced by extraction, present from `preview_ready` onwards.
///
/// Always replaced as a whole, never merged field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPayload {
    pub title: String,
    pub source_kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_text: Option<String>,
    /// Section headings derived from the extracted content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<String>,
}

/// Authoritative entity row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: EntityId,
    pub owner_id: UserId,
    pub status: EntityStatus,
    /// Last authoritative status change, set by the backend only.
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EntityPayload>,
}

impl EntityRecord {
    pub fn new(
        id: impl Into<EntityId>,
        owner_id: UserId,
        status: EntityStatus,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id,
            status,
            updated_at,
            progress: JobProgress::default(),
            error_message: None,
            payload: None,
        }
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_payload(mut self, payload: EntityPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Returns true if the record sits in `extracting` for longer than `threshold`.
    pub fn is_stuck(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status == EntityStatus::Extracting && now - self.updated_at > threshold
    }

    /// Projects the record into the shape the presentation layer consumes.
    pub fn job_status(&self) -> ProcessingJobStatus {
        let progress = match self.status {
            EntityStatus::Ready => 100,
            _ => self.progress.percent.min(100),
        };
        let error_message = match self.status {
            EntityStatus::Failed => Some(
                self.error_message
                    .clone()
                    .unwrap_or_else(|| "Processing failed".to_string()),
            ),
            _ => None,
        };

        ProcessingJobStatus {
            status: self.status,
            progress,
            progress_message: self.progress.message.clone(),
            processed_units: self.progress.processed_units,
            estimated_units: self.progress.estimated_units,
            error_message,
        }
    }
}

/// UI-facing projection of an entity's processing job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJobStatus {
    pub status: EntityStatus,
    /// 0–100. Meaningless once the status is terminal.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_units: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_units: Option<u32>,
    /// Only populated when `status == failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProcessingJobStatus {
    /// True while the UI should show the "processing" state.
    pub fn is_processing(&self) -> bool {
        self.status.is_in_flight()
    }

    /// Only failed jobs can be retried by the user.
    pub fn can_retry(&self) -> bool {
        self.status == EntityStatus::Failed
    }
}

/// A push-channel `UPDATE` event for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEvent {
    pub old: EntityRecord,
    pub new: EntityRecord,
}

impl UpdateEvent {
    pub fn new(old: EntityRecord, new: EntityRecord) -> Self {
        Self { old, new }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.new.id
    }
}
