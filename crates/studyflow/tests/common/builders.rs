//! Builders for entity records and push events.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};

use studyflow::entity::SourceKind;
use studyflow::{EntityPayload, EntityRecord, EntityStatus, JobProgress, UpdateEvent, UserId};

pub const OWNER: &str = "user-1";

/// Builder for `EntityRecord` instances owned by [`OWNER`].
pub struct RecordBuilder {
    record: EntityRecord,
}

impl RecordBuilder {
    pub fn new(id: &str, status: EntityStatus) -> Self {
        Self {
            record: EntityRecord::new(id, UserId::new(OWNER), status, Utc::now()),
        }
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.record.owner_id = UserId::new(owner);
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.updated_at = at;
        self
    }

    /// Sets `updated_at` to `minutes` in the past.
    pub fn minutes_ago(self, minutes: i64) -> Self {
        self.updated_at(Utc::now() - Duration::minutes(minutes))
    }

    pub fn percent(mut self, percent: u8) -> Self {
        self.record.progress = JobProgress {
            percent,
            ..JobProgress::default()
        };
        self
    }

    pub fn payload(mut self, title: &str) -> Self {
        self.record.payload = Some(payload(title));
        self
    }

    pub fn build(self) -> EntityRecord {
        self.record
    }
}

pub fn payload(title: &str) -> EntityPayload {
    EntityPayload {
        title: title.to_string(),
        source_kind: SourceKind::Document,
        summary: None,
        preview_text: None,
        sections: vec![],
    }
}

/// An update event moving `old` to `new`.
pub fn event(old: &EntityRecord, new: &EntityRecord) -> UpdateEvent {
    UpdateEvent::new(old.clone(), new.clone())
}
