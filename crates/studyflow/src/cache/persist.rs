//! Conversions between cache entries and `entity_status` rows.

use chrono::{DateTime, Utc};

use super::{CachedEntity, Origin};
use crate::db::status_repo::StatusRow;
use crate::db::DatabaseError;
use crate::entity::EntityRecord;

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_timestamp(s: &str, id: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            log::warn!("Ignoring malformed timestamp '{}' for {}: {}", s, id, e);
            None
        }
    }
}

pub(super) fn to_row(entry: &CachedEntity) -> Result<StatusRow, DatabaseError> {
    let record = &entry.record;
    let (optimistic, optimistic_after) = match entry.origin {
        Origin::Authoritative => (false, None),
        Origin::Optimistic { after } => (true, after.map(format_timestamp)),
    };

    Ok(StatusRow {
        id: record.id.to_string(),
        owner_id: record.owner_id.to_string(),
        status: record.status.as_str().to_string(),
        updated_at: format_timestamp(record.updated_at),
        record_json: serde_json::to_string(record)?,
        optimistic,
        optimistic_after,
    })
}

pub(super) fn from_row(row: &StatusRow) -> Result<CachedEntity, DatabaseError> {
    let record: EntityRecord = serde_json::from_str(&row.record_json)?;
    let origin = if row.optimistic {
        Origin::Optimistic {
            after: row
                .optimistic_after
                .as_deref()
                .and_then(|s| parse_timestamp(s, &row.id)),
        }
    } else {
        Origin::Authoritative
    };

    Ok(CachedEntity { record, origin })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityStatus, UserId};

    #[test]
    fn test_row_round_trip_keeps_origin() {
        let after = Utc::now();
        let entry = CachedEntity {
            record: EntityRecord::new("nb-1", UserId::new("user-1"), EntityStatus::Pending, after),
            origin: Origin::Optimistic { after: Some(after) },
        };

        let row = to_row(&entry).unwrap();
        assert!(row.optimistic);
        assert_eq!(row.status, "pending");

        let restored = from_row(&row).unwrap();
        assert_eq!(restored.record, entry.record);
        match restored.origin {
            Origin::Optimistic { after: Some(t) } => {
                assert_eq!(t.timestamp_micros(), after.timestamp_micros())
            }
            other => panic!("unexpected origin: {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_record_json_is_an_error() {
        let row = StatusRow {
            id: "nb-1".to_string(),
            owner_id: "user-1".to_string(),
            status: "pending".to_string(),
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
            record_json: "not json".to_string(),
            optimistic: false,
            optimistic_after: None,
        };
        assert!(matches!(
            from_row(&row),
            Err(DatabaseError::Serialization(_))
        ));
    }
}
