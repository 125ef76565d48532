//! Status repository: CRUD for the `entity_status` table.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw status row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub id: String,
    pub owner_id: String,
    pub status: String,
    pub updated_at: String,
    /// Full `EntityRecord` as JSON.
    pub record_json: String,
    pub optimistic: bool,
    pub optimistic_after: Option<String>,
}

impl StatusRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            status: row.get("status")?,
            updated_at: row.get("updated_at")?,
            record_json: row.get("record_json")?,
            optimistic: row.get::<_, i64>("optimistic")? != 0,
            optimistic_after: row.get("optimistic_after")?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, owner_id, status, updated_at, record_json, optimistic, optimistic_after
     FROM entity_status";

/// Inserts a row or overwrites the existing one with the same id.
pub fn upsert(db: &Database, row: &StatusRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO entity_status
                (id, owner_id, status, updated_at, record_json, optimistic, optimistic_after)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                owner_id=excluded.owner_id, status=excluded.status,
                updated_at=excluded.updated_at, record_json=excluded.record_json,
                optimistic=excluded.optimistic, optimistic_after=excluded.optimistic_after",
            params![
                row.id,
                row.owner_id,
                row.status,
                row.updated_at,
                row.record_json,
                row.optimistic as i64,
                row.optimistic_after,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<StatusRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                StatusRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// All rows, ordered by id.
pub fn list_all(db: &Database) -> Result<Vec<StatusRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_COLUMNS))?;
        let rows = stmt
            .query_map([], StatusRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a row. Returns true if one existed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute("DELETE FROM entity_status WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    })
}

/// Row counts grouped by status, ordered by status name.
pub fn count_by_status(db: &Database) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM entity_status GROUP BY status ORDER BY status",
        )?;
        let counts = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    })
}
