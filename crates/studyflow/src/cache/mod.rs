//! Last-known status of every tracked entity.
//!
//! [`JobStatusCache`] is the single source the presentation layer reads.
//! Writes follow a compare-and-swap discipline per entity id:
//!
//! - an authoritative write is accepted only if its `updated_at` is not older
//!   than the cached one and the status move is allowed;
//! - terminal entries never change status again;
//! - [`JobStatusCache::mark_submitted`] writes an optimistic `pending` for
//!   an entity that is untracked, `pending` or terminal. The first
//!   authoritative write after it is accepted unless it predates the last
//!   authoritative state seen before submission.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::db::{status_repo, Database, DatabaseError};
use crate::entity::{
    EntityId, EntityRecord, EntityStatus, JobProgress, ProcessingJobStatus, UserId,
};

mod persist;

/// Default capacity of the change notification channel.
const DEFAULT_CHANGE_CAPACITY: usize = 64;

/// Result of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Accepted, but the cached entry already held exactly this state.
    Unchanged,
    /// The incoming record is older than the cached one.
    Stale,
    IllegalTransition {
        from: EntityStatus,
        to: EntityStatus,
    },
    /// Status-only write for an entity the cache does not hold.
    NotTracked,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

/// Change notification for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Updated(EntityRecord),
    Removed(EntityId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Authoritative,
    /// Local `pending` written at submission. `after` is the last
    /// authoritative `updated_at` seen before it.
    Optimistic { after: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedEntity {
    record: EntityRecord,
    origin: Origin,
}

impl CachedEntity {
    fn authoritative(record: EntityRecord) -> Self {
        Self {
            record,
            origin: Origin::Authoritative,
        }
    }

    /// Checks the compare-and-swap rule for an incoming authoritative state.
    fn admit(&self, status: EntityStatus, updated_at: DateTime<Utc>) -> Result<(), WriteOutcome> {
        let stale = match self.origin {
            Origin::Authoritative => updated_at < self.record.updated_at,
            Origin::Optimistic { after } => after.map_or(false, |t| updated_at <= t),
        };
        if stale {
            return Err(WriteOutcome::Stale);
        }

        let from = self.record.status;
        if !from.can_transition_to(status) {
            return Err(WriteOutcome::IllegalTransition { from, to: status });
        }
        Ok(())
    }

    /// Progress percent never decreases while the job stays in flight.
    fn merge_progress(&self, status: EntityStatus, incoming: &JobProgress) -> JobProgress {
        let mut progress = incoming.clone();
        if self.origin == Origin::Authoritative
            && self.record.status.is_in_flight()
            && status.is_in_flight()
        {
            progress.percent = progress.percent.max(self.record.progress.percent);
        }
        progress
    }
}

enum Decision {
    Write(CachedEntity),
    Skip(WriteOutcome),
}

/// Injectable store of entity statuses.
pub struct JobStatusCache {
    entries: RwLock<HashMap<EntityId, CachedEntity>>,
    changes: broadcast::Sender<CacheChange>,
    database: Option<Database>,
}

impl JobStatusCache {
    pub fn new() -> Self {
        Self::with_change_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    pub fn with_change_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
            database: None,
        }
    }

    /// Persists every accepted write to `database`.
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    /// Loads the persisted snapshot. Entries already in memory win.
    ///
    /// Returns the number of entries loaded.
    pub fn load_from_database(&self) -> Result<usize, DatabaseError> {
        let Some(db) = &self.database else {
            return Ok(0);
        };

        let rows = status_repo::list_all(db)?;
        let mut entries = self.write_entries();
        let mut loaded = 0;
        for row in &rows {
            match persist::from_row(row) {
                Ok(entry) => {
                    if !entries.contains_key(&entry.record.id) {
                        entries.insert(entry.record.id.clone(), entry);
                        loaded += 1;
                    }
                }
                Err(e) => log::warn!("Skipping unreadable status row {}: {}", row.id, e),
            }
        }

        log::info!("Loaded {} cached statuses from database", loaded);
        Ok(loaded)
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<EntityId, CachedEntity>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Status cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<EntityId, CachedEntity>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Status cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn persist(&self, entry: &CachedEntity) {
        if let Some(db) = &self.database {
            let result = persist::to_row(entry).and_then(|row| status_repo::upsert(db, &row));
            if let Err(e) = result {
                log::error!("Failed to persist status of {}: {}", entry.record.id, e);
            }
        }
    }

    fn write_with<F>(&self, id: &EntityId, decide: F) -> WriteOutcome
    where
        F: FnOnce(Option<&CachedEntity>) -> Decision,
    {
        let mut entries = self.write_entries();
        let entry = match decide(entries.get(id)) {
            Decision::Skip(outcome) => return outcome,
            Decision::Write(entry) => entry,
        };

        if entries.get(id) == Some(&entry) {
            return WriteOutcome::Unchanged;
        }

        self.persist(&entry);
        let record = entry.record.clone();
        entries.insert(id.clone(), entry);
        drop(entries);

        let _ = self.changes.send(CacheChange::Updated(record));
        WriteOutcome::Applied
    }

    // ─── Writes ─────────────────────────────────────────────────────────────

    /// Authoritative write of a full record.
    ///
    /// The cached payload is kept when the incoming record carries none;
    /// otherwise it is replaced as a whole.
    pub fn apply(&self, record: EntityRecord) -> WriteOutcome {
        let id = record.id.clone();
        self.write_with(&id, |current| {
            let Some(current) = current else {
                return Decision::Write(CachedEntity::authoritative(record));
            };
            if let Err(outcome) = current.admit(record.status, record.updated_at) {
                return Decision::Skip(outcome);
            }

            let mut next = record;
            next.progress = current.merge_progress(next.status, &next.progress);
            if next.payload.is_none() {
                next.payload = current.record.payload.clone();
            }
            Decision::Write(CachedEntity::authoritative(next))
        })
    }

    /// Authoritative status-only write; every other field is kept.
    pub fn apply_status(
        &self,
        id: &EntityId,
        status: EntityStatus,
        updated_at: DateTime<Utc>,
    ) -> WriteOutcome {
        self.write_with(id, |current| {
            let Some(current) = current else {
                return Decision::Skip(WriteOutcome::NotTracked);
            };
            if let Err(outcome) = current.admit(status, updated_at) {
                return Decision::Skip(outcome);
            }

            let mut next = current.record.clone();
            next.status = status;
            next.updated_at = updated_at;
            Decision::Write(CachedEntity::authoritative(next))
        })
    }

    /// Write of a full re-fetch result.
    ///
    /// A record at least as new replaces status and payload together. An
    /// older one still replaces the payload, keeping the newer cached status,
    /// unless that status is terminal.
    pub fn apply_refetch(&self, record: EntityRecord) -> WriteOutcome {
        let id = record.id.clone();
        self.write_with(&id, |current| {
            let Some(current) = current else {
                return Decision::Write(CachedEntity::authoritative(record));
            };

            match current.admit(record.status, record.updated_at) {
                Ok(()) => {
                    let mut next = record;
                    next.progress = current.merge_progress(next.status, &next.progress);
                    Decision::Write(CachedEntity::authoritative(next))
                }
                Err(WriteOutcome::Stale) if current.record.status.is_terminal() => {
                    Decision::Skip(WriteOutcome::Stale)
                }
                Err(WriteOutcome::Stale) => {
                    let mut entry = current.clone();
                    entry.record.payload = record.payload;
                    Decision::Write(entry)
                }
                Err(outcome) => Decision::Skip(outcome),
            }
        })
    }

    /// Optimistic `pending` write following a user-initiated submission.
    ///
    /// Progress and error are reset; the payload is kept. An entity already
    /// past `pending` and still in flight keeps its status.
    pub fn mark_submitted(&self, id: &EntityId, owner: UserId) -> WriteOutcome {
        self.write_with(id, |current| {
            if let Some(c) = current {
                let from = c.record.status;
                if from != EntityStatus::Pending && !from.is_terminal() {
                    return Decision::Skip(WriteOutcome::IllegalTransition {
                        from,
                        to: EntityStatus::Pending,
                    });
                }
            }

            let after = current.and_then(|c| match c.origin {
                Origin::Authoritative => Some(c.record.updated_at),
                Origin::Optimistic { after } => after,
            });

            let mut record = EntityRecord::new(id.clone(), owner, EntityStatus::Pending, Utc::now());
            record.payload = current.and_then(|c| c.record.payload.clone());
            Decision::Write(CachedEntity {
                record,
                origin: Origin::Optimistic { after },
            })
        })
    }

    /// Removes an entity after explicit user deletion.
    pub fn remove(&self, id: &EntityId) -> Option<EntityRecord> {
        let removed = self.write_entries().remove(id)?;

        if let Some(db) = &self.database {
            if let Err(e) = status_repo::delete(db, id.as_str()) {
                log::error!("Failed to delete persisted status of {}: {}", id, e);
            }
        }

        let _ = self.changes.send(CacheChange::Removed(id.clone()));
        Some(removed.record)
    }

    // ─── Reads ──────────────────────────────────────────────────────────────

    pub fn get(&self, id: &EntityId) -> Option<EntityRecord> {
        self.read_entries().get(id).map(|e| e.record.clone())
    }

    /// UI-facing projection of one entity.
    pub fn job_status(&self, id: &EntityId) -> Option<ProcessingJobStatus> {
        self.read_entries().get(id).map(|e| e.record.job_status())
    }

    /// True while the entry holds an optimistic write.
    pub fn is_optimistic(&self, id: &EntityId) -> bool {
        self.read_entries()
            .get(id)
            .map_or(false, |e| matches!(e.origin, Origin::Optimistic { .. }))
    }

    /// All records, ordered by id.
    pub fn all(&self) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> =
            self.read_entries().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn tracked_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.read_entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }
}

impl Default for JobStatusCache {
    fn default() -> Self {
        Self::new()
    }
}
