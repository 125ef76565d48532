//! In-process backend with fault injection.
//!
//! Used by the agent's offline mode and by tests. Every row mutation is
//! published to an optional [`BroadcastPushHub`] as an `UPDATE` event, the
//! same way a realtime database would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::Semaphore;

use super::{BackendError, JobBackend, SubmitRequest, SubmitResponse};
use crate::entity::{EntityId, EntityRecord, EntityStatus, UpdateEvent, UserId};
use crate::push::BroadcastPushHub;

/// How the backend answers a submission for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitBehavior {
    /// Accept; a `pending` or `failed` entity moves to `extracting`.
    Accept,
    /// Answer with a validation error (HTTP 422 equivalent).
    Reject(String),
    /// Answer `{accepted: false}` with a reason.
    NotAccepted(String),
    /// Fail at the transport level.
    NetworkDown,
    /// Wait before accepting.
    Delay(Duration),
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<EntityId, EntityRecord>,
    submit_behaviors: HashMap<EntityId, SubmitBehavior>,
    fetch_failures: HashSet<EntityId>,
    fetch_gate: Option<Arc<Semaphore>>,
    failure_write_gate: Option<Arc<Semaphore>>,
    submissions: Vec<EntityId>,
    fetches: HashMap<EntityId, usize>,
    failure_writes: Vec<(EntityId, String)>,
    fail_failure_writes: bool,
}

/// Backend that keeps rows in memory.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    hub: Option<BroadcastPushHub>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes every row change to `hub`.
    pub fn with_push_hub(hub: BroadcastPushHub) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            hub: Some(hub),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("In-memory backend lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn publish(&self, old: Option<EntityRecord>, new: &EntityRecord) {
        if let (Some(hub), Some(old)) = (&self.hub, old) {
            hub.publish(UpdateEvent::new(old, new.clone()));
        }
    }

    /// Inserts or replaces a row, publishing an update if it existed before.
    pub fn upsert(&self, record: EntityRecord) {
        let old = self.lock().records.insert(record.id.clone(), record.clone());
        self.publish(old, &record);
    }

    /// Changes a row's status, stamping a strictly newer `updated_at`.
    pub fn set_status(&self, id: &EntityId, status: EntityStatus) -> Option<EntityRecord> {
        let (old, new) = {
            let mut state = self.lock();
            let record = state.records.get_mut(id)?;
            let old = record.clone();
            record.status = status;
            record.updated_at = next_timestamp(old.updated_at);
            (old, record.clone())
        };
        self.publish(Some(old), &new);
        Some(new)
    }

    pub fn get(&self, id: &EntityId) -> Option<EntityRecord> {
        self.lock().records.get(id).cloned()
    }

    pub fn set_submit_behavior(&self, id: &EntityId, behavior: SubmitBehavior) {
        self.lock().submit_behaviors.insert(id.clone(), behavior);
    }

    /// Makes every re-fetch of `id` fail with a network error.
    pub fn fail_fetches(&self, id: &EntityId) {
        self.lock().fetch_failures.insert(id.clone());
    }

    /// Makes the `failed` write itself fail.
    pub fn fail_failure_writes(&self) {
        self.lock().fail_failure_writes = true;
    }

    /// Holds every re-fetch until a permit is added to the returned gate.
    pub fn gate_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().fetch_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Holds every `failed` write until a permit is added to the returned gate.
    pub fn gate_failure_writes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().failure_write_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Number of submissions received for `id`.
    pub fn submission_count(&self, id: &EntityId) -> usize {
        self.lock().submissions.iter().filter(|s| *s == id).count()
    }

    pub fn total_submissions(&self) -> usize {
        self.lock().submissions.len()
    }

    /// Number of re-fetches received for `id`.
    pub fn fetch_count(&self, id: &EntityId) -> usize {
        self.lock().fetches.get(id).copied().unwrap_or(0)
    }

    /// `failed` writes received, in order.
    pub fn failure_writes(&self) -> Vec<(EntityId, String)> {
        self.lock().failure_writes.clone()
    }
}

fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}

#[async_trait]
impl JobBackend for InMemoryBackend {
    async fn submit_job(&self, request: &SubmitRequest) -> Result<SubmitResponse, BackendError> {
        let behavior = {
            let mut state = self.lock();
            state.submissions.push(request.entity_id.clone());
            state
                .submit_behaviors
                .get(&request.entity_id)
                .cloned()
                .unwrap_or(SubmitBehavior::Accept)
        };

        match behavior {
            SubmitBehavior::Accept => {}
            SubmitBehavior::Reject(message) => {
                return Err(BackendError::Rejected {
                    status: 422,
                    message,
                })
            }
            SubmitBehavior::NotAccepted(message) => {
                return Ok(SubmitResponse {
                    accepted: false,
                    message: Some(message),
                })
            }
            SubmitBehavior::NetworkDown => {
                return Err(BackendError::Network("connection refused".to_string()))
            }
            SubmitBehavior::Delay(delay) => tokio::time::sleep(delay).await,
        }

        let restarts = self
            .get(&request.entity_id)
            .map(|r| matches!(r.status, EntityStatus::Pending | EntityStatus::Failed))
            .unwrap_or(false);
        if restarts {
            self.set_status(&request.entity_id, EntityStatus::Extracting);
        }

        Ok(SubmitResponse::accepted())
    }

    async fn fetch_entity(&self, id: &EntityId) -> Result<EntityRecord, BackendError> {
        let gate = {
            let mut state = self.lock();
            *state.fetches.entry(id.clone()).or_insert(0) += 1;
            state.fetch_gate.clone()
        };

        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let state = self.lock();
        if state.fetch_failures.contains(id) {
            return Err(BackendError::Network("fetch failed".to_string()));
        }
        state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.clone()))
    }

    async fn list_stuck(
        &self,
        owner: &UserId,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>, BackendError> {
        let mut records: Vec<EntityRecord> = self
            .lock()
            .records
            .values()
            .filter(|r| {
                r.owner_id == *owner
                    && r.status == EntityStatus::Extracting
                    && r.updated_at < updated_before
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn mark_failed(
        &self,
        id: &EntityId,
        message: &str,
    ) -> Result<EntityRecord, BackendError> {
        let gate = {
            let mut state = self.lock();
            state.failure_writes.push((id.clone(), message.to_string()));
            state.failure_write_gate.clone()
        };

        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let (old, new) = {
            let mut state = self.lock();
            if state.fail_failure_writes {
                return Err(BackendError::Network("write failed".to_string()));
            }
            let record = state
                .records
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(id.clone()))?;
            let old = record.clone();
            record.status = EntityStatus::Failed;
            record.error_message = Some(message.to_string());
            record.updated_at = next_timestamp(old.updated_at);
            (old, record.clone())
        };
        self.publish(Some(old), &new);
        Ok(new)
    }
}
