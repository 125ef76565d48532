//! Test harness for isolated tracker execution.
//!
//! The `TestHarness` wires a `JobTracker` to an `InMemoryBackend` whose
//! writes are published on a `BroadcastPushHub`, with a signed-in user.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use studyflow::{
    BroadcastPushHub, CacheChange, EntityId, EntityRecord, InMemoryBackend, JobStatusCache,
    JobTracker, ProcessingJobStatus, Session, TrackerSettings, UserId,
};
use tokio::sync::broadcast;

use super::builders::OWNER;

pub struct TestHarness {
    pub hub: BroadcastPushHub,
    pub backend: Arc<InMemoryBackend>,
    pub cache: Arc<JobStatusCache>,
    pub session: Arc<Session>,
    pub tracker: Arc<JobTracker>,
    /// Every status passed to the update callback, in order.
    pub updates: Arc<Mutex<Vec<ProcessingJobStatus>>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(TrackerSettings::default())
    }

    pub fn with_settings(settings: TrackerSettings) -> Self {
        let hub = BroadcastPushHub::new(64);
        let backend = Arc::new(InMemoryBackend::with_push_hub(hub.clone()));
        let cache = Arc::new(JobStatusCache::new());
        let session = Arc::new(Session::signed_in(UserId::new(OWNER)));
        let updates = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&updates);
        let tracker = JobTracker::new(
            backend.clone(),
            Arc::new(hub.clone()),
            Arc::clone(&cache),
            Arc::clone(&session),
            settings,
        )
        .with_update_callback(Arc::new(move |status: &ProcessingJobStatus| {
            sink.lock().unwrap().push(status.clone());
        }));

        Self {
            hub,
            backend,
            cache,
            session,
            tracker: Arc::new(tracker),
            updates,
        }
    }

    /// Puts `record` in both the backend and the cache.
    pub fn seed(&self, record: EntityRecord) -> EntityId {
        let id = record.id.clone();
        self.backend.upsert(record.clone());
        self.cache.apply(record);
        id
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.cache.subscribe()
    }

    pub fn cached(&self, id: &EntityId) -> EntityRecord {
        self.cache.get(id).expect("entity not cached")
    }
}

/// Polls `condition` until it holds, panicking after about two seconds.
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Lets spawned tasks run for a while.
pub async fn settle() {
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drains every change received so far.
pub fn drain(rx: &mut broadcast::Receiver<CacheChange>) -> Vec<CacheChange> {
    let mut changes = Vec::new();
    while let Ok(change) = rx.try_recv() {
        changes.push(change);
    }
    changes
}
