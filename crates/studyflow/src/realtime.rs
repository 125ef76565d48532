//! Realtime reconciliation of push events into the status cache.
//!
//! One push channel per subscribed entity. Each channel has a reader task
//! applying events in delivery order and a per-entity state machine
//! (`Idle` / `ReconcilingFullFetch`) guarding the single re-fetch triggered
//! when an entity enters `preview_ready`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::backend::JobBackend;
use crate::cache::{JobStatusCache, WriteOutcome};
use crate::entity::{EntityId, EntityRecord, ProcessingJobStatus, Transition, UpdateEvent};
use crate::error::SubscriptionError;
use crate::push::{PushChannel, PushMessage, PushStream};

/// Called with the new projection after every accepted cache write.
pub type UpdateCallback = Arc<dyn Fn(&ProcessingJobStatus) + Send + Sync>;

/// Reconciliation state of one subscribed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Idle,
    ReconcilingFullFetch,
}

/// Result of [`RealtimeReconciler::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Opened,
    /// A live channel already exists; nothing was opened.
    AlreadySubscribed,
    /// `unsubscribe` was called while the channel was opening.
    Cancelled,
}

struct Subscription {
    alive: Arc<AtomicBool>,
    state: Arc<Mutex<ReconcileState>>,
    reader: JoinHandle<()>,
}

impl Subscription {
    fn is_live(&self) -> bool {
        !self.reader.is_finished()
    }

    fn close(self) {
        self.alive.store(false, Ordering::Release);
        self.reader.abort();
    }
}

enum Slot {
    Opening { alive: Arc<AtomicBool> },
    Active(Subscription),
}

impl Slot {
    fn is_live(&self) -> bool {
        match self {
            Slot::Opening { .. } => true,
            Slot::Active(sub) => sub.is_live(),
        }
    }

    fn close(self) {
        match self {
            Slot::Opening { alive } => alive.store(false, Ordering::Release),
            Slot::Active(sub) => sub.close(),
        }
    }
}

fn lock_state(state: &Mutex<ReconcileState>) -> MutexGuard<'_, ReconcileState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Reconcile state lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

struct Shared {
    cache: Arc<JobStatusCache>,
    backend: Arc<dyn JobBackend>,
    channel: Arc<dyn PushChannel>,
    refetch_timeout: Duration,
}

impl Shared {
    fn notify(&self, id: &EntityId, outcome: WriteOutcome, on_update: &UpdateCallback) {
        if !outcome.is_applied() {
            debug!("Write for {} not applied: {:?}", id, outcome);
            return;
        }
        if let Some(status) = self.cache.job_status(id) {
            on_update(&status);
        }
    }

    fn handle_event(
        self: &Arc<Self>,
        id: &EntityId,
        event: UpdateEvent,
        alive: &Arc<AtomicBool>,
        state: &Arc<Mutex<ReconcileState>>,
        on_update: &UpdateCallback,
    ) {
        if event.entity_id() != id {
            debug!("Ignoring event for {} on channel of {}", event.entity_id(), id);
            return;
        }

        let span = tracing::debug_span!("reconcile", entity_id = %id);
        let _entered = span.enter();

        let pushed = event.new;
        let mut current = lock_state(state);

        if *current == ReconcileState::ReconcilingFullFetch {
            drop(current);
            debug!("Re-fetch of {} in flight, applying pushed status only", id);
            let outcome = self.cache.apply_status(id, pushed.status, pushed.updated_at);
            self.notify(id, outcome, on_update);
            return;
        }

        let from = self
            .cache
            .get(id)
            .map(|r| r.status)
            .unwrap_or(event.old.status);

        match Transition::classify(from, pushed.status) {
            Transition::Rejected { from, to } => {
                drop(current);
                debug!("Ignoring {} -> {} for {}", from, to, id);
            }
            Transition::NeedsRefetch { from } => {
                *current = ReconcileState::ReconcilingFullFetch;
                drop(current);
                info!("{} moved {} -> preview_ready, re-fetching", id, from);
                self.spawn_refetch(
                    id.clone(),
                    pushed,
                    Arc::clone(alive),
                    Arc::clone(state),
                    Arc::clone(on_update),
                );
            }
            Transition::Progress { .. } | Transition::Advance { .. } | Transition::Terminal { .. } => {
                drop(current);
                let outcome = self.cache.apply(pushed);
                self.notify(id, outcome, on_update);
            }
        }
    }

    fn spawn_refetch(
        self: &Arc<Self>,
        id: EntityId,
        pushed: EntityRecord,
        alive: Arc<AtomicBool>,
        state: Arc<Mutex<ReconcileState>>,
        on_update: UpdateCallback,
    ) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result =
                tokio::time::timeout(shared.refetch_timeout, shared.backend.fetch_entity(&id)).await;

            if !alive.load(Ordering::Acquire) {
                debug!("Discarding re-fetch of {}: no longer subscribed", id);
                *lock_state(&state) = ReconcileState::Idle;
                return;
            }

            let outcome = match result {
                Ok(Ok(record)) if record.id == id => shared.cache.apply_refetch(record),
                Ok(Ok(record)) => {
                    warn!("Re-fetch of {} returned entity {}, ignoring", id, record.id);
                    shared.cache.apply(EntityRecord {
                        payload: None,
                        ..pushed
                    })
                }
                Ok(Err(e)) => {
                    warn!("Re-fetch of {} failed, keeping pushed status: {}", id, e);
                    shared.cache.apply(EntityRecord {
                        payload: None,
                        ..pushed
                    })
                }
                Err(_) => {
                    warn!(
                        "Re-fetch of {} timed out after {}s, keeping pushed status",
                        id,
                        shared.refetch_timeout.as_secs()
                    );
                    shared.cache.apply(EntityRecord {
                        payload: None,
                        ..pushed
                    })
                }
            };

            *lock_state(&state) = ReconcileState::Idle;
            shared.notify(&id, outcome, &on_update);
        });
    }
}

async fn run_reader(
    shared: Arc<Shared>,
    id: EntityId,
    mut stream: PushStream,
    alive: Arc<AtomicBool>,
    state: Arc<Mutex<ReconcileState>>,
    on_update: UpdateCallback,
) {
    while let Some(message) = stream.recv().await {
        if !alive.load(Ordering::Acquire) {
            break;
        }
        match message {
            PushMessage::Update(event) => {
                shared.handle_event(&id, event, &alive, &state, &on_update)
            }
            PushMessage::Error(SubscriptionError::Closed) => {
                info!("Push channel for {} closed by server", id);
                break;
            }
            PushMessage::Error(e) => warn!("Push channel for {}: {}", id, e),
        }
    }
    debug!("Push reader for {} stopped", id);
}

/// Keeps the cache in sync with per-entity push channels.
pub struct RealtimeReconciler {
    shared: Arc<Shared>,
    subscriptions: Mutex<HashMap<EntityId, Slot>>,
}

impl RealtimeReconciler {
    pub fn new(
        cache: Arc<JobStatusCache>,
        backend: Arc<dyn JobBackend>,
        channel: Arc<dyn PushChannel>,
        refetch_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                backend,
                channel,
                refetch_timeout,
            }),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<EntityId, Slot>> {
        match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Subscription table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Opens a push channel for `id` unless a live one already exists.
    ///
    /// A channel that was closed by the server is re-opened.
    pub async fn subscribe(
        &self,
        id: &EntityId,
        on_update: UpdateCallback,
    ) -> Result<SubscribeOutcome, SubscriptionError> {
        let alive = {
            let mut subscriptions = self.lock_subscriptions();
            if subscriptions.get(id).map_or(false, Slot::is_live) {
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }
            let alive = Arc::new(AtomicBool::new(true));
            let previous = subscriptions.insert(
                id.clone(),
                Slot::Opening {
                    alive: Arc::clone(&alive),
                },
            );
            if let Some(previous) = previous {
                previous.close();
            }
            alive
        };

        let stream = match self.shared.channel.open(id).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not open push channel for {}: {}", id, e);
                let mut subscriptions = self.lock_subscriptions();
                if matches!(subscriptions.get(id), Some(Slot::Opening { alive: a }) if Arc::ptr_eq(a, &alive))
                {
                    subscriptions.remove(id);
                }
                return Err(e);
            }
        };

        let mut subscriptions = self.lock_subscriptions();
        let still_wanted = matches!(
            subscriptions.get(id),
            Some(Slot::Opening { alive: a }) if Arc::ptr_eq(a, &alive)
        );
        if !still_wanted {
            debug!("Unsubscribed from {} while opening, dropping channel", id);
            return Ok(SubscribeOutcome::Cancelled);
        }

        let state = Arc::new(Mutex::new(ReconcileState::Idle));
        let reader = tokio::spawn(run_reader(
            Arc::clone(&self.shared),
            id.clone(),
            stream,
            Arc::clone(&alive),
            Arc::clone(&state),
            on_update,
        ));
        subscriptions.insert(
            id.clone(),
            Slot::Active(Subscription {
                alive,
                state,
                reader,
            }),
        );

        info!("Subscribed to push updates for {}", id);
        Ok(SubscribeOutcome::Opened)
    }

    /// Closes the channel for `id`. In-flight re-fetches finish but do not
    /// write. Returns false if there was nothing to close.
    pub fn unsubscribe(&self, id: &EntityId) -> bool {
        let slot = self.lock_subscriptions().remove(id);
        match slot {
            Some(slot) => {
                slot.close();
                info!("Unsubscribed from push updates for {}", id);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, id: &EntityId) -> bool {
        self.lock_subscriptions()
            .get(id)
            .map_or(false, Slot::is_live)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock_subscriptions()
            .values()
            .filter(|slot| slot.is_live())
            .count()
    }

    pub fn reconcile_state(&self, id: &EntityId) -> Option<ReconcileState> {
        match self.lock_subscriptions().get(id)? {
            Slot::Active(sub) => Some(*lock_state(&sub.state)),
            Slot::Opening { .. } => Some(ReconcileState::Idle),
        }
    }

    /// Closes every channel.
    pub fn unsubscribe_all(&self) {
        let slots: Vec<Slot> = self.lock_subscriptions().drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.close();
        }
    }
}

impl Drop for RealtimeReconciler {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
