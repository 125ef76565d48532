//! In-process push hub built on a tokio broadcast channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{broadcast, mpsc};

use super::{PushChannel, PushMessage, PushStream};
use crate::entity::{EntityId, UpdateEvent};
use crate::error::SubscriptionError;

/// Default channel capacity.
const DEFAULT_CAPACITY: usize = 64;

/// Message fanned out to every open channel.
#[derive(Debug, Clone)]
pub enum HubMessage {
    Update(UpdateEvent),
    /// Error for one entity's channels, or all of them when `entity_id` is `None`.
    Error {
        entity_id: Option<EntityId>,
        error: SubscriptionError,
    },
    /// Server-side close for one entity's channels, or all of them.
    Close(Option<EntityId>),
}

impl HubMessage {
    pub fn into_update(self) -> Option<UpdateEvent> {
        match self {
            HubMessage::Update(event) => Some(event),
            _ => None,
        }
    }

    fn targets(target: &Option<EntityId>, id: &EntityId) -> bool {
        target.as_ref().map_or(true, |t| t == id)
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Broadcasts entity updates to per-entity channels.
///
/// Cloning is cheap; clones share the same underlying channel.
#[derive(Clone)]
pub struct BroadcastPushHub {
    sender: broadcast::Sender<HubMessage>,
    capacity: usize,
    available: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl BroadcastPushHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            available: Arc::new(AtomicBool::new(true)),
            opened: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publishes an update. Ignored if no channel is open.
    pub fn publish(&self, event: UpdateEvent) {
        let _ = self.sender.send(HubMessage::Update(event));
    }

    /// Reports a channel error to the channels of `entity_id` (or all).
    pub fn fail(&self, entity_id: Option<EntityId>, error: SubscriptionError) {
        let _ = self.sender.send(HubMessage::Error { entity_id, error });
    }

    /// Closes the channels of `entity_id` (or all) from the server side.
    pub fn close(&self, entity_id: Option<EntityId>) {
        let _ = self.sender.send(HubMessage::Close(entity_id));
    }

    /// While unavailable, `open` fails with [`SubscriptionError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Raw receiver of every hub message.
    pub fn raw_subscribe(&self) -> broadcast::Receiver<HubMessage> {
        self.sender.subscribe()
    }

    /// Total number of channels ever opened.
    pub fn channels_opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Number of channels whose forwarder is still running.
    pub fn active_channels(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for BroadcastPushHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl PushChannel for BroadcastPushHub {
    async fn open(&self, entity_id: &EntityId) -> Result<PushStream, SubscriptionError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(SubscriptionError::Unavailable(
                "push hub is not accepting subscriptions".to_string(),
            ));
        }

        let mut hub_rx = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = entity_id.clone();

        self.opened.fetch_add(1, Ordering::AcqRel);
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(Arc::clone(&self.active));

        let forwarder = tokio::spawn(async move {
            let _guard = guard;
            loop {
                let message = match hub_rx.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Push channel for {} lagged, skipped {} messages", id, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let outgoing = match message {
                    HubMessage::Update(event) if event.entity_id() == &id => {
                        PushMessage::Update(event)
                    }
                    HubMessage::Error { entity_id, error } if HubMessage::targets(&entity_id, &id) => {
                        PushMessage::Error(error)
                    }
                    HubMessage::Close(target) if HubMessage::targets(&target, &id) => {
                        let _ = tx.send(PushMessage::Error(SubscriptionError::Closed)).await;
                        break;
                    }
                    _ => continue,
                };

                if tx.send(outgoing).await.is_err() {
                    break;
                }
            }
            debug!("Push forwarder for {} stopped", id);
        });

        Ok(PushStream::new(rx, Some(forwarder.abort_handle())))
    }
}
