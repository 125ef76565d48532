//! Push channels delivering per-entity `UPDATE` events.
//!
//! A channel is opened for one entity id and yields [`PushMessage`]s until
//! the server closes it or the [`PushStream`] is dropped.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::entity::{EntityId, UpdateEvent};
use crate::error::SubscriptionError;

pub mod hub;
pub mod polling;

pub use hub::{BroadcastPushHub, HubMessage};
pub use polling::PollingPushChannel;

/// One item delivered on a push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    Update(UpdateEvent),
    /// Channel-level problem. The stream may keep delivering afterwards.
    Error(SubscriptionError),
}

/// Receiving half of an open push channel.
///
/// Dropping the stream stops its producer task.
pub struct PushStream {
    rx: mpsc::Receiver<PushMessage>,
    producer: Option<AbortHandle>,
}

impl PushStream {
    pub fn new(rx: mpsc::Receiver<PushMessage>, producer: Option<AbortHandle>) -> Self {
        Self { rx, producer }
    }

    /// Next message, or `None` once the channel has closed.
    pub async fn recv(&mut self) -> Option<PushMessage> {
        self.rx.recv().await
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Opens subscription-scoped feeds of entity changes.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Opens a channel filtered to `UPDATE` events for `entity_id`.
    async fn open(&self, entity_id: &EntityId) -> Result<PushStream, SubscriptionError>;
}
