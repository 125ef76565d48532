//! Push channel emulated by polling the re-fetch endpoint.
//!
//! Emits an `UPDATE` whenever the polled row's status or `updatedAt`
//! changes. Polling stops once the entity reaches a terminal status or
//! disappears. A poll that misses its deadline counts as a transient error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::{PushChannel, PushMessage, PushStream};
use crate::backend::{BackendError, JobBackend};
use crate::entity::{EntityId, EntityRecord, UpdateEvent};
use crate::error::SubscriptionError;

/// Deadline of a single poll unless configured otherwise.
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling-based [`PushChannel`].
pub struct PollingPushChannel {
    backend: Arc<dyn JobBackend>,
    interval: Duration,
    capacity: usize,
    fetch_timeout: Duration,
}

impl PollingPushChannel {
    pub fn new(backend: Arc<dyn JobBackend>, interval: Duration, capacity: usize) -> Self {
        Self {
            backend,
            interval,
            capacity: capacity.max(1),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }
}

async fn fetch_within(
    backend: &dyn JobBackend,
    id: &EntityId,
    deadline: Duration,
) -> Result<EntityRecord, BackendError> {
    tokio::time::timeout(deadline, backend.fetch_entity(id))
        .await
        .unwrap_or(Err(BackendError::Timeout))
}

fn has_changed(last: &EntityRecord, current: &EntityRecord) -> bool {
    current.status != last.status || current.updated_at > last.updated_at
}

#[async_trait]
impl PushChannel for PollingPushChannel {
    async fn open(&self, entity_id: &EntityId) -> Result<PushStream, SubscriptionError> {
        let baseline = fetch_within(&*self.backend, entity_id, self.fetch_timeout)
            .await
            .map_err(|e| SubscriptionError::Unavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let backend = Arc::clone(&self.backend);
        let interval = self.interval;
        let fetch_timeout = self.fetch_timeout;
        let id = entity_id.clone();

        let producer = tokio::spawn(async move {
            let mut last = baseline;
            while !last.status.is_terminal() {
                tokio::time::sleep(interval).await;

                let message = match fetch_within(&*backend, &id, fetch_timeout).await {
                    Ok(current) if has_changed(&last, &current) => {
                        let event = UpdateEvent::new(last.clone(), current.clone());
                        last = current;
                        PushMessage::Update(event)
                    }
                    Ok(_) => continue,
                    Err(BackendError::NotFound(_)) => {
                        let _ = tx.send(PushMessage::Error(SubscriptionError::Closed)).await;
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        debug!("Polling {} failed transiently: {}", id, e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Polling {} failed: {}", id, e);
                        PushMessage::Error(SubscriptionError::Channel(e.to_string()))
                    }
                };

                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!("Stopped polling {}", id);
        });

        Ok(PushStream::new(rx, Some(producer.abort_handle())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::entity::{EntityStatus, UserId};
    use chrono::Utc;

    fn backend_with(id: &str, status: EntityStatus) -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::new());
        backend.upsert(EntityRecord::new(
            id,
            UserId::new("user-1"),
            status,
            Utc::now(),
        ));
        backend
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_update_on_status_change() {
        let backend = backend_with("nb-1", EntityStatus::Extracting);
        let channel = PollingPushChannel::new(backend.clone(), Duration::from_secs(5), 8);
        let mut stream = channel.open(&EntityId::new("nb-1")).await.unwrap();

        backend.set_status(&EntityId::new("nb-1"), EntityStatus::PreviewReady);

        match stream.recv().await {
            Some(PushMessage::Update(event)) => {
                assert_eq!(event.old.status, EntityStatus::Extracting);
                assert_eq!(event.new.status, EntityStatus::PreviewReady);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_terminal_status() {
        let backend = backend_with("nb-2", EntityStatus::Extracting);
        let channel = PollingPushChannel::new(backend.clone(), Duration::from_secs(5), 8);
        let mut stream = channel.open(&EntityId::new("nb-2")).await.unwrap();

        backend.set_status(&EntityId::new("nb-2"), EntityStatus::Cancelled);

        assert!(matches!(stream.recv().await, Some(PushMessage::Update(_))));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_poll_does_not_stop_polling() {
        let backend = backend_with("nb-3", EntityStatus::Extracting);
        let id = EntityId::new("nb-3");
        let channel = PollingPushChannel::new(backend.clone(), Duration::from_secs(5), 8)
            .with_fetch_timeout(Duration::from_secs(10));
        let mut stream = channel.open(&id).await.unwrap();

        let gate = backend.gate_fetches();
        backend.set_status(&id, EntityStatus::PreviewReady);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(backend.fetch_count(&id) >= 3);

        gate.add_permits(1000);
        match stream.recv().await {
            Some(PushMessage::Update(event)) => {
                assert_eq!(event.new.status, EntityStatus::PreviewReady);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_fails_for_unknown_entity() {
        let backend = Arc::new(InMemoryBackend::new());
        let channel = PollingPushChannel::new(backend, Duration::from_secs(5), 8);
        let result = channel.open(&EntityId::new("missing")).await;
        assert!(matches!(result, Err(SubscriptionError::Unavailable(_))));
    }
}
