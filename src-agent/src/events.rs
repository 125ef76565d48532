//! Outgoing event stream written to stdout as JSON lines.

use std::sync::Arc;

use serde::Serialize;
use studyflow::{CacheChange, EntityId, JobStatusCache, ProcessingJobStatus};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Everything the agent reports to its host.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        entity_id: EntityId,
        job: ProcessingJobStatus,
    },
    #[serde(rename_all = "camelCase")]
    Removed { entity_id: EntityId },
    Response {
        command: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AgentEvent {
    pub fn ok(command: &str, data: Option<serde_json::Value>) -> Self {
        AgentEvent::Response {
            command: command.to_string(),
            ok: true,
            data,
            error: None,
        }
    }

    pub fn err(command: &str, error: impl ToString) -> Self {
        AgentEvent::Response {
            command: command.to_string(),
            ok: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

impl From<CacheChange> for AgentEvent {
    fn from(change: CacheChange) -> Self {
        match change {
            CacheChange::Updated(record) => AgentEvent::StatusChanged {
                job: record.job_status(),
                entity_id: record.id,
            },
            CacheChange::Removed(entity_id) => AgentEvent::Removed { entity_id },
        }
    }
}

/// Serializes events onto stdout, one JSON object per line.
pub fn spawn_writer(mut rx: mpsc::Receiver<AgentEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = rx.recv().await {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() || stdout.flush().await.is_err() {
                log::warn!("stdout closed, dropping event stream");
                break;
            }
        }
    })
}

/// Forwards cache changes to the event stream.
pub fn spawn_cache_bridge(cache: &Arc<JobStatusCache>, tx: mpsc::Sender<AgentEvent>) -> JoinHandle<()> {
    let mut changes = cache.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    if tx.send(change.into()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Event bridge lagged, skipped {} cache changes", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
