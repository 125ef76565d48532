//! Foreground recovery of stuck jobs.
//!
//! On every foreground activation the scanner asks the backend for the
//! signed-in user's entities stuck in `extracting` and re-submits each of
//! them concurrently. Only a permanent error changes local state.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use log::{error, info, warn};
use serde::Serialize;
use tracing::Instrument;

use crate::backend::{BackendError, JobBackend};
use crate::cache::{JobStatusCache, WriteOutcome};
use crate::client::{ProcessingJobClient, SubmitMode};
use crate::entity::{EntityId, EntityRecord, EntityStatus};
use crate::error::{JobError, JobErrorKind};
use crate::lifecycle::{ActivationId, ForegroundActivation};
use crate::session::Session;

/// Number of completed activations remembered for duplicate detection.
const HANDLED_HISTORY: usize = 32;

/// What happened to one stuck entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Submission accepted; the push path delivers the result.
    Resubmitted,
    /// Timeout or network error. Left in `extracting` for the next activation.
    Deferred { reason: String },
    /// Permanent error, written as `failed`.
    MarkedFailed { message: String },
    /// A submission from an earlier activation is still outstanding.
    InFlight,
    /// The recovery task panicked or was cancelled.
    TaskFailed { message: String },
}

impl RecoveryOutcome {
    fn deferred(kind: JobErrorKind) -> Self {
        let reason = match kind {
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::NetworkError => "network_error",
            JobErrorKind::Permanent => "permanent",
        };
        RecoveryOutcome::Deferred {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub entity_id: EntityId,
    pub outcome: RecoveryOutcome,
}

/// Result of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanReport {
    NoUser,
    /// A scan for the same activation is still running.
    AlreadyRunning,
    /// The activation was already scanned.
    AlreadyHandled,
    QueryFailed { message: String },
    Completed {
        candidates: usize,
        results: Vec<RecoveryResult>,
    },
}

impl ScanReport {
    pub fn results(&self) -> &[RecoveryResult] {
        match self {
            ScanReport::Completed { results, .. } => results,
            _ => &[],
        }
    }

    /// Number of submissions issued by this scan.
    pub fn submissions(&self) -> usize {
        self.results()
            .iter()
            .filter(|r| {
                !matches!(
                    r.outcome,
                    RecoveryOutcome::InFlight | RecoveryOutcome::TaskFailed { .. }
                )
            })
            .count()
    }
}

#[derive(Default)]
struct ActivationGuards {
    running: HashSet<ActivationId>,
    handled: VecDeque<ActivationId>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Recovery scanner lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

struct RunningGuard<'a> {
    guards: &'a Mutex<ActivationGuards>,
    id: ActivationId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut guards = lock(self.guards);
        guards.running.remove(&self.id);
        guards.handled.push_back(self.id);
        while guards.handled.len() > HANDLED_HISTORY {
            guards.handled.pop_front();
        }
    }
}

struct InFlightGuard {
    set: Arc<Mutex<HashSet<EntityId>>>,
    id: EntityId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.id);
    }
}

/// Writes `failed` to the backend and the cache after a permanent error.
///
/// If the backend write fails or misses `deadline` the failure is still
/// applied locally.
pub(crate) async fn record_permanent_failure(
    backend: &dyn JobBackend,
    cache: &JobStatusCache,
    last_known: &EntityRecord,
    message: &str,
    deadline: Duration,
) -> WriteOutcome {
    let write = backend.mark_failed(&last_known.id, message);
    let written = tokio::time::timeout(deadline, write)
        .await
        .unwrap_or(Err(BackendError::Timeout));

    match written {
        Ok(mut record) => {
            if record.error_message.is_none() {
                record.error_message = Some(message.to_string());
            }
            cache.apply(record)
        }
        Err(e) => {
            error!(
                "Could not write failed status of {} to backend: {}",
                last_known.id, e
            );
            let mut local = cache.get(&last_known.id).unwrap_or_else(|| last_known.clone());
            local.status = EntityStatus::Failed;
            local.error_message = Some(message.to_string());
            local.updated_at = local.updated_at.max(Utc::now());
            cache.apply(local)
        }
    }
}

async fn recover_entity(
    client: Arc<ProcessingJobClient>,
    backend: Arc<dyn JobBackend>,
    cache: Arc<JobStatusCache>,
    record: EntityRecord,
    _claim: InFlightGuard,
) -> RecoveryOutcome {
    match client.submit(&record.id, SubmitMode::Recovery).await {
        Ok(handle) => {
            info!(
                "Re-submitted stuck entity {} (correlation {})",
                record.id, handle.correlation_id
            );
            RecoveryOutcome::Resubmitted
        }
        Err(JobError::Permanent { message, .. }) => {
            let deadline = client.timeout_for(SubmitMode::Recovery);
            let outcome =
                record_permanent_failure(&*backend, &cache, &record, &message, deadline).await;
            info!("Marked {} as failed ({:?}): {}", record.id, outcome, message);
            RecoveryOutcome::MarkedFailed { message }
        }
        Err(e) => {
            info!("Leaving {} in extracting: {}", record.id, e);
            RecoveryOutcome::deferred(e.kind())
        }
    }
}

/// Re-submits stuck jobs when the application returns to the foreground.
pub struct ForegroundRecoveryScanner {
    client: Arc<ProcessingJobClient>,
    backend: Arc<dyn JobBackend>,
    cache: Arc<JobStatusCache>,
    session: Arc<Session>,
    threshold: chrono::Duration,
    guards: Mutex<ActivationGuards>,
    in_flight: Arc<Mutex<HashSet<EntityId>>>,
}

impl ForegroundRecoveryScanner {
    pub fn new(
        client: Arc<ProcessingJobClient>,
        backend: Arc<dyn JobBackend>,
        cache: Arc<JobStatusCache>,
        session: Arc<Session>,
        stuck_threshold: Duration,
    ) -> Self {
        let threshold =
            chrono::Duration::from_std(stuck_threshold).unwrap_or_else(|_| chrono::Duration::weeks(52));
        Self {
            client,
            backend,
            cache,
            session,
            threshold,
            guards: Mutex::new(ActivationGuards::default()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn begin(&self, id: ActivationId) -> Result<RunningGuard<'_>, ScanReport> {
        let mut guards = lock(&self.guards);
        if guards.running.contains(&id) {
            return Err(ScanReport::AlreadyRunning);
        }
        if guards.handled.contains(&id) {
            return Err(ScanReport::AlreadyHandled);
        }
        guards.running.insert(id);
        Ok(RunningGuard {
            guards: &self.guards,
            id,
        })
    }

    fn claim(&self, id: &EntityId) -> Option<InFlightGuard> {
        let mut set = lock(&self.in_flight);
        if !set.insert(id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: id.clone(),
        })
    }

    /// Number of entities with an outstanding recovery submission.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Runs one scan for `activation`.
    pub async fn on_foreground(&self, activation: ForegroundActivation) -> ScanReport {
        let Some(user) = self.session.current_user() else {
            info!("Skipping recovery scan for {}: no signed-in user", activation.id);
            return ScanReport::NoUser;
        };

        let _running = match self.begin(activation.id) {
            Ok(guard) => guard,
            Err(report) => {
                info!("Skipping recovery scan for {}: {:?}", activation.id, report);
                return report;
            }
        };

        let span = tracing::info_span!("recovery_scan", activation = %activation.id, user = %user);
        async move {
            let cutoff = activation.at - self.threshold;
            let deadline = self.client.timeout_for(SubmitMode::Recovery);
            let query = tokio::time::timeout(deadline, self.backend.list_stuck(&user, cutoff));
            let stuck = match query.await.unwrap_or(Err(BackendError::Timeout)) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Stuck-entity query failed: {}", e);
                    return ScanReport::QueryFailed {
                        message: e.to_string(),
                    };
                }
            };

            let mut seen = HashSet::new();
            let candidates: Vec<EntityRecord> = stuck
                .into_iter()
                .filter(|r| r.owner_id == user && r.is_stuck(activation.at, self.threshold))
                .filter(|r| seen.insert(r.id.clone()))
                .collect();
            info!("Found {} stuck entities", candidates.len());

            let mut results = Vec::with_capacity(candidates.len());
            let mut tasks = Vec::new();
            for record in &candidates {
                let Some(claim) = self.claim(&record.id) else {
                    info!("Recovery of {} still in flight, skipping", record.id);
                    results.push(RecoveryResult {
                        entity_id: record.id.clone(),
                        outcome: RecoveryOutcome::InFlight,
                    });
                    continue;
                };

                let handle = tokio::spawn(
                    recover_entity(
                        Arc::clone(&self.client),
                        Arc::clone(&self.backend),
                        Arc::clone(&self.cache),
                        record.clone(),
                        claim,
                    )
                    .in_current_span(),
                );
                tasks.push((record.id.clone(), handle));
            }

            let joined = join_all(
                tasks
                    .into_iter()
                    .map(|(id, handle)| async move { (id, handle.await) }),
            )
            .await;

            for (entity_id, joined) in joined {
                let outcome = joined.unwrap_or_else(|e| {
                    error!("Recovery task for {} failed: {}", entity_id, e);
                    RecoveryOutcome::TaskFailed {
                        message: e.to_string(),
                    }
                });
                results.push(RecoveryResult { entity_id, outcome });
            }
            results.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

            ScanReport::Completed {
                candidates: candidates.len(),
                results,
            }
        }
        .instrument(span)
        .await
    }
}
