//! Facade wiring the cache, client, reconciler and scanner together.
//!
//! This is the surface the presentation layer talks to: submit a job, read
//! its status, retry a failed one, and report application state changes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};

use crate::backend::{HttpBackend, JobBackend};
use crate::cache::{JobStatusCache, WriteOutcome};
use crate::client::{JobHandle, ProcessingJobClient, SubmitMode};
use crate::config::TrackerConfig;
use crate::db::Database;
use crate::entity::{EntityId, EntityRecord, EntityStatus, ProcessingJobStatus};
use crate::error::{JobError, Result, StudyflowError, SubscriptionError};
use crate::lifecycle::{AppLifecycle, AppState, ForegroundActivation};
use crate::push::{PollingPushChannel, PushChannel};
use crate::realtime::{RealtimeReconciler, SubscribeOutcome, UpdateCallback};
use crate::recovery::{record_permanent_failure, ForegroundRecoveryScanner, ScanReport};
use crate::secrets::resolve_secret_optional;
use crate::session::Session;

/// Timing knobs of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    pub submit_timeout: Duration,
    pub recovery_timeout: Duration,
    pub refetch_timeout: Duration,
    pub stuck_threshold: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(60),
            refetch_timeout: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(180),
        }
    }
}

impl TrackerSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            submit_timeout: config.submit_timeout(),
            recovery_timeout: config.recovery_timeout(),
            refetch_timeout: config.refetch_timeout(),
            stuck_threshold: config.stuck_threshold(),
        }
    }
}

fn log_update() -> UpdateCallback {
    Arc::new(|status: &ProcessingJobStatus| {
        debug!("Job status now {} ({}%)", status.status, status.progress);
    })
}

/// Processing-job lifecycle tracker.
pub struct JobTracker {
    cache: Arc<JobStatusCache>,
    backend: Arc<dyn JobBackend>,
    client: Arc<ProcessingJobClient>,
    reconciler: RealtimeReconciler,
    scanner: ForegroundRecoveryScanner,
    session: Arc<Session>,
    lifecycle: Mutex<AppLifecycle>,
    on_update: UpdateCallback,
}

impl JobTracker {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        channel: Arc<dyn PushChannel>,
        cache: Arc<JobStatusCache>,
        session: Arc<Session>,
        settings: TrackerSettings,
    ) -> Self {
        let client = Arc::new(ProcessingJobClient::new(
            Arc::clone(&backend),
            settings.submit_timeout,
            settings.recovery_timeout,
        ));
        let reconciler = RealtimeReconciler::new(
            Arc::clone(&cache),
            Arc::clone(&backend),
            channel,
            settings.refetch_timeout,
        );
        let scanner = ForegroundRecoveryScanner::new(
            Arc::clone(&client),
            Arc::clone(&backend),
            Arc::clone(&cache),
            Arc::clone(&session),
            settings.stuck_threshold,
        );

        Self {
            cache,
            backend,
            client,
            reconciler,
            scanner,
            session,
            lifecycle: Mutex::new(AppLifecycle::new()),
            on_update: log_update(),
        }
    }

    /// Builds a tracker talking to the HTTP backend described by `config`.
    ///
    /// Push updates are emulated by polling. The status snapshot is loaded
    /// from the configured database, if any.
    pub fn from_config(config: &TrackerConfig, session: Arc<Session>) -> Result<Self> {
        let token = resolve_secret_optional(
            config.api_token.as_deref(),
            config.api_token_file.as_deref(),
            config.api_token_env_var.as_deref(),
        )?;
        if token.is_none() {
            warn!("No API token configured, requests will be unauthenticated");
        }

        let backend: Arc<dyn JobBackend> = Arc::new(HttpBackend::new(
            &config.api_base_url,
            token,
            config.connect_timeout(),
            config.request_timeout(),
        )?);
        let channel: Arc<dyn PushChannel> = Arc::new(
            PollingPushChannel::new(
                Arc::clone(&backend),
                config.push_poll_interval(),
                config.channel_capacity,
            )
            .with_fetch_timeout(config.request_timeout()),
        );

        let mut cache = JobStatusCache::with_change_capacity(config.channel_capacity);
        if let Some(path) = config.resolved_database_path() {
            cache = cache.with_database(Database::open(&path)?);
            cache.load_from_database()?;
        }

        Ok(Self::new(
            backend,
            channel,
            Arc::new(cache),
            session,
            TrackerSettings::from_config(config),
        ))
    }

    /// Replaces the callback invoked after every accepted push write.
    pub fn with_update_callback(mut self, on_update: UpdateCallback) -> Self {
        self.on_update = on_update;
        self
    }

    pub fn cache(&self) -> &Arc<JobStatusCache> {
        &self.cache
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn reconciler(&self) -> &RealtimeReconciler {
        &self.reconciler
    }

    pub fn scanner(&self) -> &ForegroundRecoveryScanner {
        &self.scanner
    }

    // ─── Jobs ───────────────────────────────────────────────────────────────

    /// Submits the job for `id` on behalf of the signed-in user.
    ///
    /// Writes an optimistic `pending`, subscribes to push updates, then calls
    /// the backend. An entity already in flight keeps its cached status.
    /// Only a permanent error changes the status to `failed`; timeouts and
    /// network errors are returned but leave it untouched.
    pub async fn submit(&self, id: &EntityId) -> Result<JobHandle> {
        let user = self
            .session
            .current_user()
            .ok_or(StudyflowError::NotAuthenticated)?;

        let outcome = self.cache.mark_submitted(id, user);
        if let WriteOutcome::IllegalTransition { from, .. } = outcome {
            debug!("{} already {}, keeping cached status", id, from);
        }
        if let Err(e) = self.watch(id).await {
            warn!("Tracking {} without push updates: {}", id, e);
        }

        match self.client.submit(id, SubmitMode::Fresh).await {
            Ok(handle) => {
                info!("Submitted {} (correlation {})", id, handle.correlation_id);
                Ok(handle)
            }
            Err(JobError::Permanent { entity_id, message }) => {
                if let Some(last_known) = self.cache.get(id) {
                    let deadline = self.client.timeout_for(SubmitMode::Fresh);
                    record_permanent_failure(
                        &*self.backend,
                        &self.cache,
                        &last_known,
                        &message,
                        deadline,
                    )
                    .await;
                }
                Err(JobError::Permanent { entity_id, message }.into())
            }
            Err(e) => {
                info!("Submission of {} unresolved, still processing: {}", id, e);
                Err(e.into())
            }
        }
    }

    /// Re-submits a `failed` entity on explicit user request.
    pub async fn retry(&self, id: &EntityId) -> Result<JobHandle> {
        let status = self
            .cache
            .get(id)
            .map(|r| r.status)
            .ok_or_else(|| StudyflowError::UnknownEntity(id.clone()))?;
        if status != EntityStatus::Failed {
            return Err(StudyflowError::NotRetryable {
                entity_id: id.clone(),
                status,
            });
        }

        info!("Retrying {}", id);
        self.submit(id).await
    }

    /// Subscribes to push updates for `id`.
    pub async fn watch(&self, id: &EntityId) -> std::result::Result<SubscribeOutcome, SubscriptionError> {
        self.reconciler.subscribe(id, Arc::clone(&self.on_update)).await
    }

    pub fn unwatch(&self, id: &EntityId) -> bool {
        self.reconciler.unsubscribe(id)
    }

    /// Subscribes to every cached entity still in flight. Returns the number
    /// of channels opened.
    pub async fn resume_watching(&self) -> usize {
        let mut opened = 0;
        for record in self.cache.all() {
            if !record.status.is_in_flight() {
                continue;
            }
            match self.watch(&record.id).await {
                Ok(SubscribeOutcome::Opened) => opened += 1,
                Ok(_) => {}
                Err(e) => warn!("Could not resume watching {}: {}", record.id, e),
            }
        }
        opened
    }

    /// Removes `id` after explicit user deletion.
    pub fn delete(&self, id: &EntityId) -> Option<EntityRecord> {
        self.unwatch(id);
        self.cache.remove(id)
    }

    pub fn job_status(&self, id: &EntityId) -> Option<ProcessingJobStatus> {
        self.cache.job_status(id)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Records an application state change; returns the activation if the
    /// application just entered the foreground.
    pub fn note_app_state(&self, state: AppState) -> Option<ForegroundActivation> {
        let mut lifecycle = match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Lifecycle lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        lifecycle.transition(state, Utc::now())
    }

    /// Runs the recovery scan for one activation.
    pub async fn recover(&self, activation: ForegroundActivation) -> ScanReport {
        self.scanner.on_foreground(activation).await
    }

    /// Records a state change and, on foregrounding, runs the recovery scan.
    pub async fn on_app_state_change(&self, state: AppState) -> Option<ScanReport> {
        let activation = self.note_app_state(state)?;
        Some(self.recover(activation).await)
    }

    /// Closes every push channel.
    pub fn shutdown(&self) {
        self.reconciler.unsubscribe_all();
    }
}
