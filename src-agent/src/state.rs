//! Agent state: the tracker plus the app-state feed driving it.

use std::sync::Arc;

use studyflow::{
    AppState, BroadcastPushHub, ForegroundMonitor, InMemoryBackend, JobStatusCache, JobTracker,
    Session, TrackerConfig, TrackerSettings,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct AgentState {
    pub tracker: Arc<JobTracker>,
    /// Set in offline mode, where jobs run against an in-process backend.
    pub offline: Option<Arc<InMemoryBackend>>,
    app_states: mpsc::UnboundedSender<AppState>,
    pending_states: Option<mpsc::UnboundedReceiver<AppState>>,
    monitor: ForegroundMonitor,
}

impl AgentState {
    /// Connects to the backend described by `config`.
    pub fn online(config: &TrackerConfig) -> studyflow::Result<Self> {
        let tracker = JobTracker::from_config(config, Arc::new(Session::new()))?;
        Ok(Self::with_tracker(tracker, None))
    }

    /// Runs against an in-memory backend whose writes are pushed back
    /// through an in-process hub. Nothing is persisted.
    pub fn offline(settings: TrackerSettings, capacity: usize) -> Self {
        let hub = BroadcastPushHub::new(capacity);
        let backend = Arc::new(InMemoryBackend::with_push_hub(hub.clone()));
        let tracker = JobTracker::new(
            backend.clone(),
            Arc::new(hub),
            Arc::new(JobStatusCache::with_change_capacity(capacity)),
            Arc::new(Session::new()),
            settings,
        );
        Self::with_tracker(tracker, Some(backend))
    }

    fn with_tracker(tracker: JobTracker, offline: Option<Arc<InMemoryBackend>>) -> Self {
        let tracker = Arc::new(tracker);
        let (app_states, pending_states) = mpsc::unbounded_channel();
        let monitor = ForegroundMonitor::new(Arc::clone(&tracker));
        Self {
            tracker,
            offline,
            app_states,
            pending_states: Some(pending_states),
            monitor,
        }
    }

    /// Starts the foreground monitor. States set before this call are
    /// queued and handled in order. Returns `None` once already started.
    pub fn start_monitor(&mut self) -> Option<JoinHandle<()>> {
        let states = self.pending_states.take()?;
        Some(self.monitor.start(states))
    }

    pub fn set_app_state(&self, state: AppState) {
        if self.app_states.send(state).is_err() {
            log::debug!("Foreground monitor gone, dropping {:?}", state);
        }
    }

    pub fn shutdown(&self) {
        self.monitor.stop();
        self.tracker.shutdown();
    }
}
