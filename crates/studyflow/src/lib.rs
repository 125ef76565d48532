pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod push;
pub mod realtime;
pub mod recovery;
pub mod secrets;
pub mod session;
pub mod tracker;

pub use backend::{BackendError, HttpBackend, InMemoryBackend, JobBackend};
pub use cache::{CacheChange, JobStatusCache, WriteOutcome};
pub use client::{JobHandle, ProcessingJobClient, SubmitMode};
pub use config::{load_config, LogFormat, TrackerConfig};
pub use db::{Database, DatabaseError};
pub use entity::{
    EntityId, EntityPayload, EntityRecord, EntityStatus, JobProgress, ProcessingJobStatus,
    UpdateEvent, UserId,
};
pub use error::{
    ConfigError, JobError, JobErrorKind, Result, StudyflowError, SubscriptionError,
};
pub use lifecycle::{AppLifecycle, AppState, ForegroundActivation, ForegroundMonitor};
pub use push::{BroadcastPushHub, PollingPushChannel, PushChannel};
pub use realtime::{RealtimeReconciler, ReconcileState, SubscribeOutcome, UpdateCallback};
pub use recovery::{ForegroundRecoveryScanner, RecoveryOutcome, ScanReport};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use session::Session;
pub use tracker::{JobTracker, TrackerSettings};
