//! End-to-end lifecycle tests: submission, push reconciliation, and
//! foreground recovery running together against an in-memory backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use common::harness::{drain, settle, wait_for};
use common::{event, RecordBuilder, TestHarness};
use studyflow::backend::SubmitBehavior;
use studyflow::lifecycle::ActivationId;
use studyflow::{
    AppState, CacheChange, EntityStatus, ForegroundActivation, ForegroundMonitor, ReconcileState,
    RecoveryOutcome, ScanReport, TrackerSettings,
};

// ─── Foreground recovery ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stuck_entity_with_validation_error_is_marked_failed() {
    let h = TestHarness::new();
    let x = h.seed(
        RecordBuilder::new("x", EntityStatus::Extracting)
            .minutes_ago(5)
            .build(),
    );
    h.backend.set_submit_behavior(
        &x,
        SubmitBehavior::Reject("file is not a supported document".to_string()),
    );

    let report = h.tracker.on_app_state_change(AppState::Active).await.unwrap();

    assert_eq!(report.results().len(), 1);
    assert!(matches!(
        report.results()[0].outcome,
        RecoveryOutcome::MarkedFailed { .. }
    ));
    assert_eq!(h.backend.submission_count(&x), 1);

    let status = h.tracker.job_status(&x).unwrap();
    assert_eq!(status.status, EntityStatus::Failed);
    assert_eq!(
        status.error_message.as_deref(),
        Some("file is not a supported document")
    );
    assert_eq!(h.backend.get(&x).unwrap().status, EntityStatus::Failed);
}

#[tokio::test]
async fn test_recent_extracting_entity_is_not_retried() {
    let h = TestHarness::new();
    let y = h.seed(
        RecordBuilder::new("y", EntityStatus::Extracting)
            .minutes_ago(1)
            .build(),
    );

    let report = h.tracker.on_app_state_change(AppState::Active).await.unwrap();

    assert_eq!(
        report,
        ScanReport::Completed {
            candidates: 0,
            results: vec![]
        }
    );
    assert_eq!(h.backend.submission_count(&y), 0);
    assert_eq!(h.cached(&y).status, EntityStatus::Extracting);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_timeout_leaves_status_untouched() {
    let h = TestHarness::new();
    let w = h.seed(
        RecordBuilder::new("w", EntityStatus::Extracting)
            .minutes_ago(10)
            .build(),
    );
    let before = h.cached(&w);
    h.backend
        .set_submit_behavior(&w, SubmitBehavior::Delay(Duration::from_secs(120)));

    let report = h.tracker.on_app_state_change(AppState::Active).await.unwrap();

    assert_eq!(
        report.results()[0].outcome,
        RecoveryOutcome::Deferred {
            reason: "timeout".to_string()
        }
    );
    assert_eq!(h.cached(&w), before);
    assert!(h.backend.failure_writes().is_empty());
}

#[tokio::test]
async fn test_network_error_defers_until_next_activation() {
    let h = TestHarness::new();
    let w = h.seed(
        RecordBuilder::new("w", EntityStatus::Extracting)
            .minutes_ago(10)
            .build(),
    );
    h.backend.set_submit_behavior(&w, SubmitBehavior::NetworkDown);

    let first = h.tracker.on_app_state_change(AppState::Active).await.unwrap();
    assert_eq!(
        first.results()[0].outcome,
        RecoveryOutcome::Deferred {
            reason: "network_error".to_string()
        }
    );
    assert_eq!(h.cached(&w).status, EntityStatus::Extracting);

    h.backend.set_submit_behavior(&w, SubmitBehavior::Accept);
    h.tracker.on_app_state_change(AppState::Background).await;
    let second = h.tracker.on_app_state_change(AppState::Active).await.unwrap();
    assert_eq!(second.results()[0].outcome, RecoveryOutcome::Resubmitted);
    assert_eq!(h.backend.submission_count(&w), 2);
}

#[tokio::test]
async fn test_same_activation_scans_once() {
    let h = TestHarness::new();
    let w = h.seed(
        RecordBuilder::new("w", EntityStatus::Extracting)
            .minutes_ago(10)
            .build(),
    );
    let activation = ForegroundActivation {
        id: ActivationId::new(7),
        at: Utc::now(),
    };

    let (a, b) = tokio::join!(
        h.tracker.recover(activation),
        h.tracker.recover(activation)
    );
    let skipped = [&a, &b]
        .iter()
        .filter(|r| matches!(r, ScanReport::AlreadyRunning | ScanReport::AlreadyHandled))
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(a.submissions() + b.submissions(), 1);

    let again = h.tracker.recover(activation).await;
    assert_eq!(again, ScanReport::AlreadyHandled);
    assert_eq!(h.backend.submission_count(&w), 1);
}

#[tokio::test(start_paused = true)]
async fn test_outstanding_recovery_is_not_duplicated() {
    let h = TestHarness::new();
    let w = h.seed(
        RecordBuilder::new("w", EntityStatus::Extracting)
            .minutes_ago(10)
            .build(),
    );
    h.backend
        .set_submit_behavior(&w, SubmitBehavior::Delay(Duration::from_secs(30)));

    let tracker = h.tracker.clone();
    let first = tokio::spawn(async move { tracker.on_app_state_change(AppState::Active).await });
    wait_for(|| h.backend.total_submissions() == 1).await;

    h.tracker.on_app_state_change(AppState::Background).await;
    let second = h.tracker.on_app_state_change(AppState::Active).await.unwrap();
    assert_eq!(second.results()[0].outcome, RecoveryOutcome::InFlight);
    assert_eq!(second.submissions(), 0);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.results()[0].outcome, RecoveryOutcome::Resubmitted);
    assert_eq!(h.backend.submission_count(&w), 1);
    assert_eq!(h.tracker.scanner().in_flight(), 0);
}

#[tokio::test]
async fn test_signed_out_user_is_not_scanned() {
    let h = TestHarness::new();
    h.seed(
        RecordBuilder::new("w", EntityStatus::Extracting)
            .minutes_ago(10)
            .build(),
    );
    h.session.sign_out();

    let report = h.tracker.on_app_state_change(AppState::Active).await.unwrap();
    assert_eq!(report, ScanReport::NoUser);
    assert_eq!(h.backend.total_submissions(), 0);
}

#[tokio::test]
async fn test_other_users_entities_are_ignored() {
    let h = TestHarness::new();
    h.seed(
        RecordBuilder::new("theirs", EntityStatus::Extracting)
            .owner("user-2")
            .minutes_ago(10)
            .build(),
    );

    let report = h.tracker.on_app_state_change(AppState::Active).await.unwrap();
    assert_eq!(report.results().len(), 0);
    assert_eq!(h.backend.total_submissions(), 0);
}

#[tokio::test]
async fn test_brief_foreground_visit_through_monitor_is_scanned() {
    let h = TestHarness::new();
    let x = h.seed(
        RecordBuilder::new("x", EntityStatus::Extracting)
            .minutes_ago(10)
            .build(),
    );
    let monitor = ForegroundMonitor::new(Arc::clone(&h.tracker));
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = monitor.start(rx);

    tx.send(AppState::Background).unwrap();
    tx.send(AppState::Active).unwrap();
    tx.send(AppState::Background).unwrap();
    wait_for(|| h.backend.submission_count(&x) == 1).await;
    wait_for(|| h.tracker.scanner().in_flight() == 0).await;

    tx.send(AppState::Active).unwrap();
    tx.send(AppState::Inactive).unwrap();
    wait_for(|| h.backend.submission_count(&x) == 2).await;

    drop(tx);
    handle.await.unwrap();
    settle().await;
    assert_eq!(h.backend.submission_count(&x), 2);
}

// ─── Push reconciliation ────────────────────────────────────────────────────

#[tokio::test]
async fn test_refetch_runs_once_and_writes_payload_once() {
    let h = TestHarness::new();
    let t0 = Utc::now();
    let t1 = t0 + chrono::Duration::seconds(1);
    let t2 = t0 + chrono::Duration::seconds(2);

    let extracting = RecordBuilder::new("z", EntityStatus::Extracting)
        .updated_at(t0)
        .build();
    let z = h.seed(extracting.clone());
    let preview = RecordBuilder::new("z", EntityStatus::PreviewReady)
        .updated_at(t1)
        .build();
    let preview_again = RecordBuilder::new("z", EntityStatus::PreviewReady)
        .updated_at(t2)
        .build();

    let gate = h.backend.gate_fetches();
    h.backend.upsert(
        RecordBuilder::new("z", EntityStatus::PreviewReady)
            .updated_at(t1)
            .payload("Cell biology")
            .build(),
    );
    h.tracker.watch(&z).await.unwrap();
    let mut changes = h.changes();

    h.hub.publish(event(&extracting, &preview));
    wait_for(|| h.backend.fetch_count(&z) == 1).await;

    h.hub.publish(event(&preview, &preview_again));
    wait_for(|| h.cached(&z).updated_at == t2).await;
    assert_eq!(h.cached(&z).status, EntityStatus::PreviewReady);
    assert_eq!(
        h.tracker.reconciler().reconcile_state(&z),
        Some(ReconcileState::ReconcilingFullFetch)
    );

    gate.add_permits(1);
    wait_for(|| h.tracker.reconciler().reconcile_state(&z) == Some(ReconcileState::Idle)).await;
    settle().await;

    let cached = h.cached(&z);
    assert_eq!(cached.payload.unwrap().title, "Cell biology");
    assert_eq!(cached.updated_at, t2);
    assert_eq!(h.backend.fetch_count(&z), 1);

    let payload_writes = drain(&mut changes)
        .into_iter()
        .filter(|c| matches!(c, CacheChange::Updated(r) if r.payload.is_some()))
        .count();
    assert_eq!(payload_writes, 1);
}

#[tokio::test]
async fn test_duplicate_watch_opens_one_channel() {
    let h = TestHarness::new();
    let z = h.seed(RecordBuilder::new("z", EntityStatus::Pending).build());

    h.tracker.watch(&z).await.unwrap();
    h.tracker.watch(&z).await.unwrap();

    assert_eq!(h.hub.channels_opened(), 1);
    assert_eq!(h.tracker.reconciler().active_subscriptions(), 1);
}

#[tokio::test]
async fn test_repeated_push_event_is_idempotent() {
    let h = TestHarness::new();
    let t0 = Utc::now();
    let pending = RecordBuilder::new("z", EntityStatus::Pending)
        .updated_at(t0)
        .build();
    let z = h.seed(pending.clone());
    let extracting = RecordBuilder::new("z", EntityStatus::Extracting)
        .updated_at(t0 + chrono::Duration::seconds(1))
        .percent(40)
        .build();
    h.tracker.watch(&z).await.unwrap();
    let mut changes = h.changes();

    h.hub.publish(event(&pending, &extracting));
    h.hub.publish(event(&pending, &extracting));
    wait_for(|| h.cached(&z).status == EntityStatus::Extracting).await;
    settle().await;

    assert_eq!(drain(&mut changes).len(), 1);
    assert_eq!(h.updates.lock().unwrap().len(), 1);
    assert_eq!(h.tracker.job_status(&z).unwrap().progress, 40);
}

#[tokio::test]
async fn test_repeated_preview_ready_event_is_idempotent() {
    let h = TestHarness::new();
    let t0 = Utc::now();
    let t1 = t0 + chrono::Duration::seconds(1);

    let extracting = RecordBuilder::new("z", EntityStatus::Extracting)
        .updated_at(t0)
        .percent(60)
        .build();
    let z = h.seed(extracting.clone());
    let preview = RecordBuilder::new("z", EntityStatus::PreviewReady)
        .updated_at(t1)
        .percent(80)
        .build();
    h.backend.upsert(
        RecordBuilder::new("z", EntityStatus::PreviewReady)
            .updated_at(t1)
            .percent(80)
            .payload("Cell biology")
            .build(),
    );
    h.tracker.watch(&z).await.unwrap();
    let mut changes = h.changes();

    let gate = h.backend.gate_fetches();
    h.hub.publish(event(&extracting, &preview));
    wait_for(|| h.backend.fetch_count(&z) == 1).await;

    // Delivered again while the re-fetch is held.
    h.hub.publish(event(&extracting, &preview));
    wait_for(|| h.cached(&z).status == EntityStatus::PreviewReady).await;

    gate.add_permits(1);
    wait_for(|| h.cached(&z).payload.is_some()).await;
    wait_for(|| h.tracker.reconciler().reconcile_state(&z) == Some(ReconcileState::Idle)).await;

    // And once more after it landed.
    h.hub.publish(event(&extracting, &preview));
    settle().await;

    let cached = h.cached(&z);
    assert_eq!(cached.status, EntityStatus::PreviewReady);
    assert_eq!(cached.updated_at, t1);
    assert_eq!(cached.progress.percent, 80);
    assert_eq!(cached.payload.unwrap().title, "Cell biology");
    assert_eq!(h.backend.fetch_count(&z), 1);

    let statuses: Vec<EntityStatus> = drain(&mut changes)
        .into_iter()
        .filter_map(|c| match c {
            CacheChange::Updated(record) => Some(record.status),
            CacheChange::Removed(_) => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![EntityStatus::PreviewReady, EntityStatus::PreviewReady]
    );
}

#[tokio::test]
async fn test_resubmitting_in_flight_entity_keeps_its_status() {
    let h = TestHarness::new();
    let extracting = RecordBuilder::new("x", EntityStatus::Extracting)
        .percent(50)
        .build();
    let x = h.seed(extracting.clone());
    h.tracker.watch(&x).await.unwrap();

    h.tracker.submit(&x).await.unwrap();
    assert_eq!(h.cached(&x).status, EntityStatus::Extracting);
    assert!(!h.cache.is_optimistic(&x));

    // The backend republishes the row it already had.
    h.backend.upsert(extracting);
    settle().await;

    let status = h.tracker.job_status(&x).unwrap();
    assert_eq!(status.status, EntityStatus::Extracting);
    assert_eq!(status.progress, 50);
    assert_eq!(h.backend.submission_count(&x), 1);

    h.backend.set_status(&x, EntityStatus::Ready);
    wait_for(|| h.cached(&x).status == EntityStatus::Ready).await;
}

#[tokio::test]
async fn test_status_never_regresses() {
    let h = TestHarness::new();
    let t0 = Utc::now();
    let extracting = RecordBuilder::new("z", EntityStatus::Extracting)
        .updated_at(t0)
        .percent(60)
        .build();
    let z = h.seed(extracting.clone());
    let ready = RecordBuilder::new("z", EntityStatus::Ready)
        .updated_at(t0 + chrono::Duration::seconds(5))
        .build();
    let late = RecordBuilder::new("z", EntityStatus::Extracting)
        .updated_at(t0 + chrono::Duration::seconds(2))
        .percent(80)
        .build();
    h.tracker.watch(&z).await.unwrap();

    h.hub.publish(event(&extracting, &ready));
    wait_for(|| h.cached(&z).status == EntityStatus::Ready).await;
    h.hub.publish(event(&extracting, &late));
    settle().await;

    let status = h.tracker.job_status(&z).unwrap();
    assert_eq!(status.status, EntityStatus::Ready);
    assert_eq!(status.progress, 100);
}

#[tokio::test]
async fn test_progress_percent_is_monotonic_while_extracting() {
    let h = TestHarness::new();
    let t0 = Utc::now();
    let first = RecordBuilder::new("z", EntityStatus::Extracting)
        .updated_at(t0)
        .percent(70)
        .build();
    let z = h.seed(first.clone());
    let lower = RecordBuilder::new("z", EntityStatus::Extracting)
        .updated_at(t0 + chrono::Duration::seconds(1))
        .percent(30)
        .build();
    h.tracker.watch(&z).await.unwrap();

    h.hub.publish(event(&first, &lower));
    wait_for(|| h.cached(&z).updated_at > t0).await;

    assert_eq!(h.tracker.job_status(&z).unwrap().progress, 70);
}

#[tokio::test]
async fn test_push_failure_after_user_submit() {
    let h = TestHarness::new();
    let z = h.seed(RecordBuilder::new("z", EntityStatus::Pending).build());

    h.tracker.submit(&z).await.unwrap();
    wait_for(|| h.cached(&z).status == EntityStatus::Extracting).await;

    let pushed = h.backend.set_status(&z, EntityStatus::Failed).unwrap();
    wait_for(|| h.cached(&z).status == EntityStatus::Failed).await;
    assert_eq!(h.cached(&z).updated_at, pushed.updated_at);

    let status = h.tracker.job_status(&z).unwrap();
    assert!(status.can_retry());
    assert_eq!(status.error_message.as_deref(), Some("Processing failed"));
}

// ─── Settings ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_fresh_submit_uses_shorter_timeout() {
    let h = TestHarness::with_settings(TrackerSettings {
        submit_timeout: Duration::from_secs(5),
        ..TrackerSettings::default()
    });
    let z = h.seed(RecordBuilder::new("z", EntityStatus::Pending).build());
    h.backend
        .set_submit_behavior(&z, SubmitBehavior::Delay(Duration::from_secs(10)));

    let err = h.tracker.submit(&z).await.unwrap_err();
    assert!(err.to_string().contains("timed out after 5s"));
    assert_eq!(h.cached(&z).status, EntityStatus::Pending);
}
