//! Drives the tracker from a stream of host application states.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::AppState;
use crate::tracker::JobTracker;

/// Feeds application state changes into a [`JobTracker`].
///
/// Every state sent is handed to the tracker, in send order, on the monitor
/// task. A quick foreground visit therefore still counts as an activation.
/// Each resulting recovery scan runs on its own task so a slow scan never
/// delays the next state change.
pub struct ForegroundMonitor {
    tracker: Arc<JobTracker>,
    shutdown: Arc<AtomicBool>,
}

impl ForegroundMonitor {
    pub fn new(tracker: Arc<JobTracker>) -> Self {
        Self {
            tracker,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts consuming `states`. The host sends its current state first.
    ///
    /// The loop ends when every sender is dropped or [`stop`](Self::stop) is
    /// called and the next state arrives.
    pub fn start(&self, mut states: mpsc::UnboundedReceiver<AppState>) -> JoinHandle<()> {
        let tracker = Arc::clone(&self.tracker);
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Some(state) = states.recv().await else {
                    log::debug!("App state senders dropped, stopping foreground monitor");
                    break;
                };
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                dispatch(&tracker, state);
            }
        })
    }

    /// Signals the monitor to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn dispatch(tracker: &Arc<JobTracker>, state: AppState) {
    log::debug!("App state changed to {:?}", state);
    let Some(activation) = tracker.note_app_state(state) else {
        return;
    };

    let tracker = Arc::clone(tracker);
    tokio::spawn(async move {
        let report = tracker.recover(activation).await;
        log::info!(
            "Recovery scan for {}: {} resubmitted",
            activation.id,
            report.submissions()
        );
    });
}
