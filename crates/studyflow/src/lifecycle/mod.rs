//! Application foreground tracking.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod monitor;

pub use monitor::ForegroundMonitor;

/// Host application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

impl FromStr for AppState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "foreground" => Ok(AppState::Active),
            "inactive" => Ok(AppState::Inactive),
            "background" => Ok(AppState::Background),
            other => Err(format!("unknown app state '{}'", other)),
        }
    }
}

/// Identifies one background-to-foreground transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActivationId(u64);

impl ActivationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "activation-{}", self.0)
    }
}

/// A foreground transition and when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForegroundActivation {
    pub id: ActivationId,
    pub at: DateTime<Utc>,
}

/// Turns state changes into [`ForegroundActivation`]s.
///
/// Starts out inactive, so the first `Active` counts as an activation.
#[derive(Debug)]
pub struct AppLifecycle {
    state: AppState,
    next_id: u64,
}

impl AppLifecycle {
    pub fn new() -> Self {
        Self {
            state: AppState::Inactive,
            next_id: 1,
        }
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    /// Records `next`. Returns an activation only for a transition into
    /// `Active` from another state.
    pub fn transition(&mut self, next: AppState, at: DateTime<Utc>) -> Option<ForegroundActivation> {
        let previous = std::mem::replace(&mut self.state, next);
        if next != AppState::Active || previous == AppState::Active {
            return None;
        }

        let id = ActivationId(self.next_id);
        self.next_id += 1;
        Some(ForegroundActivation { id, at })
    }
}

impl Default for AppLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
