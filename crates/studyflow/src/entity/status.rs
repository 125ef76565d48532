use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Processing status of a tracked entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Pending,
    Extracting,
    PreviewReady,
    Ready,
    Failed,
    Cancelled,
}

impl EntityStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [EntityStatus; 6] = [
        EntityStatus::Pending,
        EntityStatus::Extracting,
        EntityStatus::PreviewReady,
        EntityStatus::Ready,
        EntityStatus::Failed,
        EntityStatus::Cancelled,
    ];

    /// Returns true for `failed` and `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, EntityStatus::Failed | EntityStatus::Cancelled)
    }

    /// Returns true while the backend is still working on the entity.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            EntityStatus::Pending | EntityStatus::Extracting | EntityStatus::PreviewReady
        )
    }

    fn rank(self) -> u8 {
        match self {
            EntityStatus::Pending => 0,
            EntityStatus::Extracting => 1,
            EntityStatus::PreviewReady => 2,
            EntityStatus::Ready => 3,
            EntityStatus::Failed | EntityStatus::Cancelled => 4,
        }
    }

    /// Whether a write moving from `self` to `next` is allowed.
    ///
    /// Staying on the same status is always allowed (progress updates).
    /// Terminal statuses never move. `failed`/`cancelled` are reachable from
    /// every other status; everything else only moves forward.
    pub fn can_transition_to(self, next: EntityStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityStatus::Pending => "pending",
            EntityStatus::Extracting => "extracting",
            EntityStatus::PreviewReady => "preview_ready",
            EntityStatus::Ready => "ready",
            EntityStatus::Failed => "failed",
            EntityStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown entity status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for EntityStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntityStatus::Pending),
            "extracting" => Ok(EntityStatus::Extracting),
            "preview_ready" => Ok(EntityStatus::PreviewReady),
            "ready" => Ok(EntityStatus::Ready),
            "failed" => Ok(EntityStatus::Failed),
            "cancelled" => Ok(EntityStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
