use super::status::EntityStatus;

/// Classification of a push-carried status change.
///
/// The realtime reconciler matches on this exhaustively, so adding a new
/// status forces every handling site to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status unchanged; counters or timestamps moved.
    Progress { status: EntityStatus },
    /// Forward step whose row carries everything the cache needs.
    Advance { from: EntityStatus, to: EntityStatus },
    /// Entered `preview_ready`; the pushed row lacks derived payload fields.
    NeedsRefetch { from: EntityStatus },
    /// Entered `failed` or `cancelled`.
    Terminal { from: EntityStatus, to: EntityStatus },
    /// Backwards step or a change after a terminal status.
    Rejected { from: EntityStatus, to: EntityStatus },
}

impl Transition {
    pub fn classify(from: EntityStatus, to: EntityStatus) -> Self {
        if from == to {
            return Transition::Progress { status: to };
        }
        if !from.can_transition_to(to) {
            return Transition::Rejected { from, to };
        }
        match to {
            EntityStatus::Failed | EntityStatus::Cancelled => Transition::Terminal { from, to },
            EntityStatus::PreviewReady => Transition::NeedsRefetch { from },
            EntityStatus::Pending | EntityStatus::Extracting | EntityStatus::Ready => {
                Transition::Advance { from, to }
            }
        }
    }

    pub fn needs_refetch(&self) -> bool {
        matches!(self, Transition::NeedsRefetch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_ready_needs_refetch() {
        assert_eq!(
            Transition::classify(EntityStatus::Extracting, EntityStatus::PreviewReady),
            Transition::NeedsRefetch {
                from: EntityStatus::Extracting
            }
        );
        assert!(Transition::classify(EntityStatus::Pending, EntityStatus::PreviewReady)
            .needs_refetch());
    }

    #[test]
    fn test_same_status_is_progress() {
        assert_eq!(
            Transition::classify(EntityStatus::PreviewReady, EntityStatus::PreviewReady),
            Transition::Progress {
                status: EntityStatus::PreviewReady
            }
        );
    }

    #[test]
    fn test_ready_is_plain_advance() {
        assert_eq!(
            Transition::classify(EntityStatus::PreviewReady, EntityStatus::Ready),
            Transition::Advance {
                from: EntityStatus::PreviewReady,
                to: EntityStatus::Ready
            }
        );
    }

    #[test]
    fn test_backwards_and_post_terminal_rejected() {
        assert!(matches!(
            Transition::classify(EntityStatus::Ready, EntityStatus::Extracting),
            Transition::Rejected { .. }
        ));
        assert!(matches!(
            Transition::classify(EntityStatus::Failed, EntityStatus::Ready),
            Transition::Rejected { .. }
        ));
    }

    #[test]
    fn test_failure_is_terminal() {
        assert!(matches!(
            Transition::classify(EntityStatus::Extracting, EntityStatus::Failed),
            Transition::Terminal { .. }
        ));
    }
}
