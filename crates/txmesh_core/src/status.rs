//! Lifecycle and synchronization states.

use std::fmt;

/// Lifecycle state of the coordinator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterStatus {
    /// `init` has not run (or `fini` has).
    NotInitialized,
    /// Configuration validated, not connected.
    Initialized,
    /// Connected and serving transactions.
    Started,
    /// `start` hit an unrecoverable error.
    Failed,
}

impl ClusterStatus {
    /// Returns true if the coordinator is serving transactions.
    #[must_use]
    pub fn is_started(self) -> bool {
        self == ClusterStatus::Started
    }

    /// Returns true once `init` has succeeded and until `fini`.
    #[must_use]
    pub fn is_initialized(self) -> bool {
        self != ClusterStatus::NotInitialized
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterStatus::NotInitialized => "NOT_INITIALIZED",
            ClusterStatus::Initialized => "INITIALIZED",
            ClusterStatus::Started => "STARTED",
            ClusterStatus::Failed => "FAILED",
        })
    }
}

/// Synchronization state of one resource manager.
///
/// ```text
/// UNREGISTERED → UNDETERMINED → { LATE | POST_SYNC_PROCESSING }
/// LATE → SYNCHRONIZING → POST_SYNC_PROCESSING → { UP_TO_DATE | UNDETERMINED }
/// ```
///
/// Every state except `UNREGISTERED` may fall back to `UNDETERMINED`, and
/// every state may move to `UNREGISTERED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Not registered with the coordinator.
    Unregistered,
    /// Position relative to the cluster is unknown.
    Undetermined,
    /// Behind the cluster, waiting for catch-up.
    Late,
    /// Replaying missing journal entries from a peer.
    Synchronizing,
    /// Running the post-sync hook.
    PostSyncProcessing,
    /// Trusted, accepts new transactions.
    UpToDate,
}

impl SyncState {
    /// Returns true if a resource manager may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (_, Unregistered) => true,
            (Unregistered, Undetermined) => true,
            (Unregistered, _) => false,
            (Undetermined, Late | PostSyncProcessing) => true,
            (Late, Synchronizing) => true,
            (Synchronizing, PostSyncProcessing) => true,
            (PostSyncProcessing, UpToDate) => true,
            (Late | Synchronizing | PostSyncProcessing | UpToDate, Undetermined) => true,
            _ => false,
        }
    }

    /// Returns true if the resource manager accepts new transactions.
    #[must_use]
    pub fn accepts_transactions(self) -> bool {
        self == SyncState::UpToDate
    }

    /// Returns true while the synchronizer owns the resource manager.
    #[must_use]
    pub fn is_synchronizing(self) -> bool {
        matches!(
            self,
            SyncState::Synchronizing | SyncState::PostSyncProcessing
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncState::Unregistered => "UNREGISTERED",
            SyncState::Undetermined => "UNDETERMINED",
            SyncState::Late => "LATE",
            SyncState::Synchronizing => "SYNCHRONIZING",
            SyncState::PostSyncProcessing => "POST_SYNC_PROCESSING",
            SyncState::UpToDate => "UP_TO_DATE",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SyncState; 6] = [
        SyncState::Unregistered,
        SyncState::Undetermined,
        SyncState::Late,
        SyncState::Synchronizing,
        SyncState::PostSyncProcessing,
        SyncState::UpToDate,
    ];

    #[test]
    fn up_to_date_only_from_post_sync() {
        for from in ALL {
            let allowed = from.can_transition_to(SyncState::UpToDate);
            assert_eq!(allowed, from == SyncState::PostSyncProcessing, "{from}");
        }
    }

    #[test]
    fn late_never_jumps_ahead() {
        assert!(!SyncState::Late.can_transition_to(SyncState::UpToDate));
        assert!(!SyncState::Late.can_transition_to(SyncState::PostSyncProcessing));
        assert!(SyncState::Late.can_transition_to(SyncState::Synchronizing));
    }

    #[test]
    fn unregistered_only_reenters_undetermined() {
        for to in ALL {
            let allowed = SyncState::Unregistered.can_transition_to(to);
            assert_eq!(
                allowed,
                matches!(to, SyncState::Undetermined | SyncState::Unregistered)
            );
        }
    }

    #[test]
    fn display_names() {
        assert_eq!(SyncState::PostSyncProcessing.to_string(), "POST_SYNC_PROCESSING");
        assert_eq!(ClusterStatus::NotInitialized.to_string(), "NOT_INITIALIZED");
        assert!(SyncState::UpToDate.accepts_transactions());
        assert!(!SyncState::Late.accepts_transactions());
    }
}
