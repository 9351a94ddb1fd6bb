//! Status indicator.
//!
//! Maps a [`SyncState`] to the single notice shown to the user. Offline
//! beats syncing, syncing beats an error, an error beats the synced toast,
//! and the toast beats a pending-count reminder. An idle, online state with
//! an empty queue shows nothing.

use std::time::Duration;

use crate::orchestrator::{SyncState, SyncStatus};

/// How long the synced toast stays up.
pub const SYNCED_TOAST_DURATION: Duration = Duration::from_secs(2);

/// What the status indicator displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// The network is unusable.
    Offline {
        /// Mutations waiting for connectivity.
        pending: usize,
    },
    /// A drain is running.
    Syncing,
    /// The last drain could not run.
    Failed,
    /// The last drain finished.
    Synced,
    /// Mutations are waiting while online.
    Pending {
        /// Mutations waiting.
        count: usize,
    },
}

/// User action offered next to a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorAction {
    /// Run the sync again after a failure.
    Retry,
    /// Run the sync now.
    SyncNow,
}

impl IndicatorAction {
    /// Button label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Retry => "Retry",
            Self::SyncNow => "Sync now",
        }
    }
}

impl Indicator {
    /// The notice for a state, if any.
    #[must_use]
    pub fn from_state(state: &SyncState) -> Option<Self> {
        if !state.is_online {
            return Some(Self::Offline {
                pending: state.pending_count,
            });
        }
        match state.sync_status {
            SyncStatus::Syncing => Some(Self::Syncing),
            SyncStatus::Error => Some(Self::Failed),
            SyncStatus::Synced => Some(Self::Synced),
            SyncStatus::Idle if state.pending_count > 0 => Some(Self::Pending {
                count: state.pending_count,
            }),
            SyncStatus::Idle => None,
        }
    }

    /// Text of the notice.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Offline { pending: 0 } => {
                "You're offline. Changes will be saved locally.".to_string()
            }
            Self::Offline { pending } => format!(
                "You're offline. {} {} waiting to sync.",
                pending,
                changes(*pending)
            ),
            Self::Syncing => "Syncing your changes...".to_string(),
            Self::Failed => "Sync failed. Your changes are still saved locally.".to_string(),
            Self::Synced => "All changes synced.".to_string(),
            Self::Pending { count } => format!("{} {} waiting to sync.", count, changes(*count)),
        }
    }

    /// Action offered with the notice.
    #[must_use]
    pub fn action(&self) -> Option<IndicatorAction> {
        match self {
            Self::Failed => Some(IndicatorAction::Retry),
            Self::Pending { .. } => Some(IndicatorAction::SyncNow),
            _ => None,
        }
    }

    /// How long the notice stays up on its own, if it dismisses itself.
    #[must_use]
    pub fn auto_dismiss(&self) -> Option<Duration> {
        match self {
            Self::Synced => Some(SYNCED_TOAST_DURATION),
            _ => None,
        }
    }
}

impl std::fmt::Display for Indicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

fn changes(count: usize) -> &'static str {
    if count == 1 {
        "change"
    } else {
        "changes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(is_online: bool, sync_status: SyncStatus, pending_count: usize) -> SyncState {
        SyncState {
            is_online,
            sync_status,
            pending_count,
        }
    }

    #[test]
    fn test_offline_takes_precedence() {
        let indicator = Indicator::from_state(&state(false, SyncStatus::Syncing, 3));
        assert_eq!(indicator, Some(Indicator::Offline { pending: 3 }));
    }

    #[test]
    fn test_online_statuses() {
        assert_eq!(
            Indicator::from_state(&state(true, SyncStatus::Syncing, 2)),
            Some(Indicator::Syncing)
        );
        assert_eq!(
            Indicator::from_state(&state(true, SyncStatus::Error, 2)),
            Some(Indicator::Failed)
        );
        assert_eq!(
            Indicator::from_state(&state(true, SyncStatus::Synced, 1)),
            Some(Indicator::Synced)
        );
        assert_eq!(
            Indicator::from_state(&state(true, SyncStatus::Idle, 4)),
            Some(Indicator::Pending { count: 4 })
        );
    }

    #[test]
    fn test_idle_online_empty_shows_nothing() {
        assert_eq!(Indicator::from_state(&state(true, SyncStatus::Idle, 0)), None);
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            Indicator::Offline { pending: 0 }.message(),
            "You're offline. Changes will be saved locally."
        );
        assert_eq!(
            Indicator::Offline { pending: 1 }.message(),
            "You're offline. 1 change waiting to sync."
        );
        assert_eq!(
            Indicator::Pending { count: 2 }.to_string(),
            "2 changes waiting to sync."
        );
    }

    #[test]
    fn test_actions() {
        assert_eq!(Indicator::Failed.action(), Some(IndicatorAction::Retry));
        assert_eq!(
            Indicator::Pending { count: 1 }.action().map(|a| a.label()),
            Some("Sync now")
        );
        assert_eq!(Indicator::Syncing.action(), None);
        assert_eq!(Indicator::Offline { pending: 5 }.action(), None);
    }

    #[test]
    fn test_only_synced_dismisses_itself() {
        assert_eq!(Indicator::Synced.auto_dismiss(), Some(Duration::from_secs(2)));
        assert_eq!(Indicator::Failed.auto_dismiss(), None);
    }
}
