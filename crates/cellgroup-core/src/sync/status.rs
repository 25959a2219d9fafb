use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{capitalize, pluralize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "Idle"),
            SyncState::Syncing => write!(f, "Syncing"),
            SyncState::Success => write!(f, "Synced"),
            SyncState::Error => write!(f, "Sync error"),
        }
    }
}

/// Snapshot published to observers after every state or queue change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SyncStatus {
    pub state: SyncState,
    pub message: Option<String>,
    /// Operations still waiting to reach the server.
    pub pending_count: usize,
    /// Operations that gave up and need the user to retry or discard them.
    pub failed_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Why a drain was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    ConnectivityRestored,
    Enqueued,
    Manual,
}

/// Tally of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Confirmed by the server and removed from the queue.
    pub applied: usize,
    /// Failed transiently and stay pending for the next drain.
    pub deferred: usize,
    /// Failed transiently for the last allowed time.
    pub exhausted: usize,
    /// Rejected by the server.
    pub rejected: usize,
    /// Skipped because an earlier operation on the same entity was deferred.
    pub held_back: usize,
    /// The pass stopped early because the network went away.
    pub interrupted: bool,
}

impl DrainReport {
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.deferred == 0 && self.exhausted == 0 && self.rejected == 0
    }

    /// User-facing summary. Mentions counts only, never transport errors.
    pub fn summary(&self, pending: usize) -> String {
        if self.is_success() {
            return format!("Synced {}", pluralize(self.applied, "change"));
        }

        let mut parts = Vec::new();
        let given_up = self.exhausted + self.rejected;
        if given_up > 0 {
            parts.push(format!("{} could not be synced", pluralize(given_up, "change")));
        }
        if self.interrupted {
            parts.push("connection lost".to_string());
        }
        if pending > 0 {
            parts.push(format!("{} waiting to sync", pluralize(pending, "change")));
        }
        if parts.is_empty() {
            parts.push("sync incomplete".to_string());
        }

        capitalize(&parts.join("; "))
    }
}

/// Result of asking for a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain is in flight; this request did nothing.
    AlreadyRunning,
    /// The device is offline; nothing was attempted.
    Offline,
    /// There was nothing to send.
    Empty,
    Completed(DrainReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_summary() {
        let report = DrainReport {
            applied: 1,
            ..Default::default()
        };
        assert!(report.is_success());
        assert_eq!(report.summary(0), "Synced 1 change");
    }

    #[test]
    fn test_error_summary_counts_only() {
        let report = DrainReport {
            applied: 2,
            rejected: 1,
            deferred: 1,
            ..Default::default()
        };
        assert!(!report.is_success());
        assert_eq!(
            report.summary(1),
            "1 change could not be synced; 1 change waiting to sync"
        );
    }

    #[test]
    fn test_interrupted_summary() {
        let report = DrainReport {
            applied: 1,
            interrupted: true,
            ..Default::default()
        };
        assert_eq!(report.summary(3), "Connection lost; 3 changes waiting to sync");
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = SyncStatus {
            state: SyncState::Syncing,
            pending_count: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "syncing");
        assert_eq!(json["pendingCount"], 2);
    }
}
