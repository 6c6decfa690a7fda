//! # Sync Status
//!
//! Orchestrator states and the status snapshot exposed to callers.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌─────────┐ start() ┌──────────┐ catch-up ┌─────────┐                │
//! │   │ Stopped │────────►│ Starting │─────────►│ Syncing │                │
//! │   └────▲────┘         └────┬─────┘   done   └────┬────┘                │
//! │        │                   │ stop()              │ stop()              │
//! │        │              ┌────▼─────┐               │                     │
//! │        └──────────────│ Stopping │◄──────────────┘                     │
//! │          drained or   └──────────┘                                     │
//! │          timed out                                                     │
//! │                                                                         │
//! │   unrecoverable error from Starting/Syncing/Stopping ──► Failed       │
//! │   Failed ── reset() ──► Stopped                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SyncMode;

/// Lifecycle state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Stopped,
    /// Subscriptions are open and the catch-up pass is running.
    Starting,
    /// Steady state: pushing local changes and applying remote ones.
    Syncing,
    /// Draining in-flight pushes.
    Stopping,
    /// Stopped on an unrecoverable error. Only `reset()` leaves this state.
    Failed,
}

impl SyncState {
    /// True while background sync tasks may be running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Starting | SyncState::Syncing)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Stopped => write!(f, "stopped"),
            SyncState::Starting => write!(f, "starting"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Stopping => write!(f, "stopping"),
            SyncState::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub mode: SyncMode,
    /// Local changes not yet acknowledged by the remote.
    pub pending_count: i64,
    /// Last successful push or catch-up.
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(SyncState::Starting.is_active());
        assert!(SyncState::Syncing.is_active());
        assert!(!SyncState::Stopped.is_active());
        assert!(!SyncState::Stopping.is_active());
        assert!(!SyncState::Failed.is_active());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&SyncState::Syncing).unwrap(), "\"syncing\"");
        assert_eq!(SyncState::Failed.to_string(), "failed");
    }
}
