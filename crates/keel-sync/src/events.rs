//! # Sync Events
//!
//! Notifications about sync progress and failures, fanned out over a
//! broadcast channel. Events are informational: a subscriber that lags loses
//! events, never data. The change log stays the source of truth.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::status::SyncState;

/// Which remote call an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Push,
    Query,
    Subscribe,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOperation::Push => write!(f, "push"),
            SyncOperation::Query => write!(f, "query"),
            SyncOperation::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Something the sync engine did or ran into.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    StateChanged { state: SyncState },

    /// A catch-up pass over one model finished.
    CatchUpCompleted {
        model_name: String,
        applied: usize,
        full: bool,
    },

    /// A local change was acknowledged by the remote.
    Pushed {
        change_id: Uuid,
        model_name: String,
        record_id: String,
        version: i64,
    },

    /// The remote rejected a local change; its copy replaced the local one.
    ConflictResolved {
        change_id: Uuid,
        model_name: String,
        record_id: String,
        remote_version: i64,
    },

    /// A remote change was applied locally.
    RemoteApplied {
        model_name: String,
        record_id: String,
        version: i64,
    },

    /// One failed attempt of a retried remote call.
    TransientError {
        operation: SyncOperation,
        model_name: String,
        change_id: Option<Uuid>,
        attempt: u32,
        message: String,
    },

    /// A change ran out of attempts for this pass and stays pending.
    PushDeferred {
        change_id: Uuid,
        model_name: String,
        attempts: u32,
        message: String,
    },

    /// Sync stopped on an unrecoverable error.
    Fatal { message: String },
}

impl SyncEvent {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SyncEvent::TransientError { .. } | SyncEvent::PushDeferred { .. } | SyncEvent::Fatal { .. }
        )
    }
}

/// Broadcast fan-out for [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Logs the event and sends it to current subscribers.
    pub fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::StateChanged { state } => info!(%state, "Sync state changed"),
            SyncEvent::CatchUpCompleted {
                model_name,
                applied,
                full,
            } => info!(model = %model_name, applied, full, "Catch-up completed"),
            SyncEvent::Pushed {
                change_id,
                model_name,
                version,
                ..
            } => debug!(%change_id, model = %model_name, version, "Change pushed"),
            SyncEvent::ConflictResolved {
                change_id,
                model_name,
                record_id,
                remote_version,
            } => info!(
                %change_id,
                model = %model_name,
                id = %record_id,
                remote_version,
                "Conflict resolved in favour of remote"
            ),
            SyncEvent::RemoteApplied {
                model_name,
                record_id,
                version,
            } => debug!(model = %model_name, id = %record_id, version, "Remote change applied"),
            SyncEvent::TransientError {
                operation,
                model_name,
                attempt,
                message,
                ..
            } => warn!(%operation, model = %model_name, attempt, error = %message, "Transient sync error"),
            SyncEvent::PushDeferred {
                change_id,
                model_name,
                attempts,
                message,
            } => warn!(
                %change_id,
                model = %model_name,
                attempts,
                error = %message,
                "Push deferred to next pass"
            ),
            SyncEvent::Fatal { message } => error!(error = %message, "Sync failed"),
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::StateChanged {
            state: SyncState::Syncing,
        });
        bus.emit(SyncEvent::Fatal {
            message: "boom".into(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::StateChanged {
                state: SyncState::Syncing
            }
        );
        assert!(rx.recv().await.unwrap().is_error());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(1);
        bus.emit(SyncEvent::Fatal {
            message: "nobody listening".into(),
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = SyncEvent::TransientError {
            operation: SyncOperation::Push,
            model_name: "Note".into(),
            change_id: None,
            attempt: 2,
            message: "timeout".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transient_error");
        assert_eq!(json["operation"], "push");
        assert_eq!(json["attempt"], 2);
    }
}
