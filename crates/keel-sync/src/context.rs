//! Shared handles for the orchestrator's background tasks.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};

use keel_db::LocalStore;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::locks::RecordLocks;
use crate::remote::RemoteSyncClient;
use crate::status::SyncState;

#[derive(Debug, Clone, Default)]
pub(crate) struct StatusTracker {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Everything a sync task needs, cheap to clone.
#[derive(Clone)]
pub(crate) struct SyncContext {
    pub store: Arc<LocalStore>,
    pub remote: Arc<dyn RemoteSyncClient>,
    pub config: Arc<SyncConfig>,
    pub locks: RecordLocks,
    pub events: EventBus,
    pub state: Arc<watch::Sender<SyncState>>,
    pub status: Arc<RwLock<StatusTracker>>,
}

impl SyncContext {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteSyncClient>, config: SyncConfig) -> Self {
        let (state, _) = watch::channel(SyncState::Stopped);
        SyncContext {
            store,
            remote,
            events: EventBus::new(config.sync.event_capacity),
            config: Arc::new(config),
            locks: RecordLocks::new(),
            state: Arc::new(state),
            status: Arc::new(RwLock::new(StatusTracker::default())),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: SyncState) {
        if self.state.send_replace(state) != state {
            self.events.emit(SyncEvent::StateChanged { state });
        }
    }

    /// Moves `from -> to`; does nothing if the state is no longer `from`.
    pub fn transition(&self, from: SyncState, to: SyncState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        });
        if moved {
            self.events.emit(SyncEvent::StateChanged { state: to });
        }
        moved
    }

    /// Emits an event and folds it into the status snapshot.
    pub async fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::Pushed { .. } | SyncEvent::CatchUpCompleted { .. } => {
                self.status.write().await.last_sync = Some(Utc::now());
            }
            SyncEvent::TransientError { message, .. }
            | SyncEvent::PushDeferred { message, .. }
            | SyncEvent::Fatal { message } => {
                self.status.write().await.last_error = Some(message.clone());
            }
            _ => {}
        }
        self.events.emit(event);
    }

    /// Reports an unrecoverable error and moves to `Failed`.
    pub async fn fail(&self, err: SyncError) {
        self.emit(SyncEvent::Fatal {
            message: err.to_string(),
        })
        .await;
        self.set_state(SyncState::Failed);
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        let initial = self.config.initial_backoff();
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: self.config.max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Sleeps for `delay` unless shutdown is requested first.
///
/// Returns true if shutdown was requested.
pub(crate) async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
