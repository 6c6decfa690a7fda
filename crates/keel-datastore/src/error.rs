//! # DataStore Error Type
//!
//! The one error type callers see.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CoreError ──┐                                                         │
//! │  DbError ────┼──► DataStoreError ──► caller                            │
//! │  SyncError ──┘        │                                                 │
//! │                       └── code(): "NOT_INITIALIZED", "NOT_FOUND", ...  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only local mutation failures and lifecycle misuse reach callers. Remote
//! failures surface as sync events and never fail a completed local write.

use thiserror::Error;

use keel_core::CoreError;
use keel_db::DbError;
use keel_sync::SyncError;

pub type DataStoreResult<T> = Result<T, DataStoreError>;

#[derive(Debug, Error)]
pub enum DataStoreError {
    /// The store was terminated, or never finished starting.
    #[error("DataStore is not initialized")]
    NotInitialized,

    /// Declared but not implemented.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(DbError),

    #[error(transparent)]
    Sync(SyncError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<DbError> for DataStoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotInitialized | DbError::Terminated => DataStoreError::NotInitialized,
            other => DataStoreError::Store(other),
        }
    }
}

impl From<SyncError> for DataStoreError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Database(db) => db.into(),
            other if other.is_config_error() => DataStoreError::InvalidConfig(other.to_string()),
            other => DataStoreError::Sync(other),
        }
    }
}

impl DataStoreError {
    /// Machine-readable code for bindings that cannot match on the enum.
    pub fn code(&self) -> &'static str {
        match self {
            DataStoreError::NotInitialized => "NOT_INITIALIZED",
            DataStoreError::Unsupported(_) => "UNSUPPORTED",
            DataStoreError::InvalidConfig(_) => "INVALID_CONFIG",
            DataStoreError::Store(DbError::ConditionNotMet { .. }) => "CONDITION_NOT_MET",
            DataStoreError::Store(DbError::NotFound { .. }) => "NOT_FOUND",
            DataStoreError::Store(DbError::UnknownModel(_)) => "UNKNOWN_MODEL",
            DataStoreError::Store(_) => "STORE_ERROR",
            DataStoreError::Sync(SyncError::InvalidState { .. }) => "INVALID_STATE",
            DataStoreError::Sync(_) => "SYNC_ERROR",
            DataStoreError::Core(_) => "INVALID_PAYLOAD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_sync::SyncState;

    #[test]
    fn test_closed_store_maps_to_not_initialized() {
        assert!(matches!(
            DataStoreError::from(DbError::Terminated),
            DataStoreError::NotInitialized
        ));
        assert!(matches!(
            DataStoreError::from(SyncError::Database(DbError::NotInitialized)),
            DataStoreError::NotInitialized
        ));
    }

    #[test]
    fn test_error_codes() {
        let err = DataStoreError::from(DbError::condition_not_met("Note", "A"));
        assert_eq!(err.code(), "CONDITION_NOT_MET");

        let err = DataStoreError::from(SyncError::MissingDeviceId);
        assert_eq!(err.code(), "INVALID_CONFIG");

        let err = DataStoreError::from(SyncError::InvalidState {
            state: SyncState::Failed,
            operation: "start",
        });
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(err.to_string(), "Cannot start while sync is failed");
    }
}
