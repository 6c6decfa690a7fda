//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │     Lifecycle           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Conflict       │  │  InvalidState           │ │
//! │  │  MissingDeviceId│  │  Transient      │  │  ShuttingDown           │ │
//! │  │  ConfigLoad/Save│  │  Fatal          │  │  ChannelError           │ │
//! │  │                 │  │  SchemaMismatch │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Database (local store)                                         │   │
//! │  │  NotInitialized / ConditionNotMet / NotFound / QueryFailed ...  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient errors are retried and never reach callers. Fatal errors move
//! the orchestrator to `Failed`. A `Conflict` is always recovered by applying
//! the remote's record.

use thiserror::Error;

use keel_db::DbError;

use crate::remote::RemoteModel;
use crate::status::SyncState;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote rejected a push because the base version is stale.
    /// Carries the remote's authoritative copy.
    #[error("Conflict on {}/{}: remote is at version {}", remote.record.model_name, remote.record.id, remote.version)]
    Conflict { remote: Box<RemoteModel> },

    /// Network-level or throttling failure; retry with backoff.
    #[error("Transient remote failure: {0}")]
    Transient(String),

    /// Unrecoverable remote failure (auth revoked, protocol error).
    #[error("Fatal remote failure: {0}")]
    Fatal(String),

    /// The remote does not know the model.
    #[error("Remote schema mismatch: {0}")]
    SchemaMismatch(String),

    // =========================================================================
    // Local Store Errors
    // =========================================================================
    /// Local store failure.
    #[error(transparent)]
    Database(#[from] DbError),

    /// Failed to (de)serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation not allowed in the orchestrator's current state.
    #[error("Cannot {operation} while sync is {state}")]
    InvalidState {
        state: SyncState,
        operation: &'static str,
    },

    /// Orchestrator is shutting down.
    #[error("Sync is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal orchestrator error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Creates a conflict error from the remote's current copy.
    pub fn conflict(remote: RemoteModel) -> Self {
        SyncError::Conflict {
            remote: Box::new(remote),
        }
    }

    /// Returns true if the operation can be retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Returns true if this error should move the orchestrator to `Failed`.
    ///
    /// A broken local store is fatal too. Per-record outcomes such as
    /// `NotFound` are not.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Fatal(_) | SyncError::SchemaMismatch(_) | SyncError::Internal(_) => true,
            SyncError::Database(err) => matches!(
                err,
                DbError::ConnectionFailed(_)
                    | DbError::MigrationFailed(_)
                    | DbError::QueryFailed(_)
                    | DbError::Core(_)
                    | DbError::Internal(_)
            ),
            _ => false,
        }
    }

    /// Returns true if the local store went away underneath the orchestrator.
    pub fn is_store_closed(&self) -> bool {
        matches!(
            self,
            SyncError::Database(DbError::NotInitialized | DbError::Terminated)
        )
    }

    /// Returns true if this is a configuration error.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
