//! # Change Records
//!
//! Every mutation accepted by the local store is described by exactly one
//! change record. Two representations exist:
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │ StoredChange (storage layer) │        │ ChangeRecord (domain layer)  │
//! │ ──────────────────────────── │        │ ──────────────────────────── │
//! │ seq         INTEGER          │        │ sequence                     │
//! │ change_id   TEXT (uuid)      │  conv  │ change_id   Uuid             │
//! │ operation   'CREATE'|...     │ ◄────► │ operation   ChangeOperation  │
//! │ initiator   'SYNC_ENGINE'|   │        │ initiator   Local | Remote   │
//! │             'DATA_STORE_API' │        │ record      Record           │
//! │ payload     TEXT (json)      │        │ version     Option<i64>      │
//! │ attempts / synced_at / ...   │        │ timestamp                    │
//! └──────────────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! Conversion lives in [`crate::converter`] and nowhere else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::Record;

// =============================================================================
// Domain Vocabulary
// =============================================================================

/// Origin of a mutation as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Initiator {
    /// Made directly by the caller through the data store API.
    Local,
    /// Applied by the reconciliation loop after arriving from the remote.
    Remote,
}

impl std::fmt::Display for Initiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Initiator::Local => write!(f, "LOCAL"),
            Initiator::Remote => write!(f, "REMOTE"),
        }
    }
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Storage text for this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "CREATE",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeOperation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(ChangeOperation::Create),
            "UPDATE" => Ok(ChangeOperation::Update),
            "DELETE" => Ok(ChangeOperation::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Change Record
// =============================================================================

/// An immutable description of one mutation to one record.
///
/// This is also the notification payload handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique identifier of the change itself (not the record).
    pub change_id: Uuid,

    /// Schema name of the mutated record.
    pub model_name: String,

    /// Record payload. For deletes, the last-known payload.
    pub record: Record,

    /// Kind of mutation.
    pub operation: ChangeOperation,

    /// Who made the change.
    pub initiator: Initiator,

    /// Position in the local change log (monotonic per store).
    pub sequence: i64,

    /// When the change was accepted locally.
    pub timestamp: DateTime<Utc>,

    /// Remote version carried by the change, if known.
    pub version: Option<i64>,
}

impl ChangeRecord {
    /// Creates a change record that has not been written to the log yet.
    pub fn new(record: Record, operation: ChangeOperation, initiator: Initiator) -> Self {
        ChangeRecord {
            change_id: Uuid::new_v4(),
            model_name: record.model_name.clone(),
            record,
            operation,
            initiator,
            sequence: 0,
            timestamp: Utc::now(),
            version: None,
        }
    }

    /// Attaches a remote version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Identifier of the mutated record.
    pub fn record_id(&self) -> &str {
        &self.record.id
    }

    pub fn is_local(&self) -> bool {
        self.initiator == Initiator::Local
    }
}

// =============================================================================
// Storage Representation
// =============================================================================

/// Who wrote a change, in the storage layer's own terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageInitiator {
    /// Written by the sync engine while applying remote data.
    SyncEngine,
    /// Written through the public data store API.
    DataStoreApi,
}

impl StorageInitiator {
    /// Text persisted in the `change_log.initiator` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageInitiator::SyncEngine => "SYNC_ENGINE",
            StorageInitiator::DataStoreApi => "DATA_STORE_API",
        }
    }
}

impl std::str::FromStr for StorageInitiator {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNC_ENGINE" => Ok(StorageInitiator::SyncEngine),
            "DATA_STORE_API" => Ok(StorageInitiator::DataStoreApi),
            other => Err(CoreError::UnknownInitiator(other.to_string())),
        }
    }
}

/// A row of the durable change log.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct StoredChange {
    /// Log position, assigned by the database.
    pub seq: i64,
    pub change_id: String,
    pub model_name: String,
    pub record_id: String,
    /// "CREATE" | "UPDATE" | "DELETE"
    pub operation: String,
    /// "SYNC_ENGINE" | "DATA_STORE_API"
    pub initiator: String,
    /// Record data as JSON text.
    pub payload: String,
    pub version: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Number of failed push attempts.
    pub attempts: i64,
    pub last_error: Option<String>,
    /// When the change was acknowledged (pushed, superseded or remote).
    pub synced_at: Option<DateTime<Utc>>,
}

impl StoredChange {
    /// True while the change still needs to be pushed.
    pub fn is_pending(&self) -> bool {
        self.synced_at.is_none()
    }
}
