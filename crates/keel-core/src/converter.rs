//! # Change Converter
//!
//! Maps between the storage layer's [`StoredChange`] rows and the domain's
//! [`ChangeRecord`]s.
//!
//! ```text
//!   storage vocabulary               domain vocabulary
//!   ──────────────────               ─────────────────
//!   SYNC_ENGINE      ──────────────► REMOTE
//!   DATA_STORE_API   ──────────────► LOCAL
//! ```
//!
//! This module is the only place allowed to translate initiators. Adding a
//! new initiator means adding it here and in the two enums, nowhere else.

use chrono::Utc;
use uuid::Uuid;

use crate::change::{ChangeRecord, Initiator, StorageInitiator, StoredChange};
use crate::error::{CoreError, CoreResult};
use crate::types::Record;

/// Stateless converter between durable and in-memory change records.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeConverter;

impl ChangeConverter {
    /// Storage initiator used when writing a change made by `initiator`.
    pub fn storage_initiator(initiator: Initiator) -> StorageInitiator {
        match initiator {
            Initiator::Local => StorageInitiator::DataStoreApi,
            Initiator::Remote => StorageInitiator::SyncEngine,
        }
    }

    /// Domain initiator for a change written by `initiator`.
    pub fn domain_initiator(initiator: StorageInitiator) -> Initiator {
        match initiator {
            StorageInitiator::SyncEngine => Initiator::Remote,
            StorageInitiator::DataStoreApi => Initiator::Local,
        }
    }

    /// Converts a change-log row into a change record.
    ///
    /// ## Errors
    /// `CoreError::UnknownInitiator`, `CoreError::UnknownOperation` or
    /// `CoreError::MalformedChange` when the row was not written by this
    /// converter.
    pub fn to_change_record(stored: &StoredChange) -> CoreResult<ChangeRecord> {
        let change_id = Uuid::parse_str(&stored.change_id)
            .map_err(|e| CoreError::malformed(&stored.change_id, e.to_string()))?;
        let initiator: StorageInitiator = stored.initiator.parse()?;
        let operation = stored.operation.parse()?;
        let data: serde_json::Value = serde_json::from_str(&stored.payload)
            .map_err(|e| CoreError::malformed(&stored.change_id, e.to_string()))?;

        Ok(ChangeRecord {
            change_id,
            model_name: stored.model_name.clone(),
            record: Record::new(&stored.model_name, &stored.record_id, data),
            operation,
            initiator: Self::domain_initiator(initiator),
            sequence: stored.seq,
            timestamp: stored.created_at,
            version: stored.version,
        })
    }

    /// Converts a change record into a change-log row.
    ///
    /// Remote changes are written already acknowledged: they came from the
    /// remote and must never be pushed back.
    pub fn to_stored(change: &ChangeRecord) -> CoreResult<StoredChange> {
        if change.model_name != change.record.model_name {
            return Err(CoreError::malformed(
                change.change_id.to_string(),
                format!(
                    "change model {} does not match record model {}",
                    change.model_name, change.record.model_name
                ),
            ));
        }
        let payload = serde_json::to_string(&change.record.data)
            .map_err(|e| CoreError::malformed(change.change_id.to_string(), e.to_string()))?;

        let synced_at = match change.initiator {
            Initiator::Remote => Some(Utc::now()),
            Initiator::Local => None,
        };

        Ok(StoredChange {
            seq: change.sequence,
            change_id: change.change_id.to_string(),
            model_name: change.model_name.clone(),
            record_id: change.record.id.clone(),
            operation: change.operation.as_str().to_string(),
            initiator: Self::storage_initiator(change.initiator).as_str().to_string(),
            payload,
            version: change.version,
            created_at: change.timestamp,
            attempts: 0,
            last_error: None,
            synced_at,
        })
    }
}
