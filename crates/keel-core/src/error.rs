//! # Error Types
//!
//! Domain-specific error types for keel-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  keel-core errors (this file)                                          │
//! │  └── CoreError        - Malformed records / changes / schemas          │
//! │                                                                         │
//! │  keel-db errors (separate crate)                                       │
//! │  └── DbError          - Local store failures                           │
//! │                                                                         │
//! │  keel-sync errors (separate crate)                                     │
//! │  └── SyncError        - Reconciliation failures                        │
//! │                                                                         │
//! │  Flow: CoreError → DbError → SyncError / DataStoreError → caller       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Core data model errors.
///
/// The model itself is total; these only arise from malformed input, e.g. a
/// change-log row written by a newer build or a payload that is not JSON.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A stored change could not be converted into a change record.
    #[error("Malformed change {change_id}: {reason}")]
    MalformedChange { change_id: String, reason: String },

    /// Storage initiator text not recognised by the converter.
    #[error("Unknown initiator of storage change: {0}")]
    UnknownInitiator(String),

    /// Operation text not recognised by the converter.
    #[error("Unknown type of storage change: {0}")]
    UnknownOperation(String),

    /// A record payload could not be mapped to or from a typed model.
    #[error("Invalid {model} payload: {reason}")]
    InvalidPayload { model: String, reason: String },

    /// Schema definition problem (empty name, duplicate registration).
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
}

impl CoreError {
    /// Creates a MalformedChange error.
    pub fn malformed(change_id: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::MalformedChange {
            change_id: change_id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::malformed("abc", "payload is not JSON");
        assert_eq!(err.to_string(), "Malformed change abc: payload is not JSON");

        let err = CoreError::UnknownInitiator("PLUGIN".into());
        assert!(err.to_string().contains("PLUGIN"));
    }
}
