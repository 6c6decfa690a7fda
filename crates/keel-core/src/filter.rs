//! # Observation Filters
//!
//! Pure predicates over emitted change records. A filter is evaluated once
//! per change, so it must stay cheap and side-effect free.
//!
//! ```text
//!   ObservationFilter::All                    every change
//!   ObservationFilter::Model("Note")          changes to any Note
//!   ObservationFilter::Record{Note, "A"}      changes to Note "A"
//! ```
//!
//! Filtering by an arbitrary [`QueryPredicate`](crate::QueryPredicate) is not
//! offered here; see `DataStore::observe_where`.

use crate::change::{ChangeRecord, Initiator};

/// Selects which change records an observation receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ObservationFilter {
    /// Every change.
    #[default]
    All,
    /// Changes to records of one model.
    Model(String),
    /// Changes to a single record.
    Record { model_name: String, id: String },
    /// Changes made by one initiator (used by the outbound processor).
    Initiator(Initiator),
}

impl ObservationFilter {
    pub fn model(model_name: impl Into<String>) -> Self {
        ObservationFilter::Model(model_name.into())
    }

    pub fn record(model_name: impl Into<String>, id: impl Into<String>) -> Self {
        ObservationFilter::Record {
            model_name: model_name.into(),
            id: id.into(),
        }
    }

    /// Returns true if the change should be delivered.
    pub fn matches(&self, change: &ChangeRecord) -> bool {
        match self {
            ObservationFilter::All => true,
            ObservationFilter::Model(model_name) => &change.model_name == model_name,
            ObservationFilter::Record { model_name, id } => {
                &change.model_name == model_name && change.record_id() == id
            }
            ObservationFilter::Initiator(initiator) => change.initiator == *initiator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeOperation;
    use crate::types::Record;
    use serde_json::json;

    fn change(model: &str, id: &str, initiator: Initiator) -> ChangeRecord {
        ChangeRecord::new(
            Record::new(model, id, json!({})),
            ChangeOperation::Update,
            initiator,
        )
    }

    #[test]
    fn test_all_matches_everything() {
        assert!(ObservationFilter::All.matches(&change("Note", "A", Initiator::Local)));
        assert!(ObservationFilter::default().matches(&change("Todo", "B", Initiator::Remote)));
    }

    #[test]
    fn test_model_filter() {
        let filter = ObservationFilter::model("Note");
        assert!(filter.matches(&change("Note", "A", Initiator::Local)));
        assert!(!filter.matches(&change("Todo", "A", Initiator::Local)));
    }

    #[test]
    fn test_record_filter_needs_model_and_id() {
        let filter = ObservationFilter::record("Note", "A");
        assert!(filter.matches(&change("Note", "A", Initiator::Remote)));
        assert!(!filter.matches(&change("Note", "B", Initiator::Remote)));
        assert!(!filter.matches(&change("Todo", "A", Initiator::Remote)));
    }

    #[test]
    fn test_initiator_filter() {
        let filter = ObservationFilter::Initiator(Initiator::Local);
        assert!(filter.matches(&change("Note", "A", Initiator::Local)));
        assert!(!filter.matches(&change("Note", "A", Initiator::Remote)));
    }
}
