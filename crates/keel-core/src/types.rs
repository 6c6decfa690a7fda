//! # Domain Types
//!
//! Records, typed models and the schema registry.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Record       │   │   ModelSchema   │   │ SchemaRegistry  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │   │  name           │   │  name → schema  │       │
//! │  │  model_name     │   │  version        │   │  (ordered)      │       │
//! │  │  data (JSON)    │   └─────────────────┘   └─────────────────┘       │
//! │  └────────┬────────┘                                                    │
//! │           │ to_record() / from_record()                                 │
//! │  ┌────────┴────────┐                                                    │
//! │  │  impl Model     │  (caller's typed structs: Note, Todo, ...)        │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! A record is keyed by `(model_name, id)`. The core never looks inside
//! `data` except when evaluating a [`QueryPredicate`](crate::QueryPredicate).

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Record
// =============================================================================

/// An application-defined entity, stored as an opaque JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable unique identifier within the model.
    pub id: String,

    /// Schema/class name of the record (e.g. "Note").
    pub model_name: String,

    /// The record's fields.
    pub data: serde_json::Value,
}

impl Record {
    /// Creates a new record.
    pub fn new(
        model_name: impl Into<String>,
        id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Record {
            id: id.into(),
            model_name: model_name.into(),
            data,
        }
    }

    /// Looks up a top-level field. `id` resolves to the record identifier
    /// even when the payload does not repeat it.
    pub fn field(&self, name: &str) -> Option<serde_json::Value> {
        match self.data.get(name) {
            Some(value) => Some(value.clone()),
            None if name == "id" => Some(serde_json::Value::String(self.id.clone())),
            None => None,
        }
    }

    /// Returns true if both records address the same entity.
    pub fn same_identity(&self, other: &Record) -> bool {
        self.model_name == other.model_name && self.id == other.id
    }
}

// =============================================================================
// Typed Models
// =============================================================================

/// A typed entity that can be stored as a [`Record`].
///
/// ## Example
/// ```rust
/// use keel_core::Model;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Note {
///     id: String,
///     body: String,
/// }
///
/// impl Model for Note {
///     const MODEL_NAME: &'static str = "Note";
///     fn id(&self) -> &str {
///         &self.id
///     }
/// }
///
/// let note = Note { id: "a".into(), body: "x".into() };
/// let record = note.to_record().unwrap();
/// assert_eq!(record.model_name, "Note");
/// ```
pub trait Model: Serialize + DeserializeOwned {
    /// Schema name the model is registered under.
    const MODEL_NAME: &'static str;

    /// Stable identifier of this instance.
    fn id(&self) -> &str;

    /// Serializes the model into a record.
    fn to_record(&self) -> CoreResult<Record> {
        let data = serde_json::to_value(self).map_err(|e| CoreError::InvalidPayload {
            model: Self::MODEL_NAME.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Record::new(Self::MODEL_NAME, self.id(), data))
    }

    /// Deserializes a model from a record of the same schema.
    fn from_record(record: &Record) -> CoreResult<Self> {
        if record.model_name != Self::MODEL_NAME {
            return Err(CoreError::InvalidPayload {
                model: Self::MODEL_NAME.to_string(),
                reason: format!("record belongs to model {}", record.model_name),
            });
        }
        serde_json::from_value(record.data.clone()).map_err(|e| CoreError::InvalidPayload {
            model: Self::MODEL_NAME.to_string(),
            reason: e.to_string(),
        })
    }

    /// Schema entry for registration.
    fn schema() -> ModelSchema {
        ModelSchema::new(Self::MODEL_NAME)
    }
}

// =============================================================================
// Schemas
// =============================================================================

/// A registered model schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    /// Model name, unique within a store.
    pub name: String,

    /// Schema version. Bumped by the application when the shape changes.
    #[serde(default = "default_schema_version")]
    pub version: i64,
}

fn default_schema_version() -> i64 {
    1
}

impl ModelSchema {
    /// Creates a schema at version 1.
    pub fn new(name: impl Into<String>) -> Self {
        ModelSchema {
            name: name.into(),
            version: default_schema_version(),
        }
    }

    /// Sets the schema version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }
}

/// The set of models known to a store, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, ModelSchema>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry, rejecting empty or duplicate names.
    pub fn from_schemas(schemas: impl IntoIterator<Item = ModelSchema>) -> CoreResult<Self> {
        let mut registry = SchemaRegistry::new();
        for schema in schemas {
            registry.register(schema)?;
        }
        Ok(registry)
    }

    /// Registers one schema.
    pub fn register(&mut self, schema: ModelSchema) -> CoreResult<()> {
        if schema.name.trim().is_empty() {
            return Err(CoreError::InvalidSchema("model name must not be empty".into()));
        }
        if self.schemas.contains_key(&schema.name) {
            return Err(CoreError::InvalidSchema(format!(
                "model {} registered twice",
                schema.name
            )));
        }
        self.schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    /// Returns true if the model is registered.
    pub fn contains(&self, model_name: &str) -> bool {
        self.schemas.contains_key(model_name)
    }

    /// Looks up a schema by model name.
    pub fn get(&self, model_name: &str) -> Option<&ModelSchema> {
        self.schemas.get(model_name)
    }

    /// Registered model names, in name order.
    pub fn model_names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    /// Iterates over the registered schemas.
    pub fn iter(&self) -> impl Iterator<Item = &ModelSchema> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Model for Note {
        const MODEL_NAME: &'static str = "Note";
        fn id(&self) -> &str {
            &self.id
        }
    }

    #[test]
    fn test_model_record_conversion() {
        let note = Note {
            id: "A".into(),
            body: "x".into(),
        };
        let record = note.to_record().unwrap();
        assert_eq!(record.id, "A");
        assert_eq!(record.data["body"], "x");
        assert_eq!(Note::from_record(&record).unwrap(), note);
    }

    #[test]
    fn test_from_record_rejects_other_model() {
        let record = Record::new("Todo", "A", json!({"id": "A", "body": "x"}));
        assert!(Note::from_record(&record).is_err());
    }

    #[test]
    fn test_field_falls_back_to_id() {
        let record = Record::new("Note", "A", json!({"body": "x"}));
        assert_eq!(record.field("id"), Some(json!("A")));
        assert_eq!(record.field("body"), Some(json!("x")));
        assert_eq!(record.field("missing"), None);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let result =
            SchemaRegistry::from_schemas(vec![ModelSchema::new("Note"), ModelSchema::new("Note")]);
        assert!(result.is_err());

        let result = SchemaRegistry::from_schemas(vec![ModelSchema::new(" ")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_order() {
        let registry = SchemaRegistry::from_schemas(vec![
            ModelSchema::new("Todo"),
            ModelSchema::new("Note").with_version(3),
        ])
        .unwrap();
        assert_eq!(registry.model_names(), vec!["Note", "Todo"]);
        assert_eq!(registry.get("Note").map(|s| s.version), Some(3));
        assert!(!registry.contains("Post"));
    }
}
