//! # DataStore Configuration
//!
//! One struct carries everything the facade needs: where the database
//! lives, how sync behaves, and which models exist.
//!
//! ```toml
//! # sync settings come from keel.toml (see keel_sync::SyncConfig)
//! [device]
//! id = "device-001"
//!
//! [sync]
//! mode = "bidirectional"
//! ```
//!
//! ## Database Location
//! - `KEEL_DB_PATH` overrides everything
//! - otherwise the platform data directory, e.g.
//!   `~/.local/share/keel/keel.db` on Linux

use std::path::PathBuf;

use directories::ProjectDirs;

use keel_core::{Model, ModelSchema, SchemaRegistry};
use keel_db::DbConfig;
use keel_sync::SyncConfig;

use crate::error::{DataStoreError, DataStoreResult};

/// File name of the database inside the data directory.
pub const DATABASE_FILE: &str = "keel.db";

#[derive(Debug, Clone)]
pub struct DataStoreConfig {
    pub db: DbConfig,
    pub sync: SyncConfig,
    /// Models the store and the orchestrator know.
    pub schemas: Vec<ModelSchema>,
}

impl DataStoreConfig {
    /// Default sync settings and no models yet.
    pub fn new(db: DbConfig) -> Self {
        DataStoreConfig {
            db,
            sync: SyncConfig::default(),
            schemas: Vec::new(),
        }
    }

    /// Database at [`default_database_path`], sync settings from the
    /// default config file (or defaults when there is none).
    pub fn load_default() -> DataStoreResult<Self> {
        let path = default_database_path().ok_or_else(|| {
            DataStoreError::InvalidConfig("could not determine a data directory".into())
        })?;
        let mut config = DataStoreConfig::new(DbConfig::new(path));
        config.sync = SyncConfig::load_or_default(None);
        Ok(config)
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_schema(mut self, schema: ModelSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Registers a typed model.
    pub fn with_model<M: Model>(self) -> Self {
        self.with_schema(M::schema())
    }

    /// The schema set as a registry.
    pub fn registry(&self) -> DataStoreResult<SchemaRegistry> {
        SchemaRegistry::from_schemas(self.schemas.iter().cloned())
            .map_err(|e| DataStoreError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> DataStoreResult<()> {
        if self.schemas.is_empty() {
            return Err(DataStoreError::InvalidConfig(
                "at least one model schema is required".into(),
            ));
        }
        self.registry()?;
        self.db.validate().map_err(DataStoreError::InvalidConfig)?;
        self.sync.validate()?;
        Ok(())
    }
}

/// Platform data directory for the database, honouring `KEEL_DB_PATH`.
///
/// Does not create the directory.
pub fn default_database_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KEEL_DB_PATH") {
        return Some(PathBuf::from(path));
    }
    ProjectDirs::from("com", "keel", "keel").map(|dirs| dirs.data_dir().join(DATABASE_FILE))
}
