//! # keel-db: Local Store for Keel
//!
//! This crate owns on-device persistence. It uses SQLite through sqlx and is
//! the single writer of durable state: records, the change log, sync
//! bookkeeping and registered schemas.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Keel Data Flow                                   │
//! │                                                                         │
//! │  DataStore::save / keel-sync Orchestrator                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     keel-db (THIS CRATE)                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  LocalStore   │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │  (store.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ records       │    │              │  │   │
//! │  │   │ write lock    │───►│ change_log    │    │ 001_initial  │  │   │
//! │  │   │ observers     │    │ sync_state    │    │              │  │   │
//! │  │   │               │    │ schemas       │    │              │  │   │
//! │  │   └───────────────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │                                │                                │   │
//! │  │                        Database (pool.rs)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL mode)                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use keel_core::{Initiator, ModelSchema, Record, SchemaRegistry};
//! use keel_db::{DbConfig, LocalStore};
//!
//! let store = LocalStore::new(DbConfig::new("./keel.db"));
//! store.initialize(&SchemaRegistry::from_schemas([ModelSchema::new("Note")])?).await?;
//!
//! let change = store.save(Record::new("Note", "A", json!({"body": "hi"})), Initiator::Local, None).await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// Re-exports for convenience
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig, DEFAULT_OBSERVER_CAPACITY};
pub use repository::{
    ChangeLogRepository, RecordRepository, RecordRow, SchemaRepository, SyncStateRepository,
    SyncStateRow,
};
pub use store::{LocalStore, ObservationSubscription, RemoteApply};
