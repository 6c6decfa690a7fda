//! # Repository Module
//!
//! Table-level access for the local store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  LocalStore (store.rs)                                                 │
//! │       │  one transaction per mutation, under the store's write lock    │
//! │       ▼                                                                 │
//! │  record::fetch / upsert        change_log::append / mark_synced        │
//! │       │                               │                                 │
//! │       ▼                               ▼                                 │
//! │  ┌──────────┐  ┌────────────┐  ┌────────────┐  ┌───────────────┐       │
//! │  │ records  │  │ change_log │  │ sync_state │  │ model_schemas │       │
//! │  └──────────┘  └────────────┘  └────────────┘  └───────────────┘       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Repository structs own a pool clone and serve reads. Writes that must be
//! atomic with other writes are free functions over a `SqliteConnection`
//! so they can run inside the store's transaction.
//!
//! ## Available Repositories
//!
//! - [`RecordRepository`] - current record state
//! - [`ChangeLogRepository`] - durable change log / outbox
//! - [`SyncStateRepository`] - catch-up bookkeeping
//! - [`SchemaRepository`] - registered models

pub mod change_log;
pub mod record;
pub mod schema;
pub mod sync_state;

pub use change_log::ChangeLogRepository;
pub use record::{RecordRepository, RecordRow};
pub use schema::SchemaRepository;
pub use sync_state::{SyncStateRepository, SyncStateRow};
