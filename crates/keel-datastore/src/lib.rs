//! # keel-datastore: Local-First Data Store
//!
//! The entry point applications use. Records are written to an on-device
//! SQLite store and synchronized with a remote service in the background.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Keel DataStore                                │
//! │                                                                         │
//! │   caller                                                               │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  ┌──────────────────────┐                                              │
//! │  │ DataStore            │  InitGate: calls before start() wait         │
//! │  └──────┬────────┬──────┘                                              │
//! │         │        │                                                      │
//! │         ▼        ▼                                                      │
//! │  ┌───────────┐  ┌──────────────┐     ┌──────────────────────┐          │
//! │  │LocalStore │◄─│ Orchestrator │◄───►│ RemoteSyncClient     │          │
//! │  │ (keel-db) │  │ (keel-sync)  │     │ (trait, app-provided)│          │
//! │  └─────┬─────┘  └──────────────┘     └──────────────────────┘          │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ObservationSubscription ──► caller (LOCAL and REMOTE changes)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use keel_datastore::{DataStore, DataStoreConfig};
//! use keel_db::DbConfig;
//! use keel_sync::InMemoryRemote;
//!
//! keel_datastore::init_tracing();
//!
//! let config = DataStoreConfig::new(DbConfig::new("./keel.db")).with_model::<Note>();
//! let datastore = DataStore::new(config, Arc::new(InMemoryRemote::new(["Note"])))?;
//! datastore.start().await?;
//!
//! datastore.save_model(&Note { id: "A".into(), body: "hi".into() }).await?;
//! let mut changes = datastore.observe_model("Note").await?;
//! ```

pub mod config;
pub mod datastore;
pub mod error;
mod gate;

pub use config::{default_database_path, DataStoreConfig, DATABASE_FILE};
pub use datastore::DataStore;
pub use error::{DataStoreError, DataStoreResult};

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber for applications that don't bring their
/// own.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=keel_sync=trace` - Trace the orchestrator only
/// - Default: `info,keel=debug,sqlx=warn`
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keel=debug,sqlx=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
