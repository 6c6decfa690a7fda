//! # keel-sync: Sync Orchestrator for Keel
//!
//! This crate reconciles the local store with a remote source of truth. Local
//! writes never wait on it: they land in the change log as pending changes
//! and the orchestrator pushes them in the background.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Orchestrator Architecture                   │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    Orchestrator (state machine)                  │  │
//! │  │                                                                  │  │
//! │  │  Stopped ─► Starting ─► Syncing ─► Stopping ─► Stopped           │  │
//! │  │                 └──────────┴───────────┴──► Failed ─► reset()    │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Outbound       │  │ CatchUp        │  │ Inbound                │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Pushes pending │  │ Paginated full │  │ One subscription per   │    │
//! │  │ changes, one   │  │ or delta query │  │ model, applies remote  │    │
//! │  │ queue per model│  │ at startup     │  │ changes as Remote      │    │
//! │  └───────┬────────┘  └───────┬────────┘  └───────────┬────────────┘    │
//! │          │                   │                       │                  │
//! │          └──────── RecordLocks (model, id) ──────────┘                  │
//! │                              │                                          │
//! │                 RemoteSyncClient ◄──► LocalStore                        │
//! │                                                                         │
//! │  OBSERVABLE:                                                           │
//! │  • subscribe_state()  - SyncState changes, including Failed            │
//! │  • subscribe_events() - pushes, conflicts, transient errors, fatal     │
//! │  • status()           - pending count, last sync, last error           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`orchestrator`] - Lifecycle and task supervision
//! - `outbound` - Pushes pending local changes
//! - `inbound` - Applies subscription deliveries
//! - [`catchup`] - Startup catch-up pass
//! - [`remote`] - The remote client trait and an in-memory remote
//! - [`locks`] - Per-record locks
//! - [`config`] - Sync configuration (mode, device ID, timings)
//! - [`events`] - Sync events
//! - [`status`] - Orchestrator state and status snapshot
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keel_sync::{InMemoryRemote, Orchestrator, SyncConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let orchestrator = Orchestrator::builder(config)
//!     .with_store(store)
//!     .with_remote(Arc::new(InMemoryRemote::new(["Note"])))
//!     .build()?;
//!
//! orchestrator.start().await?;
//! let status = orchestrator.status().await;
//! println!("State: {}, pending: {}", status.state, status.pending_count);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod catchup;
pub mod config;
mod context;
pub mod error;
pub mod events;
mod inbound;
pub mod locks;
pub mod orchestrator;
mod outbound;
pub mod remote;
pub mod status;

// =============================================================================
// Re-exports
// =============================================================================

pub use catchup::CatchUpReport;
pub use config::{DeviceConfig, SyncConfig, SyncMode, SyncSettings};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent, SyncOperation};
pub use locks::{RecordGuard, RecordLocks};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use remote::{
    InMemoryRemote, PushLogEntry, PushOutcome, RemoteModel, RemotePage, RemoteQuery,
    RemoteSubscription, RemoteSyncClient,
};
pub use status::{SyncState, SyncStatus};
