//! # keel-core: Pure Data Model for Keel
//!
//! This crate holds the data model shared by every layer of the Keel
//! local-first data store. It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Keel Architecture                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              keel-datastore (DataStore facade)                  │   │
//! │  │    save / delete / query / observe  (after initialization)     │   │
//! │  └──────────────┬───────────────────────────────┬──────────────────┘   │
//! │                 │                               │                       │
//! │  ┌──────────────▼──────────────┐  ┌─────────────▼───────────────────┐  │
//! │  │   keel-db (LocalStore)      │◄─│  keel-sync (Orchestrator)       │  │
//! │  │   SQLite, change log        │  │  outbound / inbound / catch-up  │  │
//! │  └──────────────┬──────────────┘  └─────────────┬───────────────────┘  │
//! │                 │                               │                       │
//! │  ┌──────────────▼───────────────────────────────▼──────────────────┐   │
//! │  │               ★ keel-core (THIS CRATE) ★                        │   │
//! │  │   Record · ChangeRecord · ChangeConverter · QueryPredicate      │   │
//! │  │   ObservationFilter · SchemaRegistry                            │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, typed models, schemas
//! - [`change`] - Change records and their storage representation
//! - [`converter`] - Storage ⇄ domain change conversion
//! - [`predicate`] - Query predicates for conditional writes and queries
//! - [`filter`] - Observation filters
//! - [`error`] - Core error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod change;
pub mod converter;
pub mod error;
pub mod filter;
pub mod predicate;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use change::{ChangeOperation, ChangeRecord, Initiator, StorageInitiator, StoredChange};
pub use converter::ChangeConverter;
pub use error::{CoreError, CoreResult};
pub use filter::ObservationFilter;
pub use predicate::QueryPredicate;
pub use types::{Model, ModelSchema, Record, SchemaRegistry};
