//! # Remote Sync Client
//!
//! The seam between the orchestrator and the remote service. The
//! orchestrator never talks to a network directly; it calls a
//! [`RemoteSyncClient`], which any transport can implement.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Outbound ── push(change, base_version) ──►  ┌──────────────────────┐  │
//! │                                              │  RemoteSyncClient    │  │
//! │  Inbound  ◄── subscribe(model) stream ─────  │                      │  │
//! │                                              │  InMemoryRemote      │  │
//! │  Catch-up ── query(model, cursor, since) ──► │  (memory.rs) or a    │  │
//! │           ◄── RemotePage { items, cursor }   │  real transport      │  │
//! │                                              └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Contract
//! - `push` must deduplicate by `change_id`: re-pushing an acknowledged
//!   change returns the same result without a second mutation.
//! - A push whose `base_version` does not match the remote's current version
//!   fails with [`SyncError::Conflict`](crate::error::SyncError::Conflict) carrying the remote's copy.
//! - Network failures map to [`SyncError::Transient`](crate::error::SyncError::Transient); anything the caller
//!   cannot recover from maps to [`SyncError::Fatal`](crate::error::SyncError::Fatal) or
//!   [`SyncError::SchemaMismatch`](crate::error::SyncError::SchemaMismatch).

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use keel_core::{ChangeRecord, Record};
use keel_db::RemoteApply;

use crate::error::SyncResult;

pub use memory::{InMemoryRemote, PushLogEntry, PushOutcome};

/// The remote's view of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteModel {
    pub record: Record,
    /// Version assigned by the remote. Strictly increases per record.
    pub version: i64,
    pub deleted: bool,
    pub last_changed_at: DateTime<Utc>,
}

impl RemoteModel {
    pub fn model_name(&self) -> &str {
        &self.record.model_name
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Converts into the local store's apply request.
    pub fn to_apply(&self) -> RemoteApply {
        RemoteApply {
            record: self.record.clone(),
            version: self.version,
            deleted: self.deleted,
        }
    }
}

/// One page request of a catch-up pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQuery {
    pub model_name: String,
    /// Opaque cursor returned by the previous page.
    pub cursor: Option<String>,
    pub limit: u32,
    /// Only records changed at or after this instant. `None` is a full pass.
    pub since: Option<DateTime<Utc>>,
}

impl RemoteQuery {
    pub fn new(model_name: impl Into<String>, limit: u32) -> Self {
        RemoteQuery {
            model_name: model_name.into(),
            cursor: None,
            limit,
            since: None,
        }
    }

    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemotePage {
    pub items: Vec<RemoteModel>,
    /// `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Live stream of remote changes for one model.
///
/// Ends when the remote closes the subscription.
#[derive(Debug)]
pub struct RemoteSubscription {
    model_name: String,
    receiver: mpsc::Receiver<RemoteModel>,
}

impl RemoteSubscription {
    pub fn new(model_name: impl Into<String>, receiver: mpsc::Receiver<RemoteModel>) -> Self {
        RemoteSubscription {
            model_name: model_name.into(),
            receiver,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Next remote change, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<RemoteModel> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<RemoteModel> {
        ReceiverStream::new(self.receiver)
    }
}

/// Client for the remote service.
#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Sends one local mutation. `base_version` is the remote version the
    /// local record was derived from, `None` for records the remote has
    /// never acknowledged.
    ///
    /// Returns the remote's resulting copy.
    async fn push(&self, change: &ChangeRecord, base_version: Option<i64>) -> SyncResult<RemoteModel>;

    /// Opens a live subscription for one model.
    async fn subscribe(&self, model_name: &str) -> SyncResult<RemoteSubscription>;

    /// Reads one page of a model's records.
    async fn query(&self, query: RemoteQuery) -> SyncResult<RemotePage>;
}
