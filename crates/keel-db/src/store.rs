//! # Local Store
//!
//! The durable on-device copy of every record, and the single writer of
//! durable state.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  save / delete / apply_remote                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  write lock (one writer at a time)                                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────── SINGLE TRANSACTION ───────────────────┐  │
//! │  │  1. read current row                                             │  │
//! │  │  2. evaluate predicate against persisted state                   │  │
//! │  │  3. upsert record (or tombstone)                                 │  │
//! │  │  4. append change_log row (ChangeConverter::to_stored)           │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │       │                                                                 │
//! │       ▼  COMMIT                                                         │
//! │  broadcast ChangeRecord ──► ObservationSubscription (filtered)         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Observers only ever see committed changes, in commit order. Observation is
//! live only: a new subscription starts after already-emitted changes. A
//! subscriber that falls behind the broadcast buffer replays what it missed
//! from the change log, so slow observers are late but never lossy.
//!
//! ## Lifecycle
//! `Uninitialized ──initialize──► Ready ──terminate──► Terminated`.
//! Every operation other than `initialize` fails with
//! [`DbError::NotInitialized`] outside `Ready`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use keel_core::{
    ChangeConverter, ChangeOperation, ChangeRecord, Initiator, ModelSchema, ObservationFilter,
    QueryPredicate, Record, SchemaRegistry,
};

use crate::error::{DbError, DbResult};
use crate::pool::{Database, DbConfig};
use crate::repository::{change_log, record as records, sync_state, ChangeLogRepository, RecordRow};

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone)]
struct ReadyStore {
    db: Database,
    changes: broadcast::Sender<ChangeRecord>,
    schemas: Arc<SchemaRegistry>,
}

#[derive(Debug)]
enum StoreState {
    Uninitialized,
    Ready(ReadyStore),
    Terminated,
}

/// A remote record to apply locally.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteApply {
    pub record: Record,
    /// Version assigned by the remote.
    pub version: i64,
    pub deleted: bool,
}

/// SQLite-backed local store.
///
/// Cheap operations take `&self`; share it behind an `Arc`.
#[derive(Debug)]
pub struct LocalStore {
    config: DbConfig,
    state: RwLock<StoreState>,
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Creates an uninitialized store. No I/O happens until `initialize`.
    pub fn new(config: DbConfig) -> Self {
        LocalStore {
            config,
            state: RwLock::new(StoreState::Uninitialized),
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Opens the database, runs migrations and persists the schema set.
    ///
    /// Calling it again on a ready store returns the persisted schemas
    /// without touching the database.
    pub async fn initialize(&self, schemas: &SchemaRegistry) -> DbResult<Vec<ModelSchema>> {
        let mut state = self.state.write().await;
        match &*state {
            StoreState::Ready(ready) => return ready.db.schemas().list().await,
            StoreState::Terminated => return Err(DbError::Terminated),
            StoreState::Uninitialized => {}
        }

        let db = Database::new(self.config.clone()).await?;
        db.schemas().register_all(schemas).await?;
        let registered = db.schemas().list().await?;

        let (changes, _) = broadcast::channel(self.config.observer_capacity);
        *state = StoreState::Ready(ReadyStore {
            db,
            changes,
            schemas: Arc::new(schemas.clone()),
        });

        info!(models = schemas.len(), "Local store initialized");
        Ok(registered)
    }

    /// True once `initialize` has completed and `terminate` has not run.
    pub async fn is_initialized(&self) -> bool {
        matches!(&*self.state.read().await, StoreState::Ready(_))
    }

    /// Closes the pool and ends every observation stream.
    pub async fn terminate(&self) {
        let mut state = self.state.write().await;
        if let StoreState::Ready(ready) = std::mem::replace(&mut *state, StoreState::Terminated) {
            // Dropping the last sender closes every receiver.
            drop(ready.changes);
            ready.db.close().await;
            info!("Local store terminated");
        }
    }

    async fn ready(&self) -> DbResult<ReadyStore> {
        match &*self.state.read().await {
            StoreState::Ready(ready) => Ok(ready.clone()),
            _ => Err(DbError::NotInitialized),
        }
    }

    async fn ready_for(&self, model_name: &str) -> DbResult<ReadyStore> {
        let ready = self.ready().await?;
        if !ready.schemas.contains(model_name) {
            return Err(DbError::UnknownModel(model_name.to_string()));
        }
        Ok(ready)
    }

    /// Registered models.
    pub async fn schemas(&self) -> DbResult<SchemaRegistry> {
        Ok(self.ready().await?.schemas.as_ref().clone())
    }

    // =========================================================================
    // Caller operations
    // =========================================================================

    /// Saves a record, creating it if no live row exists.
    ///
    /// With a predicate, the save only happens if the predicate holds for
    /// the currently persisted record; a missing record never satisfies it.
    pub async fn save(
        &self,
        record: Record,
        initiator: Initiator,
        predicate: Option<&QueryPredicate>,
    ) -> DbResult<ChangeRecord> {
        let ready = self.ready_for(&record.model_name).await?;
        let _guard = self.write_lock.lock().await;

        let mut tx = ready.db.pool().begin().await?;
        let current = records::fetch(&mut tx, &record.model_name, &record.id).await?;
        let live = current.as_ref().filter(|row| row.is_live());

        if let Some(predicate) = predicate {
            check_predicate(live, predicate, &record.model_name, &record.id)?;
        }

        let operation = if live.is_some() {
            ChangeOperation::Update
        } else {
            ChangeOperation::Create
        };
        let version = current.as_ref().and_then(|row| row.version);
        records::upsert(&mut tx, &record, version, false).await?;

        let mut change = ChangeRecord::new(record, operation, initiator);
        change.sequence = change_log::append(&mut tx, &ChangeConverter::to_stored(&change)?).await?;
        tx.commit().await?;

        debug!(
            model = %change.model_name,
            id = %change.record_id(),
            operation = %change.operation,
            seq = change.sequence,
            "Record saved"
        );
        let _ = ready.changes.send(change.clone());
        Ok(change)
    }

    /// Deletes a live record, leaving a tombstone.
    pub async fn delete(
        &self,
        model_name: &str,
        id: &str,
        initiator: Initiator,
        predicate: Option<&QueryPredicate>,
    ) -> DbResult<ChangeRecord> {
        let ready = self.ready_for(model_name).await?;
        let _guard = self.write_lock.lock().await;

        let mut tx = ready.db.pool().begin().await?;
        let current = records::fetch(&mut tx, model_name, id).await?;
        let Some(row) = current.filter(|row| row.is_live()) else {
            return Err(DbError::not_found(model_name, id));
        };

        if let Some(predicate) = predicate {
            check_predicate(Some(&row), predicate, model_name, id)?;
        }

        let last_known = row.to_record()?;
        records::upsert(&mut tx, &last_known, row.version, true).await?;

        let mut change = ChangeRecord::new(last_known, ChangeOperation::Delete, initiator);
        change.sequence = change_log::append(&mut tx, &ChangeConverter::to_stored(&change)?).await?;
        tx.commit().await?;

        debug!(model = %model_name, id = %id, seq = change.sequence, "Record deleted");
        let _ = ready.changes.send(change.clone());
        Ok(change)
    }

    /// Live records of one model matching the predicate, ordered by id.
    pub async fn query(
        &self,
        model_name: &str,
        predicate: Option<&QueryPredicate>,
    ) -> DbResult<Vec<Record>> {
        let ready = self.ready_for(model_name).await?;
        let rows = ready.db.records().list_live(model_name).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.to_record()?;
            if predicate.map_or(true, |p| p.matches(&record)) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// One live record.
    pub async fn get(&self, model_name: &str, id: &str) -> DbResult<Option<Record>> {
        let ready = self.ready_for(model_name).await?;
        match ready.db.records().get(model_name, id).await? {
            Some(row) if row.is_live() => Ok(Some(row.to_record()?)),
            _ => Ok(None),
        }
    }

    /// Subscribes to committed changes matching `filter`.
    pub async fn observe(&self, filter: ObservationFilter) -> DbResult<ObservationSubscription> {
        let ready = self.ready().await?;
        // Writers broadcast while holding the lock, so the receiver and the
        // starting sequence agree on where this subscription begins.
        let _guard = self.write_lock.lock().await;
        let receiver = ready.changes.subscribe();
        let change_log = ready.db.change_log();
        let last_sequence = change_log.last_sequence().await?;

        debug!(?filter, last_sequence, "Observation opened");
        Ok(ObservationSubscription {
            filter,
            receiver,
            change_log,
            last_sequence,
            replaying: false,
            backlog: VecDeque::new(),
        })
    }

    // =========================================================================
    // Sync-facing operations
    // =========================================================================

    /// Applies a record received from the remote.
    ///
    /// Writes nothing and returns `None` unless the remote version is newer
    /// than the local one, or `force` is set (conflict resolution). Pending
    /// local changes for the record are closed as superseded.
    pub async fn apply_remote(&self, remote: RemoteApply, force: bool) -> DbResult<Option<ChangeRecord>> {
        let RemoteApply {
            record: incoming,
            version,
            deleted,
        } = remote;
        let ready = self.ready_for(&incoming.model_name).await?;
        let _guard = self.write_lock.lock().await;

        let mut tx = ready.db.pool().begin().await?;
        let current = records::fetch(&mut tx, &incoming.model_name, &incoming.id).await?;
        let local_version = current.as_ref().and_then(|row| row.version);

        if !force && local_version.is_some_and(|local| version <= local) {
            debug!(
                model = %incoming.model_name,
                id = %incoming.id,
                version,
                local_version = ?local_version,
                "Skipping stale remote record"
            );
            return Ok(None);
        }

        let live = current.as_ref().is_some_and(RecordRow::is_live);
        records::upsert(&mut tx, &incoming, Some(version), deleted).await?;
        let superseded =
            change_log::supersede_pending(&mut tx, &incoming.model_name, &incoming.id).await?;

        let operation = match (deleted, live) {
            // Tombstone for a record never seen locally: remember the version
            // but emit nothing.
            (true, false) => {
                tx.commit().await?;
                return Ok(None);
            }
            (true, true) => ChangeOperation::Delete,
            (false, true) => ChangeOperation::Update,
            (false, false) => ChangeOperation::Create,
        };

        let mut change = ChangeRecord::new(incoming, operation, Initiator::Remote).with_version(version);
        change.sequence = change_log::append(&mut tx, &ChangeConverter::to_stored(&change)?).await?;
        tx.commit().await?;

        if superseded > 0 {
            info!(
                model = %change.model_name,
                id = %change.record_id(),
                superseded,
                "Remote version replaced pending local changes"
            );
        }
        debug!(
            model = %change.model_name,
            id = %change.record_id(),
            version,
            operation = %change.operation,
            "Remote record applied"
        );
        let _ = ready.changes.send(change.clone());
        Ok(Some(change))
    }

    /// Unacknowledged local changes, oldest first.
    pub async fn pending_changes(&self, limit: u32) -> DbResult<Vec<ChangeRecord>> {
        let ready = self.ready().await?;
        let rows = ready.db.change_log().get_pending(limit).await?;
        rows.iter()
            .map(|row| ChangeConverter::to_change_record(row).map_err(DbError::from))
            .collect()
    }

    /// Unacknowledged local changes of one model, oldest first.
    pub async fn pending_changes_for(&self, model_name: &str, limit: u32) -> DbResult<Vec<ChangeRecord>> {
        let ready = self.ready_for(model_name).await?;
        let rows = ready.db.change_log().get_pending_for_model(model_name, limit).await?;
        rows.iter()
            .map(|row| ChangeConverter::to_change_record(row).map_err(DbError::from))
            .collect()
    }

    /// Acknowledges a pushed change and records the version the remote
    /// assigned. Acknowledging twice is a no-op.
    pub async fn mark_synced(&self, change_id: Uuid, version: i64) -> DbResult<()> {
        let ready = self.ready().await?;
        let _guard = self.write_lock.lock().await;
        let change_id = change_id.to_string();

        let mut tx = ready.db.pool().begin().await?;
        let Some(row) = change_log::fetch(&mut tx, &change_id).await? else {
            return Err(DbError::not_found("Change", change_id));
        };
        change_log::mark_synced(&mut tx, &change_id, version).await?;
        records::raise_version(&mut tx, &row.model_name, &row.record_id, version).await?;
        tx.commit().await?;

        debug!(change_id = %change_id, version, "Change acknowledged");
        Ok(())
    }

    /// Records a failed push attempt; the change stays pending.
    pub async fn mark_failed(&self, change_id: Uuid, error: &str) -> DbResult<()> {
        let ready = self.ready().await?;
        let _guard = self.write_lock.lock().await;
        ready
            .db
            .change_log()
            .mark_failed(&change_id.to_string(), error)
            .await?;
        Ok(())
    }

    /// False once a change has been acknowledged or superseded.
    pub async fn is_pending(&self, change_id: Uuid) -> DbResult<bool> {
        let ready = self.ready().await?;
        Ok(ready
            .db
            .change_log()
            .get(&change_id.to_string())
            .await?
            .is_some_and(|row| row.is_pending()))
    }

    pub async fn pending_count(&self) -> DbResult<i64> {
        self.ready().await?.db.change_log().count_pending().await
    }

    /// Last remote version known for a record, tombstones included.
    pub async fn record_version(&self, model_name: &str, id: &str) -> DbResult<Option<i64>> {
        let ready = self.ready().await?;
        Ok(ready
            .db
            .records()
            .get(model_name, id)
            .await?
            .and_then(|row| row.version))
    }

    /// Every logged change of one record, in log order.
    pub async fn history(&self, model_name: &str, id: &str) -> DbResult<Vec<ChangeRecord>> {
        let ready = self.ready().await?;
        let rows = ready.db.change_log().for_record(model_name, id).await?;
        rows.iter()
            .map(|row| ChangeConverter::to_change_record(row).map_err(DbError::from))
            .collect()
    }

    /// When the last catch-up pass for a model completed.
    pub async fn last_sync(&self, model_name: &str) -> DbResult<Option<DateTime<Utc>>> {
        let ready = self.ready().await?;
        Ok(ready
            .db
            .sync_state()
            .get(model_name)
            .await?
            .and_then(|row| row.last_sync_at))
    }

    /// When the last full catch-up pass for a model completed.
    pub async fn last_full_sync(&self, model_name: &str) -> DbResult<Option<DateTime<Utc>>> {
        let ready = self.ready().await?;
        Ok(ready
            .db
            .sync_state()
            .get(model_name)
            .await?
            .and_then(|row| row.last_full_sync_at))
    }

    pub async fn set_last_sync(&self, model_name: &str, at: DateTime<Utc>, full: bool) -> DbResult<()> {
        let ready = self.ready().await?;
        let _guard = self.write_lock.lock().await;
        ready.db.sync_state().record_sync(model_name, at, full).await
    }

    /// Deletes every record, change and sync timestamp. Registered schemas
    /// stay.
    pub async fn clear(&self) -> DbResult<()> {
        let ready = self.ready().await?;
        let _guard = self.write_lock.lock().await;

        let mut tx = ready.db.pool().begin().await?;
        let removed_records = records::delete_all(&mut tx).await?;
        let removed_changes = change_log::delete_all(&mut tx).await?;
        sync_state::delete_all(&mut tx).await?;
        tx.commit().await?;

        info!(removed_records, removed_changes, "Local store cleared");
        Ok(())
    }

    /// Deletes acknowledged change-log rows older than `days_old` days.
    pub async fn cleanup_synced(&self, days_old: u32) -> DbResult<u64> {
        let ready = self.ready().await?;
        let _guard = self.write_lock.lock().await;
        ready.db.change_log().cleanup_old_entries(days_old).await
    }
}

fn check_predicate(
    current: Option<&RecordRow>,
    predicate: &QueryPredicate,
    model_name: &str,
    id: &str,
) -> DbResult<()> {
    let Some(row) = current else {
        return Err(DbError::condition_not_met(model_name, id));
    };
    if predicate.matches(&row.to_record()?) {
        Ok(())
    } else {
        Err(DbError::condition_not_met(model_name, id))
    }
}

// =============================================================================
// Observation
// =============================================================================

/// Rows read from the change log per replay round.
const REPLAY_PAGE: u32 = 256;

/// A live, filtered view of committed changes.
///
/// Dropping the subscription cancels it. The stream ends when the store
/// terminates. A subscriber that falls more than `observer_capacity` changes
/// behind the broadcast buffer reads the missed changes back from the change
/// log before returning to live delivery.
#[derive(Debug)]
pub struct ObservationSubscription {
    filter: ObservationFilter,
    receiver: broadcast::Receiver<ChangeRecord>,
    change_log: ChangeLogRepository,
    /// Newest sequence this subscription has seen, delivered or filtered out.
    last_sequence: i64,
    replaying: bool,
    backlog: VecDeque<ChangeRecord>,
}

impl ObservationSubscription {
    pub fn filter(&self) -> &ObservationFilter {
        &self.filter
    }

    /// Waits for the next matching change. `None` once the store terminated.
    pub async fn next(&mut self) -> Option<ChangeRecord> {
        loop {
            if let Some(change) = self.backlog.pop_front() {
                return Some(change);
            }

            if self.replaying {
                if let Err(e) = self.replay_page().await {
                    warn!(error = %e, filter = ?self.filter, "Could not replay missed changes");
                    self.replaying = false;
                }
                continue;
            }

            match self.receiver.recv().await {
                // Already replayed from the change log.
                Ok(change) if change.sequence <= self.last_sequence => continue,
                Ok(change) => {
                    self.last_sequence = change.sequence;
                    if self.filter.matches(&change) {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        skipped,
                        after = self.last_sequence,
                        filter = ?self.filter,
                        "Observer lagged behind, replaying from change log"
                    );
                    self.replaying = true;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Queues the next page of changes committed after `last_sequence`.
    /// Replay ends when the log has nothing newer.
    async fn replay_page(&mut self) -> DbResult<()> {
        let rows = self.change_log.after_sequence(self.last_sequence, REPLAY_PAGE).await?;
        if rows.is_empty() {
            self.replaying = false;
            return Ok(());
        }

        for row in &rows {
            self.last_sequence = row.seq;
            match ChangeConverter::to_change_record(row) {
                Ok(change) if self.filter.matches(&change) => self.backlog.push_back(change),
                Ok(_) => {}
                Err(e) => warn!(error = %e, seq = row.seq, "Skipping unreadable change log row"),
            }
        }
        Ok(())
    }

    /// Converts the subscription into a `futures` stream.
    pub fn into_stream(self) -> impl Stream<Item = ChangeRecord> + Send + Unpin + 'static {
        Box::pin(stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|change| (change, subscription))
        }))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
