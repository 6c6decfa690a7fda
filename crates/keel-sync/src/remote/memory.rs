//! # In-Memory Remote
//!
//! A process-local [`RemoteSyncClient`] with the remote's semantics:
//! versioned storage, dedup by change id, conflict detection on stale base
//! versions, subscription fan-out and cursor pagination. Used by tests and by
//! applications running without a backend.
//!
//! Failures can be injected to exercise the orchestrator's retry paths:
//! ```rust,ignore
//! let remote = InMemoryRemote::new(["Note"]);
//! remote.fail_next_pushes(2).await;   // two Transient errors, then success
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use keel_core::{ChangeOperation, ChangeRecord, Record};

use super::{RemoteModel, RemotePage, RemoteQuery, RemoteSubscription, RemoteSyncClient};
use crate::error::{SyncError, SyncResult};

/// Buffered remote changes per subscriber.
const SUBSCRIPTION_BUFFER: usize = 256;

/// What the remote did with one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted as a new mutation.
    Applied { version: i64 },
    /// Change id seen before; the earlier result was returned.
    Duplicate,
    /// Rejected on a stale base version.
    Conflict { remote_version: i64 },
    /// Injected transient failure.
    Failed,
    /// Fatal or schema rejection.
    Rejected,
}

/// One push as seen by the remote, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct PushLogEntry {
    pub change_id: Uuid,
    pub model_name: String,
    pub record_id: String,
    pub base_version: Option<i64>,
    pub outcome: PushOutcome,
}

#[derive(Debug, Default)]
struct RemoteState {
    models: BTreeSet<String>,
    records: BTreeMap<(String, String), RemoteModel>,
    acknowledged: HashMap<Uuid, RemoteModel>,
    subscribers: HashMap<String, Vec<mpsc::Sender<RemoteModel>>>,
    failing_pushes: u32,
    failing_queries: u32,
    fatal: Option<String>,
    push_delay: Option<Duration>,
    log: Vec<PushLogEntry>,
}

impl RemoteState {
    fn check_model(&self, model_name: &str) -> SyncResult<()> {
        if let Some(reason) = &self.fatal {
            return Err(SyncError::Fatal(reason.clone()));
        }
        if !self.models.contains(model_name) {
            return Err(SyncError::SchemaMismatch(format!(
                "model '{model_name}' is not known to the remote"
            )));
        }
        Ok(())
    }

    fn log(&mut self, change: &ChangeRecord, base_version: Option<i64>, outcome: PushOutcome) {
        self.log.push(PushLogEntry {
            change_id: change.change_id,
            model_name: change.model_name.clone(),
            record_id: change.record_id().to_string(),
            base_version,
            outcome,
        });
    }

    fn push(&mut self, change: &ChangeRecord, base_version: Option<i64>) -> SyncResult<RemoteModel> {
        if let Err(err) = self.check_model(&change.model_name) {
            self.log(change, base_version, PushOutcome::Rejected);
            return Err(err);
        }

        if self.failing_pushes > 0 {
            self.failing_pushes -= 1;
            self.log(change, base_version, PushOutcome::Failed);
            return Err(SyncError::Transient("injected push failure".into()));
        }

        if let Some(previous) = self.acknowledged.get(&change.change_id).cloned() {
            self.log(change, base_version, PushOutcome::Duplicate);
            return Ok(previous);
        }

        let key = (change.model_name.clone(), change.record_id().to_string());
        let current_version = self.records.get(&key).map(|current| current.version);

        if let Some(current) = self.records.get(&key).filter(|_| current_version != base_version) {
            let remote = current.clone();
            self.log(change, base_version, PushOutcome::Conflict { remote_version: remote.version });
            return Err(SyncError::conflict(remote));
        }

        let model = RemoteModel {
            record: change.record.clone(),
            version: current_version.unwrap_or(0) + 1,
            deleted: change.operation == ChangeOperation::Delete,
            last_changed_at: Utc::now(),
        };
        self.records.insert(key, model.clone());
        self.acknowledged.insert(change.change_id, model.clone());
        self.log(change, base_version, PushOutcome::Applied { version: model.version });
        Ok(model)
    }

    /// Writes a record as another device would, bypassing conflict checks.
    fn write(&mut self, record: Record, deleted: bool) -> RemoteModel {
        let key = (record.model_name.clone(), record.id.clone());
        let version = self.records.get(&key).map_or(0, |current| current.version) + 1;
        let model = RemoteModel {
            record,
            version,
            deleted,
            last_changed_at: Utc::now(),
        };
        self.records.insert(key, model.clone());
        model
    }

    fn subscribers_of(&mut self, model_name: &str) -> Vec<mpsc::Sender<RemoteModel>> {
        match self.subscribers.get_mut(model_name) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.clone()
            }
            None => Vec::new(),
        }
    }
}

/// Process-local remote service.
///
/// Clones share the same state, so a test can keep a handle for assertions
/// after handing one to the orchestrator.
#[derive(Debug, Clone)]
pub struct InMemoryRemote {
    inner: Arc<Mutex<RemoteState>>,
}

impl InMemoryRemote {
    /// Creates a remote that accepts the given models.
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = RemoteState {
            models: models.into_iter().map(Into::into).collect(),
            ..Default::default()
        };
        InMemoryRemote {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// The next `count` pushes fail with a transient error.
    pub async fn fail_next_pushes(&self, count: u32) {
        self.inner.lock().await.failing_pushes = count;
    }

    /// The next `count` queries fail with a transient error.
    pub async fn fail_next_queries(&self, count: u32) {
        self.inner.lock().await.failing_queries = count;
    }

    /// Every subsequent call fails with a fatal error.
    pub async fn fail_fatally(&self, reason: impl Into<String>) {
        self.inner.lock().await.fatal = Some(reason.into());
    }

    /// Delays every push, simulating a slow network.
    pub async fn set_push_delay(&self, delay: Option<Duration>) {
        self.inner.lock().await.push_delay = delay;
    }

    /// Closes every open subscription of a model.
    pub async fn close_subscriptions(&self, model_name: &str) {
        self.inner.lock().await.subscribers.remove(model_name);
    }

    // =========================================================================
    // Writes from other devices
    // =========================================================================

    /// Saves a record as another device would and notifies subscribers.
    pub async fn peer_save(&self, record: Record) -> RemoteModel {
        self.peer_write(record, false).await
    }

    /// Deletes a record as another device would and notifies subscribers.
    pub async fn peer_delete(&self, record: Record) -> RemoteModel {
        self.peer_write(record, true).await
    }

    async fn peer_write(&self, record: Record, deleted: bool) -> RemoteModel {
        let (model, subscribers) = {
            let mut state = self.inner.lock().await;
            let model = state.write(record, deleted);
            let subscribers = state.subscribers_of(model.model_name());
            (model, subscribers)
        };
        deliver(subscribers, &model).await;
        model
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every push received so far, in arrival order.
    pub async fn push_log(&self) -> Vec<PushLogEntry> {
        self.inner.lock().await.log.clone()
    }

    /// Number of pushes that mutated remote state.
    pub async fn mutation_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .log
            .iter()
            .filter(|entry| matches!(entry.outcome, PushOutcome::Applied { .. }))
            .count()
    }

    pub async fn get(&self, model_name: &str, id: &str) -> Option<RemoteModel> {
        self.inner
            .lock()
            .await
            .records
            .get(&(model_name.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn subscriber_count(&self, model_name: &str) -> usize {
        self.inner.lock().await.subscribers_of(model_name).len()
    }
}

async fn deliver(subscribers: Vec<mpsc::Sender<RemoteModel>>, model: &RemoteModel) {
    for tx in subscribers {
        if tx.send(model.clone()).await.is_err() {
            debug!(model = %model.model_name(), "Subscriber went away during delivery");
        }
    }
}

#[async_trait]
impl RemoteSyncClient for InMemoryRemote {
    async fn push(&self, change: &ChangeRecord, base_version: Option<i64>) -> SyncResult<RemoteModel> {
        let delay = self.inner.lock().await.push_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (result, subscribers) = {
            let mut state = self.inner.lock().await;
            let result = state.push(change, base_version);
            let subscribers = match &result {
                Ok(_) => state.subscribers_of(&change.model_name),
                Err(_) => Vec::new(),
            };
            (result, subscribers)
        };

        match &result {
            Ok(model) => deliver(subscribers, model).await,
            Err(e) => debug!(change_id = %change.change_id, error = %e, "Push rejected"),
        }
        result
    }

    async fn subscribe(&self, model_name: &str) -> SyncResult<RemoteSubscription> {
        let mut state = self.inner.lock().await;
        state.check_model(model_name)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        state
            .subscribers
            .entry(model_name.to_string())
            .or_default()
            .push(tx);

        debug!(model = %model_name, "Remote subscription opened");
        Ok(RemoteSubscription::new(model_name, rx))
    }

    async fn query(&self, query: RemoteQuery) -> SyncResult<RemotePage> {
        let mut state = self.inner.lock().await;
        state.check_model(&query.model_name)?;

        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            warn!(model = %query.model_name, "Injected query failure");
            return Err(SyncError::Transient("injected query failure".into()));
        }

        let limit = query.limit.max(1) as usize;
        let mut matching = state
            .records
            .values()
            .filter(|item| item.model_name() == query.model_name)
            .filter(|item| query.cursor.as_deref().map_or(true, |cursor| item.id() > cursor))
            .filter(|item| query.since.map_or(true, |since| item.last_changed_at >= since));

        let items: Vec<RemoteModel> = matching.by_ref().take(limit).cloned().collect();
        let next_cursor = match matching.next() {
            Some(_) => items.last().map(|item| item.id().to_string()),
            None => None,
        };

        Ok(RemotePage { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note(id: &str, body: &str) -> Record {
        Record::new("Note", id, json!({ "body": body }))
    }

    fn local_change(id: &str, body: &str) -> ChangeRecord {
        ChangeRecord::new(note(id, body), ChangeOperation::Create, keel_core::Initiator::Local)
    }

    #[tokio::test]
    async fn test_push_assigns_versions_and_dedups() {
        let remote = InMemoryRemote::new(["Note"]);
        let change = local_change("A", "one");

        let first = remote.push(&change, None).await.unwrap();
        assert_eq!(first.version, 1);

        // Same change id: same result, no second mutation
        let again = remote.push(&change, None).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(remote.mutation_count().await, 1);

        let update = ChangeRecord::new(note("A", "two"), ChangeOperation::Update, keel_core::Initiator::Local);
        let second = remote.push(&update, Some(1)).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(remote.get("Note", "A").await.unwrap().record.data["body"], "two");
    }

    #[tokio::test]
    async fn test_stale_base_version_conflicts() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.peer_save(note("A", "peer")).await;

        let current = match remote.push(&local_change("A", "mine"), None).await {
            Err(SyncError::Conflict { remote }) => remote,
            other => panic!("expected conflict, got {other:?}"),
        };
        assert_eq!(current.version, 1);
        assert_eq!(current.record.data["body"], "peer");

        let log = remote.push_log().await;
        assert_eq!(log[0].outcome, PushOutcome::Conflict { remote_version: 1 });
    }

    #[tokio::test]
    async fn test_delete_push_leaves_tombstone() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.push(&local_change("A", "x"), None).await.unwrap();

        let delete = ChangeRecord::new(note("A", "x"), ChangeOperation::Delete, keel_core::Initiator::Local);
        let tombstone = remote.push(&delete, Some(1)).await.unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.version, 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.fail_next_pushes(2).await;
        let change = local_change("A", "x");

        assert!(remote.push(&change, None).await.unwrap_err().is_retryable());
        assert!(remote.push(&change, None).await.unwrap_err().is_retryable());
        assert!(remote.push(&change, None).await.is_ok());
        assert_eq!(remote.mutation_count().await, 1);
        assert_eq!(remote.push_log().await.len(), 3);

        remote.fail_next_queries(1).await;
        assert!(remote.query(RemoteQuery::new("Note", 10)).await.unwrap_err().is_retryable());
        assert_eq!(remote.query(RemoteQuery::new("Note", 10)).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_model_is_fatal() {
        let remote = InMemoryRemote::new(["Note"]);
        let todo = ChangeRecord::new(
            Record::new("Todo", "1", json!({})),
            ChangeOperation::Create,
            keel_core::Initiator::Local,
        );

        assert!(remote.push(&todo, None).await.unwrap_err().is_fatal());
        assert!(remote.subscribe("Todo").await.unwrap_err().is_fatal());
        assert!(remote.query(RemoteQuery::new("Todo", 10)).await.unwrap_err().is_fatal());

        remote.fail_fatally("credentials revoked").await;
        assert!(matches!(
            remote.push(&local_change("A", "x"), None).await,
            Err(SyncError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribers_receive_accepted_writes() {
        let remote = InMemoryRemote::new(["Note"]);
        let mut sub = remote.subscribe("Note").await.unwrap();
        assert_eq!(remote.subscriber_count("Note").await, 1);

        remote.push(&local_change("A", "pushed"), None).await.unwrap();
        remote.peer_save(note("B", "peer")).await;

        assert_eq!(sub.next().await.unwrap().id(), "A");
        assert_eq!(sub.next().await.unwrap().id(), "B");

        remote.close_subscriptions("Note").await;
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_query_paginates_by_cursor() {
        let remote = InMemoryRemote::new(["Note"]);
        for id in ["a", "b", "c", "d", "e"] {
            remote.peer_save(note(id, id)).await;
        }

        let mut ids = Vec::new();
        let mut query = RemoteQuery::new("Note", 2);
        let mut pages = 0;
        loop {
            let page = remote.query(query.clone()).await.unwrap();
            pages += 1;
            ids.extend(page.items.iter().map(|item| item.id().to_string()));
            match page.next_cursor {
                Some(cursor) => query = query.after(Some(cursor)),
                None => break,
            }
        }

        assert_eq!(pages, 3);
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_query_since_filters_old_records() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.peer_save(note("old", "x")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        remote.peer_save(note("new", "y")).await;

        let page = remote
            .query(RemoteQuery::new("Note", 10).since(Some(cutoff)))
            .await
            .unwrap();
        let ids: Vec<_> = page.items.iter().map(|item| item.id()).collect();
        assert_eq!(ids, vec!["new"]);
    }
}
