//! # DataStore
//!
//! The caller-facing API. Every record operation goes to the local store and
//! returns as soon as the local write commits; the orchestrator pushes it in
//! the background.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  DataStore::new(config, remote)      validate config, no I/O           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  start()                                                               │
//! │    phase 1: LocalStore::initialize(schemas) ──► gate Pending ─► Ready  │
//! │    phase 2: Orchestrator::start()            ──► catch-up, Syncing     │
//! │                                                                         │
//! │  save / query / observe issued before Ready wait on the gate           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The gate opens after phase 1, so local reads and writes work even when
//! sync cannot start.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

use keel_core::{
    ChangeRecord, Initiator, Model, ObservationFilter, QueryPredicate, Record,
};
use keel_db::{LocalStore, ObservationSubscription};
use keel_sync::{Orchestrator, RemoteSyncClient, SyncEvent, SyncState, SyncStatus};

use crate::config::DataStoreConfig;
use crate::error::{DataStoreError, DataStoreResult};
use crate::gate::{GateState, InitGate};

pub struct DataStore {
    config: DataStoreConfig,
    store: Arc<LocalStore>,
    orchestrator: Orchestrator,
    gate: InitGate,
    /// Serializes start, clear and terminate.
    lifecycle: Mutex<()>,
}

impl DataStore {
    /// Validates the configuration and wires the components together.
    pub fn new(config: DataStoreConfig, remote: Arc<dyn RemoteSyncClient>) -> DataStoreResult<Self> {
        config.validate()?;

        let store = Arc::new(LocalStore::new(config.db.clone()));
        let orchestrator = Orchestrator::builder(config.sync.clone())
            .with_store(store.clone())
            .with_remote(remote)
            .build()?;

        Ok(DataStore {
            config,
            store,
            orchestrator,
            gate: InitGate::new(),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DataStoreConfig {
        &self.config
    }

    /// Initializes storage, then starts sync.
    ///
    /// Returns the first failure. A storage failure leaves the gate pending
    /// so `start` can be retried; a sync failure leaves the store usable
    /// offline.
    pub async fn start(&self) -> DataStoreResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.gate.state() {
            GateState::Closed => return Err(DataStoreError::NotInitialized),
            GateState::Pending => {
                let registry = self.config.registry()?;
                let schemas = self.store.initialize(&registry).await?;
                self.gate.open();
                info!(models = schemas.len(), "DataStore ready");
            }
            GateState::Ready => {}
        }

        self.orchestrator.start().await?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.gate.state() == GateState::Ready
    }

    // =========================================================================
    // Records
    // =========================================================================

    pub async fn save(&self, record: Record) -> DataStoreResult<ChangeRecord> {
        self.gate.ready().await?;
        Ok(self.store.save(record, Initiator::Local, None).await?)
    }

    /// Saves only if `predicate` holds for the persisted record.
    pub async fn save_when(&self, record: Record, predicate: &QueryPredicate) -> DataStoreResult<ChangeRecord> {
        self.gate.ready().await?;
        Ok(self.store.save(record, Initiator::Local, Some(predicate)).await?)
    }

    pub async fn delete(&self, model_name: &str, id: &str) -> DataStoreResult<ChangeRecord> {
        self.gate.ready().await?;
        Ok(self.store.delete(model_name, id, Initiator::Local, None).await?)
    }

    /// Deletes only if `predicate` holds for the persisted record.
    pub async fn delete_when(
        &self,
        model_name: &str,
        id: &str,
        predicate: &QueryPredicate,
    ) -> DataStoreResult<ChangeRecord> {
        self.gate.ready().await?;
        Ok(self
            .store
            .delete(model_name, id, Initiator::Local, Some(predicate))
            .await?)
    }

    /// Live records of a model, ordered by id.
    pub async fn query(&self, model_name: &str) -> DataStoreResult<Vec<Record>> {
        self.gate.ready().await?;
        Ok(self.store.query(model_name, None).await?)
    }

    pub async fn query_where(&self, model_name: &str, predicate: &QueryPredicate) -> DataStoreResult<Vec<Record>> {
        self.gate.ready().await?;
        Ok(self.store.query(model_name, Some(predicate)).await?)
    }

    pub async fn get(&self, model_name: &str, id: &str) -> DataStoreResult<Option<Record>> {
        self.gate.ready().await?;
        Ok(self.store.get(model_name, id).await?)
    }

    pub async fn save_model<M: Model>(&self, model: &M) -> DataStoreResult<ChangeRecord> {
        self.save(model.to_record()?).await
    }

    pub async fn query_models<M: Model>(&self) -> DataStoreResult<Vec<M>> {
        self.query(M::MODEL_NAME)
            .await?
            .iter()
            .map(|record| M::from_record(record).map_err(DataStoreError::from))
            .collect()
    }

    pub async fn get_model<M: Model>(&self, id: &str) -> DataStoreResult<Option<M>> {
        match self.get(M::MODEL_NAME, id).await? {
            Some(record) => Ok(Some(M::from_record(&record)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Every committed change, local and remote.
    pub async fn observe(&self) -> DataStoreResult<ObservationSubscription> {
        self.observe_filtered(ObservationFilter::All).await
    }

    pub async fn observe_model(&self, model_name: &str) -> DataStoreResult<ObservationSubscription> {
        self.observe_filtered(ObservationFilter::model(model_name)).await
    }

    pub async fn observe_record(&self, model_name: &str, id: &str) -> DataStoreResult<ObservationSubscription> {
        self.observe_filtered(ObservationFilter::record(model_name, id)).await
    }

    /// Predicate-based observation is not implemented.
    pub async fn observe_where(
        &self,
        model_name: &str,
        _predicate: &QueryPredicate,
    ) -> DataStoreResult<ObservationSubscription> {
        Err(DataStoreError::Unsupported(format!(
            "observing {model_name} with a predicate"
        )))
    }

    async fn observe_filtered(&self, filter: ObservationFilter) -> DataStoreResult<ObservationSubscription> {
        self.gate.ready().await?;
        Ok(self.store.observe(filter).await?)
    }

    // =========================================================================
    // Sync control
    // =========================================================================

    pub async fn sync_status(&self) -> SyncStatus {
        self.orchestrator.status().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.orchestrator.subscribe_events()
    }

    pub fn subscribe_sync_state(&self) -> watch::Receiver<SyncState> {
        self.orchestrator.subscribe_state()
    }

    pub async fn stop_sync(&self) -> DataStoreResult<()> {
        Ok(self.orchestrator.stop().await?)
    }

    pub async fn start_sync(&self) -> DataStoreResult<()> {
        self.gate.ready().await?;
        Ok(self.orchestrator.start().await?)
    }

    /// Leaves `Failed` so sync can be started again.
    pub async fn reset_sync(&self) -> DataStoreResult<()> {
        Ok(self.orchestrator.reset().await?)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Deletes every local record and change, pending ones included.
    ///
    /// Sync is paused around the wipe and restarted if it was running.
    pub async fn clear(&self) -> DataStoreResult<()> {
        self.gate.ready().await?;
        let _lifecycle = self.lifecycle.lock().await;

        let was_running = self.orchestrator.state().is_active();
        if was_running {
            self.orchestrator.stop().await?;
        }

        self.store.clear().await?;
        info!("DataStore cleared");

        if was_running {
            self.orchestrator.start().await?;
        }
        Ok(())
    }

    /// Stops sync and closes the store. Every later call fails with
    /// `NotInitialized`.
    pub async fn terminate(&self) -> DataStoreResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.orchestrator.state() {
            SyncState::Stopped => {}
            SyncState::Failed => self.orchestrator.reset().await?,
            _ => {
                if let Err(e) = self.orchestrator.stop().await {
                    warn!(error = %e, "Sync did not stop cleanly");
                }
            }
        }

        self.store.terminate().await;
        self.gate.close();
        info!("DataStore terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ChangeOperation;
    use keel_db::DbConfig;
    use keel_sync::{InMemoryRemote, SyncConfig, SyncMode};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

    fn note(id: &str, body: &str) -> Record {
        Record::new("Note", id, json!({ "body": body }))
    }

    fn sync_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.sync.poll_interval_ms = 20;
        config.sync.initial_backoff_ms = 2;
        config.sync.max_backoff_ms = 10;
        config.sync.drain_timeout_ms = 1_000;
        config
    }

    fn datastore_with(db: DbConfig, sync: SyncConfig, remote: &InMemoryRemote) -> DataStore {
        let config = DataStoreConfig::new(db).with_model::<Note>().with_sync(sync);
        DataStore::new(config, Arc::new(remote.clone())).unwrap()
    }

    fn datastore(remote: &InMemoryRemote) -> DataStore {
        datastore_with(DbConfig::in_memory(), sync_config(), remote)
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let remote = InMemoryRemote::new(["Note"]);
        let config = DataStoreConfig::new(DbConfig::in_memory());
        assert!(matches!(
            DataStore::new(config, Arc::new(remote)),
            Err(DataStoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_calls_before_start_wait_for_the_gate() {
        let remote = InMemoryRemote::new(["Note"]);
        let datastore = Arc::new(datastore(&remote));

        let early_save = {
            let datastore = datastore.clone();
            tokio::spawn(async move { datastore.save(note("A", "early")).await })
        };
        let early_observe = {
            let datastore = datastore.clone();
            tokio::spawn(async move { datastore.observe_model("Note").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!early_save.is_finished());
        assert!(!early_observe.is_finished());
        assert!(!datastore.is_ready());

        datastore.start().await.unwrap();

        let change = early_save.await.unwrap().unwrap();
        assert_eq!(change.operation, ChangeOperation::Create);
        early_observe.await.unwrap().unwrap();
        assert!(datastore.get("Note", "A").await.unwrap().is_some());

        datastore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_create_is_observed_and_synced_once() {
        let remote = InMemoryRemote::new(["Note"]);
        let datastore = datastore(&remote);
        datastore.start().await.unwrap();
        let mut observed = datastore.observe().await.unwrap();

        datastore.save(note("A", "hello")).await.unwrap();

        let change = observed.next().await.unwrap();
        assert_eq!(change.initiator, Initiator::Local);
        assert_eq!(change.operation, ChangeOperation::Create);

        eventually("push", || async { datastore.sync_status().await.pending_count == 0 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(remote.mutation_count().await, 1);
        assert_eq!(remote.get("Note", "A").await.unwrap().record.data["body"], "hello");

        datastore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_edit_remote_wins() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.set_push_delay(Some(Duration::from_millis(100))).await;
        let datastore = datastore(&remote);
        datastore.start().await.unwrap();
        let mut observed = datastore.observe_record("Note", "A").await.unwrap();

        // The local push is in flight when another device writes the record
        datastore.save(note("A", "local")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        remote.peer_save(note("A", "remote")).await;

        let first = observed.next().await.unwrap();
        assert_eq!(first.initiator, Initiator::Local);
        let second = observed.next().await.unwrap();
        assert_eq!(second.initiator, Initiator::Remote);
        assert_eq!(second.record.data["body"], "remote");

        eventually("conflict resolution", || async {
            datastore.sync_status().await.pending_count == 0
        })
        .await;
        let stored = datastore.get("Note", "A").await.unwrap().unwrap();
        assert_eq!(stored.data["body"], "remote");
        assert_eq!(remote.mutation_count().await, 0);

        datastore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.fail_next_pushes(2).await;
        let datastore = datastore(&remote);
        datastore.start().await.unwrap();
        let mut events = datastore.subscribe_events();

        datastore.save(note("A", "x")).await.unwrap();
        eventually("push", || async { remote.mutation_count().await == 1 }).await;

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::TransientError { attempt, .. } = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(remote.mutation_count().await, 1);

        datastore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let remote = InMemoryRemote::new(["Note"]);
        let datastore = datastore(&remote);
        datastore.start().await.unwrap();

        let draft = QueryPredicate::eq("body", "draft");

        // A predicate against a missing record never holds
        let err = datastore.save_when(note("A", "x"), &draft).await.unwrap_err();
        assert_eq!(err.code(), "CONDITION_NOT_MET");

        datastore.save(note("A", "draft")).await.unwrap();
        datastore.save_when(note("A", "final"), &draft).await.unwrap();

        let err = datastore.delete_when("Note", "A", &draft).await.unwrap_err();
        assert_eq!(err.code(), "CONDITION_NOT_MET");
        datastore
            .delete_when("Note", "A", &QueryPredicate::eq("body", "final"))
            .await
            .unwrap();

        let err = datastore.delete("Note", "A").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        datastore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_models_and_queries() {
        let remote = InMemoryRemote::new(["Note"]);
        let datastore = datastore(&remote);
        datastore.start().await.unwrap();

        for (id, body) in [("a", "apple"), ("b", "banana"), ("c", "avocado")] {
            datastore
                .save_model(&Note {
                    id: id.into(),
                    body: body.into(),
                })
                .await
                .unwrap();
        }

        let notes: Vec<Note> = datastore.query_models().await.unwrap();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].id, "a");

        let a_words = datastore
            .query_where("Note", &QueryPredicate::begins_with("body", "a"))
            .await
            .unwrap();
        assert_eq!(a_words.len(), 2);

        let banana: Option<Note> = datastore.get_model("b").await.unwrap();
        assert_eq!(banana.unwrap().body, "banana");

        let err = datastore.save(Record::new("Post", "p", json!({}))).await.unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_MODEL");

        datastore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_observe_where_is_unsupported() {
        let remote = InMemoryRemote::new(["Note"]);
        let datastore = datastore(&remote);

        let err = datastore
            .observe_where("Note", &QueryPredicate::All)
            .await
            .unwrap_err();
        assert!(matches!(err, DataStoreError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_clear_keeps_sync_running() {
        let remote = InMemoryRemote::new(["Note"]);
        let datastore = datastore(&remote);
        datastore.start().await.unwrap();
        datastore.save(note("A", "x")).await.unwrap();

        datastore.clear().await.unwrap();

        assert!(datastore.query("Note").await.unwrap().is_empty());
        assert!(datastore.sync_status().await.state.is_active());

        datastore.save(note("B", "after clear")).await.unwrap();
        eventually("push after clear", || async {
            remote.get("Note", "B").await.is_some()
        })
        .await;

        datastore.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_rejects_later_calls() {
        let remote = InMemoryRemote::new(["Note"]);
        let datastore = datastore(&remote);
        datastore.start().await.unwrap();
        let mut observed = datastore.observe().await.unwrap();

        datastore.terminate().await.unwrap();

        assert!(observed.next().await.is_none());
        assert_eq!(datastore.sync_status().await.state, SyncState::Stopped);
        assert!(matches!(
            datastore.save(note("A", "x")).await,
            Err(DataStoreError::NotInitialized)
        ));
        assert!(matches!(datastore.start().await, Err(DataStoreError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_waiters_fail_when_terminated_before_start() {
        let remote = InMemoryRemote::new(["Note"]);
        let datastore = Arc::new(datastore(&remote));

        let waiting = {
            let datastore = datastore.clone();
            tokio::spawn(async move { datastore.query("Note").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        datastore.terminate().await.unwrap();

        assert!(matches!(
            waiting.await.unwrap(),
            Err(DataStoreError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_offline_writes_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = DbConfig::new(dir.path().join("keel.db"));
        let remote = InMemoryRemote::new(["Note"]);

        let mut offline = sync_config();
        offline.sync.mode = SyncMode::Offline;
        let first = datastore_with(db.clone(), offline, &remote);
        first.start().await.unwrap();
        first.save(note("A", "written offline")).await.unwrap();
        assert_eq!(first.sync_status().await.state, SyncState::Stopped);
        first.terminate().await.unwrap();

        let second = datastore_with(db, sync_config(), &remote);
        second.start().await.unwrap();
        eventually("push after restart", || async {
            remote.get("Note", "A").await.is_some()
        })
        .await;
        assert_eq!(remote.mutation_count().await, 1);

        second.terminate().await.unwrap();
    }
}
