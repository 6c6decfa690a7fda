//! # Sync Orchestrator
//!
//! Owns the sync lifecycle and the background task group.
//!
//! ## Orchestrator Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Orchestrator Architecture                          │
//! │                                                                         │
//! │  start() ──► session task                                              │
//! │               │                                                         │
//! │               ├─ 1. subscribe(model) for every registered model        │
//! │               │     └─► InboundProcessor per model                     │
//! │               ├─ 2. catch-up pass per model        (state: Starting)   │
//! │               ├─ 3. OutboundProcessor              (state: Syncing)    │
//! │               └─ 4. supervise: a fatal task error ──► Failed           │
//! │                                                                         │
//! │  stop()  ──► shutdown signal ──► wait up to drain_timeout ──► abort    │
//! │                                                                         │
//! │  OBSERVABLE:                                                           │
//! │  ───────────                                                           │
//! │  subscribe_state()  - watch channel of SyncState                       │
//! │  subscribe_events() - broadcast of SyncEvent                           │
//! │  status()           - SyncStatus snapshot                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Subscriptions open before catch-up, so a remote write that lands during
//! the pass arrives either through the pass or through the subscription.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use backoff::backoff::Backoff;
use keel_db::LocalStore;

use crate::catchup::CatchUp;
use crate::config::SyncConfig;
use crate::context::{sleep_or_shutdown, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncOperation};
use crate::inbound::InboundProcessor;
use crate::outbound::OutboundProcessor;
use crate::remote::{RemoteSubscription, RemoteSyncClient};
use crate::status::{SyncState, SyncStatus};

struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    session: JoinHandle<()>,
}

/// Reconciles a [`LocalStore`] with a remote service.
pub struct Orchestrator {
    ctx: SyncContext,
    /// Serializes start/stop/reset.
    run: Mutex<Option<RunHandle>>,
}

impl Orchestrator {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteSyncClient>, config: SyncConfig) -> Self {
        Orchestrator {
            ctx: SyncContext::new(store, remote, config),
            run: Mutex::new(None),
        }
    }

    pub fn builder(config: SyncConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    pub fn state(&self) -> SyncState {
        self.ctx.state()
    }

    /// State notifications, including `Failed`.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.ctx.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    /// Current status snapshot.
    pub async fn status(&self) -> SyncStatus {
        let tracker = self.ctx.status.read().await.clone();
        SyncStatus {
            state: self.state(),
            mode: self.ctx.config.mode(),
            pending_count: match self.ctx.store.pending_count().await {
                Ok(count) => count,
                Err(e) => {
                    warn!(error = %e, "Could not read pending count");
                    0
                }
            },
            last_sync: tracker.last_sync,
            last_error: tracker.last_error,
        }
    }

    /// Waits until the orchestrator reaches `target` or fails.
    ///
    /// Returns the state it settled in.
    pub async fn wait_for(&self, target: SyncState) -> SyncState {
        let mut rx = self.subscribe_state();
        rx.wait_for(|state| *state == target || *state == SyncState::Failed)
            .await
            .map(|state| *state)
            .unwrap_or_else(|_| self.state())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts syncing. Idempotent while `Starting` or `Syncing`.
    ///
    /// Returns once the background session is spawned; the catch-up pass
    /// runs in the background and the state moves to `Syncing` when it is
    /// done.
    pub async fn start(&self) -> SyncResult<()> {
        let mut run = self.run.lock().await;

        match self.state() {
            SyncState::Starting | SyncState::Syncing => {
                debug!("Sync already running");
                return Ok(());
            }
            state @ (SyncState::Stopping | SyncState::Failed) => {
                return Err(SyncError::InvalidState {
                    state,
                    operation: "start",
                });
            }
            SyncState::Stopped => {}
        }

        if !self.ctx.config.is_sync_enabled() {
            info!(mode = %self.ctx.config.mode(), "Sync is disabled");
            return Ok(());
        }

        let models = self.ctx.store.schemas().await?.model_names();

        info!(
            device_id = %self.ctx.config.device_id(),
            models = models.len(),
            "Starting sync"
        );
        self.ctx.set_state(SyncState::Starting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = tokio::spawn(run_session(self.ctx.clone(), models, shutdown_rx));
        *run = Some(RunHandle {
            shutdown_tx,
            session,
        });

        Ok(())
    }

    /// Stops syncing. In-flight pushes get `drain_timeout` to finish; whatever
    /// is still running after that is aborted and its changes stay pending.
    pub async fn stop(&self) -> SyncResult<()> {
        let mut run = self.run.lock().await;

        match self.state() {
            SyncState::Stopped => return Ok(()),
            state @ SyncState::Failed => {
                return Err(SyncError::InvalidState {
                    state,
                    operation: "stop",
                });
            }
            _ => {}
        }

        info!("Stopping sync");
        self.ctx.set_state(SyncState::Stopping);

        if let Some(RunHandle {
            shutdown_tx,
            mut session,
        }) = run.take()
        {
            let _ = shutdown_tx.send(true);
            let drain_timeout = self.ctx.config.drain_timeout();

            if tokio::time::timeout(drain_timeout, &mut session).await.is_err() {
                warn!(
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "Drain timed out; aborting in-flight sync work"
                );
                session.abort();
                let _ = session.await;
            }
        }

        self.ctx.transition(SyncState::Stopping, SyncState::Stopped);
        info!("Sync stopped");
        Ok(())
    }

    /// Leaves `Failed` for `Stopped`. A no-op when already stopped.
    pub async fn reset(&self) -> SyncResult<()> {
        let mut run = self.run.lock().await;

        match self.state() {
            SyncState::Stopped => return Ok(()),
            SyncState::Failed => {}
            state => {
                return Err(SyncError::InvalidState {
                    state,
                    operation: "reset",
                });
            }
        }

        if let Some(handle) = run.take() {
            let _ = handle.shutdown_tx.send(true);
            handle.session.abort();
        }

        self.ctx.set_state(SyncState::Stopped);
        info!("Sync reset after failure");
        Ok(())
    }
}

// =============================================================================
// Session
// =============================================================================

async fn run_session(ctx: SyncContext, models: Vec<String>, mut shutdown: watch::Receiver<bool>) {
    let mut tasks: JoinSet<SyncResult<()>> = JoinSet::new();

    // 1. Subscriptions
    for model_name in &models {
        let subscription = match subscribe_with_retry(&ctx, model_name, &mut shutdown).await {
            Ok(subscription) => subscription,
            Err(SyncError::ShuttingDown) => return drain(tasks).await,
            Err(e) => {
                ctx.fail(e).await;
                return;
            }
        };
        tasks.spawn(InboundProcessor::new(ctx.clone(), subscription, shutdown.clone()).run());
    }

    // 2. Catch-up
    let catch_up = CatchUp::new(ctx.clone());
    for model_name in &models {
        match catch_up.run_model(model_name, &mut shutdown).await {
            Ok(_) => {}
            Err(SyncError::ShuttingDown) => return drain(tasks).await,
            Err(e) if e.is_store_closed() => return drain(tasks).await,
            Err(e) => {
                ctx.fail(e).await;
                return;
            }
        }
    }

    // 3. Steady state
    if !ctx.transition(SyncState::Starting, SyncState::Syncing) {
        // stop() got there first
        return drain(tasks).await;
    }
    tasks.spawn(OutboundProcessor::new(ctx.clone(), shutdown.clone()).run());

    // 4. Supervise
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            joined = tasks.join_next() => match joined {
                None => {
                    let _ = shutdown.changed().await;
                    break;
                }
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    ctx.fail(e).await;
                    return;
                }
                Some(Err(join_err)) => {
                    if join_err.is_panic() {
                        ctx.fail(SyncError::Internal(format!("sync task panicked: {join_err}"))).await;
                        return;
                    }
                }
            }
        }
    }

    drain(tasks).await;
}

/// Waits for every task to observe shutdown.
async fn drain(mut tasks: JoinSet<SyncResult<()>>) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Sync task ended with error during shutdown"),
            Err(join_err) if join_err.is_panic() => error!(error = %join_err, "Sync task panicked"),
            Err(_) => {}
        }
    }
    debug!("Sync tasks drained");
}

async fn subscribe_with_retry(
    ctx: &SyncContext,
    model_name: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> SyncResult<RemoteSubscription> {
    let mut backoff = ctx.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match ctx.remote.subscribe(model_name).await {
            Ok(subscription) => return Ok(subscription),
            Err(e) if e.is_retryable() => {
                ctx.emit(SyncEvent::TransientError {
                    operation: SyncOperation::Subscribe,
                    model_name: model_name.to_string(),
                    change_id: None,
                    attempt,
                    message: e.to_string(),
                })
                .await;

                let delay = backoff.next_backoff().unwrap_or_else(|| ctx.config.max_backoff());
                if sleep_or_shutdown(delay, shutdown).await {
                    return Err(SyncError::ShuttingDown);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for creating an orchestrator with validated configuration.
pub struct OrchestratorBuilder {
    config: SyncConfig,
    store: Option<Arc<LocalStore>>,
    remote: Option<Arc<dyn RemoteSyncClient>>,
}

impl OrchestratorBuilder {
    pub fn new(config: SyncConfig) -> Self {
        OrchestratorBuilder {
            config,
            store: None,
            remote: None,
        }
    }

    pub fn with_store(mut self, store: Arc<LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteSyncClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn build(self) -> SyncResult<Orchestrator> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("Local store is required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote client is required".into()))?;

        Ok(Orchestrator::new(store, remote, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::context::testing::*;
    use crate::remote::InMemoryRemote;
    use keel_core::{Initiator, ObservationFilter};
    use std::time::Duration;

    async fn orchestrator(remote: &InMemoryRemote, config: SyncConfig) -> (Arc<LocalStore>, Orchestrator) {
        let store = ready_store(&["Note"]).await;
        let orchestrator = Orchestrator::builder(config)
            .with_store(store.clone())
            .with_remote(Arc::new(remote.clone()))
            .build()
            .unwrap();
        (store, orchestrator)
    }

    async fn syncing(orchestrator: &Orchestrator) {
        orchestrator.start().await.unwrap();
        let settled = tokio::time::timeout(Duration::from_secs(3), orchestrator.wait_for(SyncState::Syncing))
            .await
            .unwrap();
        assert_eq!(settled, SyncState::Syncing);
    }

    #[tokio::test]
    async fn test_builder_requires_store_and_remote() {
        assert!(Orchestrator::builder(fast_config()).build().is_err());

        let mut config = fast_config();
        config.device.id = String::new();
        let store = ready_store(&["Note"]).await;
        let err = Orchestrator::builder(config)
            .with_store(store)
            .with_remote(Arc::new(InMemoryRemote::new(["Note"])))
            .build()
            .err()
            .unwrap();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_local_create_is_observed_and_synced_once() {
        let remote = InMemoryRemote::new(["Note"]);
        let (store, orchestrator) = orchestrator(&remote, fast_config()).await;
        syncing(&orchestrator).await;
        let mut observed = store.observe(ObservationFilter::All).await.unwrap();

        store.save(note("A", "hello"), Initiator::Local, None).await.unwrap();

        let change = observed.next().await.unwrap();
        assert_eq!(change.initiator, Initiator::Local);

        eventually("push to be acknowledged", || async {
            store.pending_count().await.unwrap() == 0
        })
        .await;
        // Give the echo from the remote subscription time to arrive
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(remote.mutation_count().await, 1);
        assert_eq!(store.history("Note", "A").await.unwrap().len(), 1);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_change_is_never_pushed_back() {
        let remote = InMemoryRemote::new(["Note"]);
        let (store, orchestrator) = orchestrator(&remote, fast_config()).await;
        syncing(&orchestrator).await;

        remote.peer_save(note("P", "from peer")).await;
        eventually("remote record", || async {
            store.get("Note", "P").await.unwrap().is_some()
        })
        .await;

        // Several poll intervals pass without a push
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(remote.push_log().await.is_empty());
        assert_eq!(store.pending_count().await.unwrap(), 0);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_catch_up_runs_before_syncing() {
        let remote = InMemoryRemote::new(["Note"]);
        for id in ["a", "b", "c"] {
            remote.peer_save(note(id, id)).await;
        }
        let (store, orchestrator) = orchestrator(&remote, fast_config()).await;
        let mut events = orchestrator.subscribe_events();

        syncing(&orchestrator).await;

        assert_eq!(store.query("Note", None).await.unwrap().len(), 3);
        let mut completed = None;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::CatchUpCompleted { applied, full, .. } = event {
                completed = Some((applied, full));
            }
        }
        assert_eq!(completed, Some((3, true)));
        assert!(orchestrator.status().await.last_sync.is_some());

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_wins_over_offline_edit() {
        let remote = InMemoryRemote::new(["Note"]);
        let (store, orchestrator) = orchestrator(&remote, fast_config()).await;

        // Edited offline while another device wrote the same record
        store.save(note("A", "local"), Initiator::Local, None).await.unwrap();
        remote.peer_save(note("A", "remote")).await;

        syncing(&orchestrator).await;
        eventually("pending to clear", || async {
            store.pending_count().await.unwrap() == 0
        })
        .await;

        assert_eq!(store.get("Note", "A").await.unwrap().unwrap().data["body"], "remote");
        assert_eq!(remote.mutation_count().await, 0);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let remote = InMemoryRemote::new(["Note"]);
        let (_store, orchestrator) = orchestrator(&remote, fast_config()).await;

        orchestrator.start().await.unwrap();
        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.wait_for(SyncState::Syncing).await, SyncState::Syncing);
        orchestrator.start().await.unwrap();

        // One subscription per model, not one per start call
        assert_eq!(remote.subscriber_count("Note").await, 1);
        orchestrator.stop().await.unwrap();
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state(), SyncState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_then_start_keeps_pending_changes() {
        let remote = InMemoryRemote::new(["Note"]);
        let (store, orchestrator) = orchestrator(&remote, fast_config()).await;
        syncing(&orchestrator).await;
        orchestrator.stop().await.unwrap();

        store.save(note("A", "while stopped"), Initiator::Local, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(remote.mutation_count().await, 0);
        assert_eq!(orchestrator.status().await.pending_count, 1);

        syncing(&orchestrator).await;
        eventually("push after restart", || async {
            remote.mutation_count().await == 1
        })
        .await;

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_push() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.set_push_delay(Some(Duration::from_millis(150))).await;
        let (store, orchestrator) = orchestrator(&remote, fast_config()).await;
        syncing(&orchestrator).await;

        store.save(note("A", "x"), Initiator::Local, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.stop().await.unwrap();

        assert_eq!(orchestrator.state(), SyncState::Stopped);
        assert_eq!(remote.mutation_count().await, 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_aborts_after_drain_timeout() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.set_push_delay(Some(Duration::from_secs(5))).await;
        let mut config = fast_config();
        config.sync.drain_timeout_ms = 50;
        let (store, orchestrator) = orchestrator(&remote, config).await;
        syncing(&orchestrator).await;

        store.save(note("A", "x"), Initiator::Local, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopping = tokio::time::Instant::now();
        orchestrator.stop().await.unwrap();
        assert!(stopping.elapsed() < Duration::from_secs(2));
        assert_eq!(orchestrator.state(), SyncState::Stopped);

        // The aborted change is still pending and goes out on the next start
        assert_eq!(store.pending_count().await.unwrap(), 1);
        remote.set_push_delay(None).await;
        syncing(&orchestrator).await;
        eventually("push after restart", || async {
            store.pending_count().await.unwrap() == 0
        })
        .await;
        assert_eq!(remote.mutation_count().await, 1);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_mismatch_moves_to_failed() {
        // The remote does not know Todo
        let remote = InMemoryRemote::new(["Note"]);
        let store = ready_store(&["Note", "Todo"]).await;
        let orchestrator = Orchestrator::new(store, Arc::new(remote.clone()), fast_config());
        let mut state = orchestrator.subscribe_state();
        let mut events = orchestrator.subscribe_events();

        orchestrator.start().await.unwrap();
        let failed = tokio::time::timeout(
            Duration::from_secs(3),
            state.wait_for(|s| *s == SyncState::Failed),
        )
        .await
        .unwrap()
        .map(|s| *s);
        assert_eq!(failed.ok(), Some(SyncState::Failed));

        let mut fatal = false;
        while let Ok(event) = events.try_recv() {
            fatal |= matches!(event, SyncEvent::Fatal { .. });
        }
        assert!(fatal);
        assert!(orchestrator.status().await.last_error.is_some());

        assert!(matches!(
            orchestrator.start().await,
            Err(SyncError::InvalidState { state: SyncState::Failed, .. })
        ));
        assert!(matches!(
            orchestrator.stop().await,
            Err(SyncError::InvalidState { .. })
        ));

        // A state subscriber still alive here must not block the reset
        tokio::time::timeout(Duration::from_secs(1), orchestrator.reset())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(orchestrator.state(), SyncState::Stopped);
        drop(state);
    }

    #[tokio::test]
    async fn test_status_survives_closed_store() {
        let remote = InMemoryRemote::new(["Note"]);
        let (store, orchestrator) = orchestrator(&remote, fast_config()).await;
        store.save(note("A", "x"), Initiator::Local, None).await.unwrap();
        assert_eq!(orchestrator.status().await.pending_count, 1);

        store.terminate().await;
        let status = orchestrator.status().await;
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.state, SyncState::Stopped);
    }

    #[tokio::test]
    async fn test_fatal_push_moves_to_failed() {
        let remote = InMemoryRemote::new(["Note"]);
        let (store, orchestrator) = orchestrator(&remote, fast_config()).await;
        syncing(&orchestrator).await;

        remote.fail_fatally("credentials revoked").await;
        store.save(note("A", "x"), Initiator::Local, None).await.unwrap();

        let settled = tokio::time::timeout(Duration::from_secs(3), orchestrator.wait_for(SyncState::Failed))
            .await
            .unwrap();
        assert_eq!(settled, SyncState::Failed);

        // The local write itself succeeded and stays pending
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert!(store.get("Note", "A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_mode_never_starts() {
        let remote = InMemoryRemote::new(["Note"]);
        let mut config = fast_config();
        config.sync.mode = SyncMode::Offline;
        let (store, orchestrator) = orchestrator(&remote, config).await;

        orchestrator.start().await.unwrap();
        store.save(note("A", "x"), Initiator::Local, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(orchestrator.state(), SyncState::Stopped);
        assert_eq!(remote.subscriber_count("Note").await, 0);
        assert_eq!(orchestrator.status().await.mode, SyncMode::Offline);
    }

    #[tokio::test]
    async fn test_reset_rejected_while_running() {
        let remote = InMemoryRemote::new(["Note"]);
        let (_store, orchestrator) = orchestrator(&remote, fast_config()).await;
        syncing(&orchestrator).await;

        assert!(matches!(
            orchestrator.reset().await,
            Err(SyncError::InvalidState { state: SyncState::Syncing, .. })
        ));
        orchestrator.stop().await.unwrap();
        orchestrator.reset().await.unwrap();
    }
}
