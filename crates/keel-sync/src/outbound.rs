//! # Outbound Processor
//!
//! Pushes pending local changes to the remote.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Outbound Processing Flow                           │
//! │                                                                         │
//! │  wake: local change observed (initiator = Local) or poll tick          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  per model: pending_changes_for(model, batch_size)                     │
//! │       │                                                                 │
//! │       ├── Note queue ──► push ──► push ──► ...   (one in flight)       │
//! │       ├── Todo queue ──► push ──► ...            (models concurrent)   │
//! │       ▼                                                                 │
//! │  per change, under the record's lock:                                  │
//! │    Ok(remote)       ──► mark_synced(version)                           │
//! │    Conflict(remote) ──► apply remote copy (forced), local superseded   │
//! │    Transient        ──► backoff, retry up to max_push_attempts,        │
//! │                         then mark_failed + PushDeferred                │
//! │    Fatal            ──► orchestrator Failed                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A deferred change stops its model's queue for the pass so later changes
//! of the same record are never pushed ahead of it. Each model reads its own
//! batch, so a backlog stuck on one model never starves the others.

use backoff::backoff::Backoff;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use keel_core::{ChangeRecord, Initiator, ObservationFilter};

use crate::context::{sleep_or_shutdown, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncOperation};

/// What happened to one pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushResult {
    Synced,
    /// Remote copy won; the local change was superseded.
    Resolved,
    /// Already acknowledged or superseded while waiting for the lock.
    Skipped,
    /// Out of attempts for this pass.
    Deferred,
    /// Shutdown requested during backoff.
    Interrupted,
}

pub(crate) struct OutboundProcessor {
    ctx: SyncContext,
    shutdown: watch::Receiver<bool>,
}

impl OutboundProcessor {
    pub fn new(ctx: SyncContext, shutdown: watch::Receiver<bool>) -> Self {
        OutboundProcessor { ctx, shutdown }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Runs until shutdown or until the local store goes away.
    pub async fn run(mut self) -> SyncResult<()> {
        let mut local_changes = match self
            .ctx
            .store
            .observe(ObservationFilter::Initiator(Initiator::Local))
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                debug!(error = %e, "Local store unavailable; outbound not started");
                return Ok(());
            }
        };

        let mut interval = tokio::time::interval(self.ctx.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.ctx.config.sync.poll_interval_ms,
            batch_size = self.ctx.config.sync.batch_size,
            "Outbound processor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = interval.tick() => {}
                change = local_changes.next() => {
                    if change.is_none() {
                        debug!("Local store closed");
                        break;
                    }
                }
            }

            if self.is_shutting_down() {
                break;
            }

            match self.process_pending().await {
                Ok(pushed) if pushed > 0 => debug!(pushed, "Outbound pass complete"),
                Ok(_) => {}
                Err(e) if e.is_store_closed() => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Outbound pass failed"),
            }
        }

        info!("Outbound processor stopped");
        Ok(())
    }

    /// One pass over the pending changes. Returns how many were synced.
    pub async fn process_pending(&self) -> SyncResult<usize> {
        let batch_size = self.ctx.config.sync.batch_size;
        let mut queues = Vec::new();
        for model_name in self.ctx.store.schemas().await?.model_names() {
            let pending = self.ctx.store.pending_changes_for(&model_name, batch_size).await?;
            if !pending.is_empty() {
                queues.push((model_name, pending));
            }
        }
        if queues.is_empty() {
            return Ok(0);
        }
        debug!(models = queues.len(), "Pushing pending changes");

        let results = join_all(
            queues
                .into_iter()
                .map(|(model_name, changes)| self.push_queue(model_name, changes)),
        )
        .await;

        let mut synced = 0;
        for result in results {
            synced += result?;
        }
        Ok(synced)
    }

    /// Pushes one model's changes strictly in log order.
    async fn push_queue(&self, model_name: String, changes: Vec<ChangeRecord>) -> SyncResult<usize> {
        let mut shutdown = self.shutdown.clone();
        let mut synced = 0;

        for change in &changes {
            if *shutdown.borrow() {
                break;
            }
            match self.push_change(change, &mut shutdown).await? {
                PushResult::Synced => synced += 1,
                PushResult::Resolved | PushResult::Skipped => {}
                PushResult::Deferred | PushResult::Interrupted => {
                    debug!(model = %model_name, "Queue paused until next pass");
                    break;
                }
            }
        }
        Ok(synced)
    }

    async fn push_change(
        &self,
        change: &ChangeRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SyncResult<PushResult> {
        let store = &self.ctx.store;
        let _guard = self.ctx.locks.lock(&change.model_name, change.record_id()).await;

        if !store.is_pending(change.change_id).await? {
            return Ok(PushResult::Skipped);
        }
        let base_version = store.record_version(&change.model_name, change.record_id()).await?;

        let max_attempts = self.ctx.config.sync.max_push_attempts;
        let mut backoff = self.ctx.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.ctx.remote.push(change, base_version).await {
                Ok(remote) => {
                    store.mark_synced(change.change_id, remote.version).await?;
                    self.ctx
                        .emit(SyncEvent::Pushed {
                            change_id: change.change_id,
                            model_name: change.model_name.clone(),
                            record_id: change.record_id().to_string(),
                            version: remote.version,
                        })
                        .await;
                    return Ok(PushResult::Synced);
                }
                Err(SyncError::Conflict { remote }) => {
                    store.apply_remote(remote.to_apply(), true).await?;
                    self.ctx
                        .emit(SyncEvent::ConflictResolved {
                            change_id: change.change_id,
                            model_name: change.model_name.clone(),
                            record_id: change.record_id().to_string(),
                            remote_version: remote.version,
                        })
                        .await;
                    return Ok(PushResult::Resolved);
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            let message = err.to_string();
            self.ctx
                .emit(SyncEvent::TransientError {
                    operation: SyncOperation::Push,
                    model_name: change.model_name.clone(),
                    change_id: Some(change.change_id),
                    attempt,
                    message: message.clone(),
                })
                .await;

            if attempt >= max_attempts {
                store.mark_failed(change.change_id, &message).await?;
                self.ctx
                    .emit(SyncEvent::PushDeferred {
                        change_id: change.change_id,
                        model_name: change.model_name.clone(),
                        attempts: attempt,
                        message,
                    })
                    .await;
                return Ok(PushResult::Deferred);
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| self.ctx.config.max_backoff());
            if sleep_or_shutdown(delay, shutdown).await {
                return Ok(PushResult::Interrupted);
            }
        }
    }
}
