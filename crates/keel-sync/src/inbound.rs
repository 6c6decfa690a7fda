//! # Inbound Processor
//!
//! Applies remote changes for one model as they arrive on its subscription.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  RemoteSubscription ──► lock(model, id) ──► LocalStore::apply_remote   │
//! │                                              (initiator = Remote,       │
//! │        │ closed                               never pending)            │
//! │        ▼                                                                │
//! │  backoff ──► subscribe again ──► delta catch-up (fills the gap)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Remote changes whose version is not newer than the local one are
//! skipped by the store, which also swallows the echo of our own pushes.

use backoff::backoff::Backoff;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::catchup::CatchUp;
use crate::context::{sleep_or_shutdown, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncOperation};
use crate::remote::{RemoteModel, RemoteSubscription};

pub(crate) struct InboundProcessor {
    ctx: SyncContext,
    model_name: String,
    subscription: RemoteSubscription,
    shutdown: watch::Receiver<bool>,
}

impl InboundProcessor {
    pub fn new(
        ctx: SyncContext,
        subscription: RemoteSubscription,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        InboundProcessor {
            ctx,
            model_name: subscription.model_name().to_string(),
            subscription,
            shutdown,
        }
    }

    /// Runs until shutdown or until the local store goes away.
    pub async fn run(mut self) -> SyncResult<()> {
        info!(model = %self.model_name, "Inbound processor started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                item = self.subscription.next() => {
                    let result = match item {
                        Some(remote) => self.apply(remote).await,
                        None => self.resubscribe().await,
                    };
                    match result {
                        Ok(()) => {}
                        Err(SyncError::ShuttingDown) => break,
                        Err(e) if e.is_store_closed() => {
                            debug!(model = %self.model_name, "Local store closed");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        info!(model = %self.model_name, "Inbound processor stopped");
        Ok(())
    }

    async fn apply(&self, remote: RemoteModel) -> SyncResult<()> {
        let _guard = self.ctx.locks.lock(remote.model_name(), remote.id()).await;

        match self.ctx.store.apply_remote(remote.to_apply(), false).await? {
            Some(change) => {
                self.ctx
                    .emit(SyncEvent::RemoteApplied {
                        model_name: change.model_name,
                        record_id: change.record.id,
                        version: remote.version,
                    })
                    .await;
            }
            None => debug!(
                model = %remote.model_name(),
                id = %remote.id(),
                version = remote.version,
                "Remote change already applied"
            ),
        }
        Ok(())
    }

    /// Reopens a closed subscription, then catches up on what was missed.
    async fn resubscribe(&mut self) -> SyncResult<()> {
        let mut backoff = self.ctx.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let message = match self.ctx.remote.subscribe(&self.model_name).await {
                Ok(subscription) => {
                    self.subscription = subscription;
                    break;
                }
                Err(e) if e.is_retryable() => e.to_string(),
                Err(e) => return Err(e),
            };

            self.ctx
                .emit(SyncEvent::TransientError {
                    operation: SyncOperation::Subscribe,
                    model_name: self.model_name.clone(),
                    change_id: None,
                    attempt,
                    message,
                })
                .await;

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| self.ctx.config.max_backoff());
            if sleep_or_shutdown(delay, &mut self.shutdown).await {
                return Err(SyncError::ShuttingDown);
            }
        }

        info!(model = %self.model_name, attempt, "Remote subscription reopened");
        CatchUp::new(self.ctx.clone())
            .run_model(&self.model_name, &mut self.shutdown)
            .await?;
        Ok(())
    }
}
