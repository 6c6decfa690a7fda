//! # Startup Catch-Up
//!
//! Brings one model's local records up to date with the remote before the
//! orchestrator reports `Syncing`.
//!
//! ## Pass Selection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  last_sync unknown ─────────────────────────────► FULL  (since = None)  │
//! │  last full pass older than full_sync_interval ──► FULL                  │
//! │  otherwise ─────────────────────────────────────► DELTA (since = last)  │
//! │                                                                         │
//! │  page 1 ──► page 2 ──► ... ──► next_cursor = None ──► record watermark  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The watermark is the time the pass *started*, so anything written
//! remotely while the pass runs is picked up again by the next delta.
//! Applying a record twice is harmless: stale versions are skipped.

use backoff::backoff::Backoff;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::context::{sleep_or_shutdown, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncOperation};
use crate::remote::{RemotePage, RemoteQuery};

/// Outcome of one model's catch-up pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpReport {
    /// Remote records that changed local state.
    pub applied: usize,
    pub full: bool,
}

pub(crate) struct CatchUp {
    ctx: SyncContext,
}

impl CatchUp {
    pub fn new(ctx: SyncContext) -> Self {
        CatchUp { ctx }
    }

    /// Runs one paginated pass over a model.
    ///
    /// Transient query failures are retried with backoff until shutdown.
    pub async fn run_model(
        &self,
        model_name: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SyncResult<CatchUpReport> {
        let store = &self.ctx.store;
        let started_at = Utc::now();

        let last_sync = store.last_sync(model_name).await?;
        let last_full = store.last_full_sync(model_name).await?;
        let full = match (last_sync, last_full) {
            (Some(_), Some(full_at)) => started_at - full_at > self.ctx.config.full_sync_interval(),
            _ => true,
        };
        let since = if full { None } else { last_sync };

        info!(model = %model_name, full, since = ?since, "Starting catch-up");

        let mut query = RemoteQuery::new(model_name, self.ctx.config.sync.sync_page_size).since(since);
        let mut applied = 0;
        let mut pages = 0;

        loop {
            let page = self.query_with_retry(&query, shutdown).await?;
            pages += 1;

            for item in &page.items {
                let _guard = self.ctx.locks.lock(item.model_name(), item.id()).await;
                if store.apply_remote(item.to_apply(), false).await?.is_some() {
                    applied += 1;
                }
            }

            match page.next_cursor {
                Some(cursor) => query = query.after(Some(cursor)),
                None => break,
            }
        }

        store.set_last_sync(model_name, started_at, full).await?;
        debug!(model = %model_name, pages, applied, "Catch-up pages processed");

        self.ctx
            .emit(SyncEvent::CatchUpCompleted {
                model_name: model_name.to_string(),
                applied,
                full,
            })
            .await;

        Ok(CatchUpReport { applied, full })
    }

    async fn query_with_retry(
        &self,
        query: &RemoteQuery,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SyncResult<RemotePage> {
        let mut backoff = self.ctx.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.ctx.remote.query(query.clone()).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() => {
                    self.ctx
                        .emit(SyncEvent::TransientError {
                            operation: SyncOperation::Query,
                            model_name: query.model_name.clone(),
                            change_id: None,
                            attempt,
                            message: e.to_string(),
                        })
                        .await;

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.ctx.config.max_backoff());
                    if sleep_or_shutdown(delay, shutdown).await {
                        return Err(SyncError::ShuttingDown);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use crate::remote::InMemoryRemote;
    use keel_core::Initiator;

    #[tokio::test]
    async fn test_first_pass_is_full_and_paginated() {
        let remote = InMemoryRemote::new(["Note"]);
        for id in ["a", "b", "c", "d", "e"] {
            remote.peer_save(note(id, id)).await;
        }
        let ctx = context(&remote, fast_config()).await;
        let (_tx, mut shutdown) = watch::channel(false);

        let report = CatchUp::new(ctx.clone()).run_model("Note", &mut shutdown).await.unwrap();

        assert_eq!(report, CatchUpReport { applied: 5, full: true });
        let records = ctx.store.query("Note", None).await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(ctx.store.pending_count().await.unwrap(), 0);
        assert!(ctx.store.last_full_sync("Note").await.unwrap().is_some());

        let history = ctx.store.history("Note", "a").await.unwrap();
        assert_eq!(history[0].initiator, Initiator::Remote);
    }

    #[tokio::test]
    async fn test_second_pass_is_delta() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.peer_save(note("a", "one")).await;
        let ctx = context(&remote, fast_config()).await;
        let (_tx, mut shutdown) = watch::channel(false);
        let catch_up = CatchUp::new(ctx.clone());

        catch_up.run_model("Note", &mut shutdown).await.unwrap();
        remote.peer_save(note("b", "two")).await;

        let report = catch_up.run_model("Note", &mut shutdown).await.unwrap();
        assert!(!report.full);
        assert_eq!(report.applied, 1);
        assert!(ctx.store.get("Note", "b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_full_pass_is_repeated() {
        let remote = InMemoryRemote::new(["Note"]);
        let mut config = fast_config();
        config.sync.full_sync_interval_mins = 0;
        let ctx = context(&remote, config).await;
        let (_tx, mut shutdown) = watch::channel(false);
        let catch_up = CatchUp::new(ctx);

        assert!(catch_up.run_model("Note", &mut shutdown).await.unwrap().full);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(catch_up.run_model("Note", &mut shutdown).await.unwrap().full);
    }

    #[tokio::test]
    async fn test_transient_query_failures_are_retried() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.peer_save(note("a", "x")).await;
        remote.fail_next_queries(2).await;
        let ctx = context(&remote, fast_config()).await;
        let mut events = ctx.events.subscribe();
        let (_tx, mut shutdown) = watch::channel(false);

        let report = CatchUp::new(ctx).run_model("Note", &mut shutdown).await.unwrap();
        assert_eq!(report.applied, 1);

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::TransientError { attempt, operation, .. } = event {
                assert_eq!(operation, SyncOperation::Query);
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_retries() {
        let remote = InMemoryRemote::new(["Note"]);
        remote.fail_next_queries(u32::MAX).await;
        let mut config = fast_config();
        config.sync.initial_backoff_ms = 50;
        let ctx = context(&remote, config).await;
        let (tx, mut shutdown) = watch::channel(false);

        let pass = tokio::spawn(async move { CatchUp::new(ctx).run_model("Note", &mut shutdown).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        assert!(matches!(pass.await.unwrap(), Err(SyncError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_not_retried() {
        let remote = InMemoryRemote::new(["Todo"]);
        let ctx = context(&remote, fast_config()).await;
        let (_tx, mut shutdown) = watch::channel(false);

        let err = CatchUp::new(ctx).run_model("Note", &mut shutdown).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
