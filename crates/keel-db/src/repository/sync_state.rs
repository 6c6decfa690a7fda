//! # Sync State Repository
//!
//! Per-model catch-up bookkeeping: when the last catch-up pass completed, and
//! when the last *full* pass completed. The orchestrator uses the first for
//! delta queries and the second to decide when a full re-sync is due.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::error::DbResult;

/// A row of the `sync_state` table.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SyncStateRow {
    pub model_name: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

/// Repository for sync state.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    /// Creates a new SyncStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    pub async fn get(&self, model_name: &str) -> DbResult<Option<SyncStateRow>> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            "SELECT model_name, last_sync_at, last_full_sync_at FROM sync_state WHERE model_name = ?1",
        )
        .bind(model_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Records a completed catch-up pass.
    ///
    /// A full pass moves both timestamps; a delta pass only `last_sync_at`.
    pub async fn record_sync(
        &self,
        model_name: &str,
        at: DateTime<Utc>,
        full: bool,
    ) -> DbResult<()> {
        let full_at = full.then_some(at);

        sqlx::query(
            r#"
            INSERT INTO sync_state (model_name, last_sync_at, last_full_sync_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (model_name) DO UPDATE SET
                last_sync_at = excluded.last_sync_at,
                last_full_sync_at = COALESCE(excluded.last_full_sync_at, sync_state.last_full_sync_at)
            "#,
        )
        .bind(model_name)
        .bind(at)
        .bind(full_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub(crate) async fn delete_all(conn: &mut SqliteConnection) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM sync_state")
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
