//! # Change Log Repository
//!
//! Durable, append-only log of change records. This is the local store's
//! outbox: a local mutation and its change-log row commit in one transaction,
//! and the row stays pending until the orchestrator acknowledges it.
//!
//! ## Row Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  save/delete (DATA_STORE_API)                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  PENDING  (synced_at IS NULL) ──push ok──────────► SYNCED              │
//! │       │                       ──push transient──► PENDING (attempts+1) │
//! │       │                       ──remote wins─────► SUPERSEDED           │
//! │                                                    (synced_at set,     │
//! │  apply_remote (SYNC_ENGINE)                         last_error note)   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SYNCED on insert (remote changes are never pushed back)               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use keel_core::{StorageInitiator, StoredChange};

use crate::error::DbResult;

/// Note stored on local changes overridden by a newer remote version.
pub const SUPERSEDED_NOTE: &str = "superseded by remote";

const SELECT_COLUMNS: &str = r#"
    SELECT seq, change_id, model_name, record_id, operation, initiator,
           payload, version, created_at, attempts, last_error, synced_at
    FROM change_log
"#;

/// Repository for change log reads and bookkeeping.
#[derive(Debug, Clone)]
pub struct ChangeLogRepository {
    pool: SqlitePool,
}

impl ChangeLogRepository {
    /// Creates a new ChangeLogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ChangeLogRepository { pool }
    }

    /// Gets unacknowledged local changes, oldest first.
    ///
    /// Only `DATA_STORE_API` rows qualify; rows written by the sync engine
    /// are acknowledged on insert and never appear here.
    pub async fn get_pending(&self, limit: u32) -> DbResult<Vec<StoredChange>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE synced_at IS NULL AND initiator = ?1 ORDER BY seq ASC LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, StoredChange>(&sql)
            .bind(StorageInitiator::DataStoreApi.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// Pending local changes of one model, oldest first.
    pub async fn get_pending_for_model(&self, model_name: &str, limit: u32) -> DbResult<Vec<StoredChange>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE synced_at IS NULL AND initiator = ?1 AND model_name = ?2 \
             ORDER BY seq ASC LIMIT ?3"
        );
        let rows = sqlx::query_as::<_, StoredChange>(&sql)
            .bind(StorageInitiator::DataStoreApi.as_str())
            .bind(model_name)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// Every change committed after `seq`, in log order, regardless of
    /// initiator or sync status.
    pub async fn after_sequence(&self, seq: i64, limit: u32) -> DbResult<Vec<StoredChange>> {
        let sql = format!("{SELECT_COLUMNS} WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2");
        let rows = sqlx::query_as::<_, StoredChange>(&sql)
            .bind(seq)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// Highest sequence ever assigned, 0 for an empty log.
    pub async fn last_sequence(&self) -> DbResult<i64> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM change_log")
            .fetch_one(&self.pool)
            .await?;

        Ok(seq.unwrap_or(0))
    }

    /// Counts pending local changes.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM change_log WHERE synced_at IS NULL AND initiator = ?1",
        )
        .bind(StorageInitiator::DataStoreApi.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Gets one change by id.
    pub async fn get(&self, change_id: &str) -> DbResult<Option<StoredChange>> {
        let sql = format!("{SELECT_COLUMNS} WHERE change_id = ?1");
        let row = sqlx::query_as::<_, StoredChange>(&sql)
            .bind(change_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    /// Full history of one record, in log order.
    pub async fn for_record(&self, model_name: &str, record_id: &str) -> DbResult<Vec<StoredChange>> {
        let sql = format!("{SELECT_COLUMNS} WHERE model_name = ?1 AND record_id = ?2 ORDER BY seq ASC");
        let rows = sqlx::query_as::<_, StoredChange>(&sql)
            .bind(model_name)
            .bind(record_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// Records a push failure. The change stays pending.
    pub async fn mark_failed(&self, change_id: &str, error: &str) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE change_log SET
                attempts = attempts + 1,
                last_error = ?2
            WHERE change_id = ?1 AND synced_at IS NULL
            "#,
        )
        .bind(change_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes acknowledged entries older than `days_old` days.
    ///
    /// Pending entries are never deleted.
    pub async fn cleanup_old_entries(&self, days_old: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days_old));

        let result = sqlx::query(
            r#"
            DELETE FROM change_log
            WHERE synced_at IS NOT NULL
            AND synced_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        debug!(removed = result.rows_affected(), days_old, "Change log cleanup");
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Transaction-scoped writes
// =============================================================================

/// Appends a change row and returns its log position.
pub(crate) async fn append(conn: &mut SqliteConnection, change: &StoredChange) -> DbResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO change_log (
            change_id, model_name, record_id, operation, initiator,
            payload, version, created_at, attempts, last_error, synced_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10, ?11
        )
        "#,
    )
    .bind(&change.change_id)
    .bind(&change.model_name)
    .bind(&change.record_id)
    .bind(&change.operation)
    .bind(&change.initiator)
    .bind(&change.payload)
    .bind(change.version)
    .bind(change.created_at)
    .bind(change.attempts)
    .bind(&change.last_error)
    .bind(change.synced_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Reads one change inside the caller's transaction.
pub(crate) async fn fetch(conn: &mut SqliteConnection, change_id: &str) -> DbResult<Option<StoredChange>> {
    let sql = format!("{SELECT_COLUMNS} WHERE change_id = ?1");
    let row = sqlx::query_as::<_, StoredChange>(&sql)
        .bind(change_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row)
}

/// Acknowledges a change with the version the remote assigned.
pub(crate) async fn mark_synced(
    conn: &mut SqliteConnection,
    change_id: &str,
    version: i64,
) -> DbResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE change_log SET
            synced_at = ?2,
            version = ?3
        WHERE change_id = ?1 AND synced_at IS NULL
        "#,
    )
    .bind(change_id)
    .bind(Utc::now())
    .bind(version)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Closes every pending local change of one record. The rows stay in the
/// log with a note.
pub(crate) async fn supersede_pending(
    conn: &mut SqliteConnection,
    model_name: &str,
    record_id: &str,
) -> DbResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE change_log SET
            synced_at = ?3,
            last_error = ?4
        WHERE model_name = ?1 AND record_id = ?2
          AND synced_at IS NULL AND initiator = ?5
        "#,
    )
    .bind(model_name)
    .bind(record_id)
    .bind(Utc::now())
    .bind(SUPERSEDED_NOTE)
    .bind(StorageInitiator::DataStoreApi.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

pub(crate) async fn delete_all(conn: &mut SqliteConnection) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM change_log")
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use keel_core::{ChangeConverter, ChangeOperation, ChangeRecord, Initiator, Record};
    use serde_json::json;

    fn stored(id: &str, initiator: Initiator) -> StoredChange {
        let change = ChangeRecord::new(
            Record::new("Note", id, json!({"body": id})),
            ChangeOperation::Create,
            initiator,
        );
        ChangeConverter::to_stored(&change).unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_sequence() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        let first = append(&mut conn, &stored("A", Initiator::Local)).await.unwrap();
        let second = append(&mut conn, &stored("B", Initiator::Local)).await.unwrap();
        drop(conn);

        assert!(second > first);
        let pending = db.change_log().get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].record_id, "A");
        assert_eq!(pending[0].seq, first);
    }

    #[tokio::test]
    async fn test_pending_by_model_and_reads_after_sequence() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let first = append(&mut conn, &stored("A", Initiator::Local)).await.unwrap();
        let todo = ChangeRecord::new(
            Record::new("Todo", "T", json!({"done": false})),
            ChangeOperation::Create,
            Initiator::Local,
        );
        append(&mut conn, &ChangeConverter::to_stored(&todo).unwrap()).await.unwrap();
        let last = append(&mut conn, &stored("B", Initiator::Remote)).await.unwrap();
        drop(conn);

        let todos = db.change_log().get_pending_for_model("Todo", 10).await.unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].record_id, "T");
        assert!(db.change_log().get_pending_for_model("Other", 10).await.unwrap().is_empty());

        let after: Vec<String> = db
            .change_log()
            .after_sequence(first, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.record_id)
            .collect();
        assert_eq!(after, vec!["T", "B"]);
        assert_eq!(db.change_log().last_sequence().await.unwrap(), last);
    }

    #[tokio::test]
    async fn test_remote_rows_are_never_pending() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        append(&mut conn, &stored("A", Initiator::Remote)).await.unwrap();
        drop(conn);

        assert_eq!(db.change_log().count_pending().await.unwrap(), 0);
        assert!(db.change_log().get_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_change_id_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let row = stored("A", Initiator::Local);
        let mut conn = db.pool().acquire().await.unwrap();
        append(&mut conn, &row).await.unwrap();

        let err = append(&mut conn, &row).await.unwrap_err();
        assert!(matches!(err, crate::DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_mark_failed_then_synced() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let row = stored("A", Initiator::Local);
        let mut conn = db.pool().acquire().await.unwrap();
        append(&mut conn, &row).await.unwrap();
        drop(conn);

        db.change_log().mark_failed(&row.change_id, "offline").await.unwrap();
        let after = db.change_log().get(&row.change_id).await.unwrap().unwrap();
        assert_eq!(after.attempts, 1);
        assert_eq!(after.last_error.as_deref(), Some("offline"));
        assert!(after.is_pending());

        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(mark_synced(&mut conn, &row.change_id, 4).await.unwrap(), 1);
        // Second acknowledgement is a no-op
        assert_eq!(mark_synced(&mut conn, &row.change_id, 4).await.unwrap(), 0);
        drop(conn);

        let after = db.change_log().get(&row.change_id).await.unwrap().unwrap();
        assert!(!after.is_pending());
        assert_eq!(after.version, Some(4));
    }

    #[tokio::test]
    async fn test_supersede_keeps_history() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        append(&mut conn, &stored("A", Initiator::Local)).await.unwrap();
        append(&mut conn, &stored("B", Initiator::Local)).await.unwrap();
        assert_eq!(supersede_pending(&mut conn, "Note", "A").await.unwrap(), 1);
        drop(conn);

        let history = db.change_log().for_record("Note", "A").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].last_error.as_deref(), Some(SUPERSEDED_NOTE));
        assert_eq!(db.change_log().count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_pending() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        append(&mut conn, &stored("A", Initiator::Local)).await.unwrap();
        drop(conn);

        assert_eq!(db.change_log().cleanup_old_entries(0).await.unwrap(), 0);
        assert_eq!(db.change_log().count_pending().await.unwrap(), 1);
    }
}
