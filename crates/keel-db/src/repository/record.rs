//! # Record Repository
//!
//! Current state of every record, keyed by `(model_name, id)`.
//!
//! Deleted records are kept as tombstones (`deleted = 1`). The tombstone
//! keeps the last-known payload and the remote version, so a stale remote
//! update can never resurrect a record deleted at a newer version.
//!
//! Reads go through [`RecordRepository`]; writes only happen inside the
//! local store's transaction through the connection-level functions.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use keel_core::Record;

use crate::error::DbResult;

/// A row of the `records` table.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct RecordRow {
    pub model_name: String,
    pub id: String,
    /// Record data as JSON text.
    pub data: String,
    /// Last remote version known for this record.
    pub version: Option<i64>,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

impl RecordRow {
    /// Decodes the row into a [`Record`].
    pub fn to_record(&self) -> DbResult<Record> {
        let data = serde_json::from_str(&self.data)?;
        Ok(Record::new(&self.model_name, &self.id, data))
    }

    /// True unless the row is a tombstone.
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// Read access to records.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Gets a row by identity, tombstones included.
    pub async fn get(&self, model_name: &str, id: &str) -> DbResult<Option<RecordRow>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT model_name, id, data, version, deleted, updated_at
            FROM records
            WHERE model_name = ?1 AND id = ?2
            "#,
        )
        .bind(model_name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Lists live rows of one model, ordered by id.
    pub async fn list_live(&self, model_name: &str) -> DbResult<Vec<RecordRow>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT model_name, id, data, version, deleted, updated_at
            FROM records
            WHERE model_name = ?1 AND deleted = 0
            ORDER BY id ASC
            "#,
        )
        .bind(model_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Counts live rows of one model.
    pub async fn count_live(&self, model_name: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM records WHERE model_name = ?1 AND deleted = 0",
        )
        .bind(model_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

// =============================================================================
// Transaction-scoped writes
// =============================================================================

/// Reads a row inside the caller's transaction.
pub(crate) async fn fetch(
    conn: &mut SqliteConnection,
    model_name: &str,
    id: &str,
) -> DbResult<Option<RecordRow>> {
    let row = sqlx::query_as::<_, RecordRow>(
        r#"
        SELECT model_name, id, data, version, deleted, updated_at
        FROM records
        WHERE model_name = ?1 AND id = ?2
        "#,
    )
    .bind(model_name)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Inserts or replaces a record's current state.
pub(crate) async fn upsert(
    conn: &mut SqliteConnection,
    record: &Record,
    version: Option<i64>,
    deleted: bool,
) -> DbResult<()> {
    let data = serde_json::to_string(&record.data)?;

    sqlx::query(
        r#"
        INSERT INTO records (model_name, id, data, version, deleted, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (model_name, id) DO UPDATE SET
            data = excluded.data,
            version = excluded.version,
            deleted = excluded.deleted,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.model_name)
    .bind(&record.id)
    .bind(data)
    .bind(version)
    .bind(deleted)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Raises the stored version; never lowers it.
pub(crate) async fn raise_version(
    conn: &mut SqliteConnection,
    model_name: &str,
    id: &str,
    version: i64,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE records SET version = ?3
        WHERE model_name = ?1 AND id = ?2
          AND (version IS NULL OR version < ?3)
        "#,
    )
    .bind(model_name)
    .bind(id)
    .bind(version)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn delete_all(conn: &mut SqliteConnection) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM records")
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_and_read_back() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let note = Record::new("Note", "A", json!({"body": "one"}));

        let mut conn = db.pool().acquire().await.unwrap();
        upsert(&mut conn, &note, None, false).await.unwrap();
        upsert(&mut conn, &Record::new("Note", "A", json!({"body": "two"})), Some(3), false)
            .await
            .unwrap();
        drop(conn);

        let row = db.records().get("Note", "A").await.unwrap().unwrap();
        assert_eq!(row.version, Some(3));
        assert!(row.is_live());
        assert_eq!(row.to_record().unwrap().data, json!({"body": "two"}));
    }

    #[tokio::test]
    async fn test_tombstones_are_not_listed() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        upsert(&mut conn, &Record::new("Note", "B", json!({})), None, false)
            .await
            .unwrap();
        upsert(&mut conn, &Record::new("Note", "A", json!({})), None, true)
            .await
            .unwrap();
        drop(conn);

        let live = db.records().list_live("Note").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "B");
        assert_eq!(db.records().count_live("Note").await.unwrap(), 1);
        assert!(db.records().get("Note", "A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_raise_version_never_lowers() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        upsert(&mut conn, &Record::new("Note", "A", json!({})), Some(5), false)
            .await
            .unwrap();
        raise_version(&mut conn, "Note", "A", 2).await.unwrap();
        drop(conn);
        assert_eq!(db.records().get("Note", "A").await.unwrap().unwrap().version, Some(5));

        let mut conn = db.pool().acquire().await.unwrap();
        raise_version(&mut conn, "Note", "A", 7).await.unwrap();
        drop(conn);
        assert_eq!(db.records().get("Note", "A").await.unwrap().unwrap().version, Some(7));
    }
}
