//! # Model Schema Repository
//!
//! Persists the set of registered models so that a restarted store can report
//! what it was initialized with.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use keel_core::{ModelSchema, SchemaRegistry};

use crate::error::DbResult;

/// Repository for registered model schemas.
#[derive(Debug, Clone)]
pub struct SchemaRepository {
    pool: SqlitePool,
}

impl SchemaRepository {
    /// Creates a new SchemaRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SchemaRepository { pool }
    }

    /// Upserts every schema of the registry in one transaction.
    pub async fn register_all(&self, registry: &SchemaRegistry) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for schema in registry.iter() {
            debug!(model = %schema.name, version = schema.version, "Registering model");
            sqlx::query(
                r#"
                INSERT INTO model_schemas (name, version, registered_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (name) DO UPDATE SET version = excluded.version
                "#,
            )
            .bind(&schema.name)
            .bind(schema.version)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Lists persisted schemas, ordered by name.
    pub async fn list(&self) -> DbResult<Vec<ModelSchema>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, version FROM model_schemas ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(name, version)| ModelSchema::new(name).with_version(version))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let registry =
            SchemaRegistry::from_schemas([ModelSchema::new("Todo"), ModelSchema::new("Note")])
                .unwrap();

        db.schemas().register_all(&registry).await.unwrap();
        db.schemas().register_all(&registry).await.unwrap();

        let listed = db.schemas().list().await.unwrap();
        let names: Vec<_> = listed.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Note", "Todo"]);
    }
}
