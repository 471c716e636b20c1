//! Database-backed checkpoint storage.
//!
//! Checkpoints live in one PostgreSQL table keyed by collection name:
//! - Upserts are single statements, so a checkpoint is never half-written
//! - Several runs against different collections can share the table
//! - `updated_at` gives a history of when each collection last advanced

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde_json::Value;
use tokio_postgres::Row;
use tracing::debug;

use crate::core::SortValue;
use crate::drivers::postgres::{connect_pool, is_already_exists, pool_error, qualify_table, quote_ident};
use crate::error::{Component, MigrateError, Result};
use crate::state::backend::CheckpointStore;
use crate::state::Checkpoint;

/// PostgreSQL checkpoint table.
pub struct PgCheckpointStore {
    pool: Pool,
    schema: String,
    table: String,
}

impl PgCheckpointStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Pool, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Connect to `url` and create a store.
    pub async fn connect(
        url: &str,
        schema: &str,
        table: &str,
        max_connections: usize,
    ) -> Result<Self> {
        let pool = connect_pool(url, max_connections, Component::Checkpoint).await?;
        Ok(Self::new(pool, schema, table))
    }

    fn qualified(&self) -> String {
        qualify_table(&self.schema, &self.table)
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| pool_error(Component::Checkpoint, e))
    }
}

fn db_error(e: tokio_postgres::Error) -> MigrateError {
    match e.as_db_error() {
        Some(db) => MigrateError::Checkpoint(db.message().to_string()),
        None => MigrateError::connectivity(Component::Checkpoint, e.to_string()),
    }
}

fn value_to_json(value: &Option<SortValue>) -> Result<Option<Value>> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(MigrateError::from)
}

fn value_from_json(value: Option<Value>) -> Result<Option<SortValue>> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| MigrateError::Checkpoint(format!("stored sort value is not valid: {}", e)))
}

fn row_to_checkpoint(row: &Row) -> Result<Checkpoint> {
    let collection_id: String = row.try_get(0).map_err(db_error)?;
    let sort_field: String = row.try_get(1).map_err(db_error)?;
    let last_value: Option<Value> = row.try_get(2).map_err(db_error)?;
    let last_tiebreak: Option<Value> = row.try_get(3).map_err(db_error)?;
    let documents_transferred: i64 = row.try_get(4).map_err(db_error)?;
    let updated_at: DateTime<Utc> = row.try_get(5).map_err(db_error)?;

    Ok(Checkpoint {
        collection_id,
        sort_field,
        last_value: value_from_json(last_value)?,
        last_tiebreak: value_from_json(last_tiebreak)?,
        documents_transferred: u64::try_from(documents_transferred).unwrap_or(0),
        updated_at,
    })
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn ensure_ready(&self) -> Result<()> {
        let client = self.client().await?;

        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    collection_id TEXT PRIMARY KEY,
                    sort_field TEXT NOT NULL,
                    last_value JSONB,
                    last_tiebreak JSONB,
                    documents_transferred BIGINT NOT NULL DEFAULT 0,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.qualified()
            ),
        ];

        for sql in &statements {
            if let Err(e) = client.batch_execute(sql).await {
                if is_already_exists(&e) {
                    debug!("Checkpoint table already present: {}", e);
                    continue;
                }
                return Err(db_error(e));
            }
        }
        Ok(())
    }

    async fn get_checkpoint(&self, collection_id: &str) -> Result<Option<Checkpoint>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT collection_id, sort_field, last_value, last_tiebreak,
                            documents_transferred, updated_at
                     FROM {}
                     WHERE collection_id = $1",
                    self.qualified()
                ),
                &[&collection_id],
            )
            .await
            .map_err(db_error)?;

        row.as_ref().map(row_to_checkpoint).transpose()
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let client = self.client().await?;
        let last_value = value_to_json(&checkpoint.last_value)?;
        let last_tiebreak = value_to_json(&checkpoint.last_tiebreak)?;
        let documents_transferred = i64::try_from(checkpoint.documents_transferred).unwrap_or(i64::MAX);

        client
            .execute(
                &format!(
                    "INSERT INTO {}
                     (collection_id, sort_field, last_value, last_tiebreak, documents_transferred, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (collection_id) DO UPDATE SET
                        sort_field = EXCLUDED.sort_field,
                        last_value = EXCLUDED.last_value,
                        last_tiebreak = EXCLUDED.last_tiebreak,
                        documents_transferred = EXCLUDED.documents_transferred,
                        updated_at = EXCLUDED.updated_at",
                    self.qualified()
                ),
                &[
                    &checkpoint.collection_id,
                    &checkpoint.sort_field,
                    &last_value,
                    &last_tiebreak,
                    &documents_transferred,
                    &checkpoint.updated_at,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT collection_id, sort_field, last_value, last_tiebreak,
                            documents_transferred, updated_at
                     FROM {}
                     ORDER BY collection_id",
                    self.qualified()
                ),
                &[],
            )
            .await
            .map_err(db_error)?;

        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn delete_checkpoint(&self, collection_id: &str) -> Result<bool> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                &format!("DELETE FROM {} WHERE collection_id = $1", self.qualified()),
                &[&collection_id],
            )
            .await
            .map_err(db_error)?;
        Ok(deleted > 0)
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sort_value_json_column_round_trip() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let stored = value_to_json(&Some(SortValue::Date(created))).unwrap();
        assert_eq!(stored, Some(serde_json::json!({"$date": "2024-05-01T08:30:00.000Z"})));
        assert_eq!(value_from_json(stored).unwrap(), Some(SortValue::Date(created)));
    }

    #[test]
    fn test_null_column_is_none() {
        assert_eq!(value_to_json(&None).unwrap(), None);
        assert_eq!(value_from_json(None).unwrap(), None);
    }

    #[test]
    fn test_invalid_stored_value() {
        let err = value_from_json(Some(serde_json::json!([1, 2]))).unwrap_err();
        assert!(matches!(err, MigrateError::Checkpoint(_)));
    }
}
