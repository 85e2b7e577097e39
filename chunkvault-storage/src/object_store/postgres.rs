use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};

use super::{check_schema_version, ObjectStore, StoredChunk, SCHEMA_VERSION, SCHEMA_VERSION_KEY};
use crate::error::{RepositoryError, Result};

const SELECT_COLUMNS: &str = "SELECT id, data, created_at, modified_at, access_count, last_access_at, size FROM chunks";

/// PostgreSQL-backed object store (JSONB payloads).
pub struct PostgresObjectStore {
    pool: Pool,
}

impl PostgresObjectStore {
    /// Build the pool. No connection is made until `open()`.
    pub fn connect(connection_string: &str) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.url = Some(connection_string.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| RepositoryError::storage_caused_by("create postgres pool", e))?;

        Ok(Self { pool })
    }

    fn read_row(row: &Row) -> Result<StoredChunk> {
        let data: serde_json::Value = row.try_get(1)?;
        let access_count: i64 = row.try_get(4)?;
        let size: i64 = row.try_get(6)?;
        Ok(StoredChunk {
            id: row.try_get(0)?,
            chunk: serde_json::from_value(data)?,
            created_at: row.try_get(2)?,
            modified_at: row.try_get(3)?,
            access_count: access_count.max(0) as u64,
            last_access_at: row.try_get(5)?,
            size: size.max(0) as u64,
        })
    }

    fn read_rows(rows: &[Row]) -> Result<Vec<StoredChunk>> {
        rows.iter().map(Self::read_row).collect()
    }
}

#[async_trait]
impl ObjectStore for PostgresObjectStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn open(&self) -> Result<()> {
        let client = self.pool.get().await?;

        client
            .batch_execute(
                "
                CREATE TABLE IF NOT EXISTS chunks (
                    id TEXT PRIMARY KEY,
                    x INT NOT NULL,
                    z INT NOT NULL,
                    data JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    modified_at TIMESTAMPTZ NOT NULL,
                    access_count BIGINT NOT NULL DEFAULT 0,
                    last_access_at TIMESTAMPTZ NOT NULL,
                    size BIGINT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_chunks_position ON chunks (x, z);
                CREATE TABLE IF NOT EXISTS metadata (
                    key TEXT PRIMARY KEY,
                    value JSONB NOT NULL
                );
            ",
            )
            .await?;

        let version = serde_json::json!(SCHEMA_VERSION);
        client
            .execute(
                "INSERT INTO metadata (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
                &[&SCHEMA_VERSION_KEY, &version],
            )
            .await?;

        let row = client
            .query_one("SELECT value FROM metadata WHERE key = $1", &[&SCHEMA_VERSION_KEY])
            .await?;
        let stored: serde_json::Value = row.try_get(0)?;
        match stored.as_i64() {
            Some(stored) => check_schema_version(stored)?,
            None => {
                return Err(RepositoryError::integrity(
                    format!("schema version <= {}", SCHEMA_VERSION),
                    stored.to_string(),
                    None,
                ));
            }
        }

        log::info!("Postgres: object store ready");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredChunk>> {
        let client = self.pool.get().await?;
        let row = client.query_opt(&format!("{} WHERE id = $1", SELECT_COLUMNS), &[&id]).await?;
        row.as_ref().map(Self::read_row).transpose()
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<StoredChunk>> {
        let client = self.pool.get().await?;
        let rows = client.query(&format!("{} WHERE id = ANY($1)", SELECT_COLUMNS), &[&ids]).await?;
        Self::read_rows(&rows)
    }

    async fn get_by_position(&self, x: i32, z: i32) -> Result<Vec<StoredChunk>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(&format!("{} WHERE x = $1 AND z = $2", SELECT_COLUMNS), &[&x, &z])
            .await?;
        Self::read_rows(&rows)
    }

    async fn get_all(&self) -> Result<Vec<StoredChunk>> {
        // Warning: heavy operation
        let client = self.pool.get().await?;
        let rows = client.query(SELECT_COLUMNS, &[]).await?;
        Self::read_rows(&rows)
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<Option<StoredChunk>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE chunks SET access_count = access_count + 1, last_access_at = $2 WHERE id = $1
                 RETURNING id, data, created_at, modified_at, access_count, last_access_at, size",
                &[&id, &now],
            )
            .await?;
        row.as_ref().map(Self::read_row).transpose()
    }

    async fn put_many(&self, records: &[StoredChunk]) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx
            .prepare(
                "INSERT INTO chunks (id, x, z, data, created_at, modified_at, access_count, last_access_at, size)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (id) DO UPDATE SET
                    x = EXCLUDED.x, z = EXCLUDED.z, data = EXCLUDED.data,
                    modified_at = EXCLUDED.modified_at, size = EXCLUDED.size",
            )
            .await?;

        for record in records {
            let data = serde_json::to_value(&record.chunk)?;
            let access_count = record.access_count as i64;
            let size = record.size as i64;
            tx.execute(
                &stmt,
                &[
                    &record.id,
                    &record.chunk.position.x,
                    &record.chunk.position.z,
                    &data,
                    &record.created_at,
                    &record.modified_at,
                    &access_count,
                    &record.last_access_at,
                    &size,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_many(&self, ids: &[String]) -> Result<u64> {
        let client = self.pool.get().await?;
        let removed = client.execute("DELETE FROM chunks WHERE id = ANY($1)", &[&ids]).await?;
        Ok(removed)
    }

    async fn count(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT COUNT(*) FROM chunks", &[]).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn clear(&self) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.batch_execute("DELETE FROM chunks; DELETE FROM metadata;").await?;
        let version = serde_json::json!(SCHEMA_VERSION);
        tx.execute(
            "INSERT INTO metadata (key, value) VALUES ($1, $2)",
            &[&SCHEMA_VERSION_KEY, &version],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let client = self.pool.get().await?;
        let row = client.query_opt("SELECT value FROM metadata WHERE key = $1", &[&key]).await?;
        match row {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }

    async fn put_metadata(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO metadata (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                &[&key, value],
            )
            .await?;
        Ok(())
    }
}
