use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{check_schema_version, ObjectStore, StoredChunk, SCHEMA_VERSION, SCHEMA_VERSION_KEY};
use crate::error::{RepositoryError, Result};

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        x INTEGER NOT NULL,
        z INTEGER NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0,
        last_access_at TEXT NOT NULL,
        size INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chunks_position ON chunks (x, z);
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const SELECT_COLUMNS: &str = "SELECT id, data, created_at, modified_at, access_count, last_access_at, size FROM chunks";

/// SQLite-backed object store. One connection, serialized by a mutex.
#[derive(Debug)]
pub struct SqliteObjectStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteObjectStore {
    /// Open (or create) a database file. Call `open()` before use.
    pub fn open_file(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL is silently ignored where unsupported
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        Ok(Self { conn: Mutex::new(conn), db_path: Some(path.to_path_buf()) })
    }

    /// Private in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn), db_path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RepositoryError::storage("sqlite", "connection mutex poisoned"))
    }

    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredChunk> {
        let data: String = row.get(1)?;
        let chunk = serde_json::from_str(&data)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e)))?;
        Ok(StoredChunk {
            id: row.get(0)?,
            chunk,
            created_at: row.get(2)?,
            modified_at: row.get(3)?,
            access_count: row.get::<_, i64>(4)?.max(0) as u64,
            last_access_at: row.get(5)?,
            size: row.get::<_, i64>(6)?.max(0) as u64,
        })
    }

    fn write_version(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for SqliteObjectStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn open(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", params![SCHEMA_VERSION_KEY], |row| row.get(0))
            .optional()?;
        match stored.as_deref().map(str::parse::<i64>) {
            Some(Ok(version)) => check_schema_version(version)?,
            _ => Self::write_version(&conn)?,
        }
        log::info!("SQLite: object store ready ({:?})", self.db_path);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredChunk>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), params![id], Self::read_row)
            .optional()?;
        Ok(record)
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<StoredChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = stmt.query_row(params![id], Self::read_row).optional()? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn get_by_position(&self, x: i32, z: i32) -> Result<Vec<StoredChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE x = ?1 AND z = ?2", SELECT_COLUMNS))?;
        let rows = stmt.query_map(params![x, z], Self::read_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_all(&self) -> Result<Vec<StoredChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(SELECT_COLUMNS)?;
        let rows = stmt.query_map([], Self::read_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<Option<StoredChunk>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE chunks SET access_count = access_count + 1, last_access_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        let record = if changed == 0 {
            None
        } else {
            tx.query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), params![id], Self::read_row)
                .optional()?
        };
        tx.commit()?;
        Ok(record)
    }

    async fn put_many(&self, records: &[StoredChunk]) -> Result<()> {
        let mut payloads = Vec::with_capacity(records.len());
        for record in records {
            payloads.push(serde_json::to_string(&record.chunk)?);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (id, x, z, data, created_at, modified_at, access_count, last_access_at, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (id) DO UPDATE SET
                    x = excluded.x, z = excluded.z, data = excluded.data,
                    modified_at = excluded.modified_at, size = excluded.size",
            )?;
            for (record, data) in records.iter().zip(&payloads) {
                stmt.execute(params![
                    record.id,
                    record.chunk.position.x,
                    record.chunk.position.z,
                    data,
                    record.created_at,
                    record.modified_at,
                    record.access_count as i64,
                    record.last_access_at,
                    record.size as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_many(&self, ids: &[String]) -> Result<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0u64;
        {
            let mut stmt = tx.prepare("DELETE FROM chunks WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id])? as u64;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    async fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks", [])?;
        tx.execute("DELETE FROM metadata", [])?;
        Self::write_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_metadata(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let conn = self.conn()?;
        conn.execute("INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)", params![key, raw])?;
        Ok(())
    }
}
