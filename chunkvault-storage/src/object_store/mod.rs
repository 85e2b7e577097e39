//! Key-value object stores behind `IndexedChunkRepository`.
//!
//! Layout, shared by every implementation:
//! - `chunks`: one record per chunk keyed by the position key (`"x,z"`),
//!   with a non-unique secondary index on `(x, z)`
//! - `metadata`: small JSON values (schema version, cleanup bookkeeping)
//!
//! Every method is one transaction scoped to the stores it touches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkData;
use crate::error::{RepositoryError, Result};
use crate::types::ChunkEntry;

mod postgres;
mod sqlite;

pub use postgres::PostgresObjectStore;
pub use sqlite::SqliteObjectStore;

/// Bump when the layout changes.
pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Refuse stores written by a newer layout.
fn check_schema_version(stored: i64) -> Result<()> {
    if stored > SCHEMA_VERSION {
        return Err(RepositoryError::integrity(
            format!("schema version <= {}", SCHEMA_VERSION),
            format!("schema version {}", stored),
            None,
        ));
    }
    Ok(())
}

/// A chunk as it sits in the `chunks` store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub chunk: ChunkData,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_access_at: DateTime<Utc>,
    /// Serialized size estimate in bytes.
    pub size: u64,
}

impl StoredChunk {
    pub fn new(chunk: ChunkData, now: DateTime<Utc>) -> Self {
        Self {
            id: chunk.position.key(),
            size: chunk.estimated_size() as u64,
            chunk,
            created_at: now,
            modified_at: now,
            access_count: 0,
            last_access_at: now,
        }
    }

    pub fn into_entry(self) -> ChunkEntry {
        ChunkEntry {
            chunk: self.chunk,
            created_at: self.created_at,
            modified_at: self.modified_at,
            access_count: self.access_count,
            last_access_at: self.last_access_at,
            size: self.size,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the stores and index if missing and record the schema version.
    async fn open(&self) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<StoredChunk>>;

    async fn get_many(&self, ids: &[String]) -> Result<Vec<StoredChunk>>;

    /// Lookup through the `(x, z)` index.
    async fn get_by_position(&self, x: i32, z: i32) -> Result<Vec<StoredChunk>>;

    async fn get_all(&self) -> Result<Vec<StoredChunk>>;

    /// Bump `access_count` / `last_access_at` and return the updated record.
    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<Option<StoredChunk>>;

    /// Upsert. An existing record keeps its `created_at` and access
    /// bookkeeping; chunk, `modified_at` and `size` are replaced.
    async fn put_many(&self, records: &[StoredChunk]) -> Result<()>;

    /// Returns how many records were actually removed.
    async fn delete_many(&self, ids: &[String]) -> Result<u64>;

    async fn count(&self) -> Result<u64>;

    /// Empty both stores, then restore the schema version.
    async fn clear(&self) -> Result<()>;

    async fn get_metadata(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn put_metadata(&self, key: &str, value: &serde_json::Value) -> Result<()>;
}
