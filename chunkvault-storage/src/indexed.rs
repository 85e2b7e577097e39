//! Persistent backend on top of an `ObjectStore`.
//!
//! Multi-predicate queries (`find_by_query`, `count_by_region`, ...) load the
//! whole `chunks` store and filter in memory: object stores have no query
//! language beyond key and index lookups.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::chunk::{ChunkData, ChunkId, ChunkPosition, ChunkRegion};
use crate::error::{RepositoryError, Result};
use crate::memory::{idle_cutoff, DEFAULT_IDLE_EVICTION};
use crate::object_store::{ObjectStore, StoredChunk};
use crate::types::{check_entry, BatchOutcome, ChunkEntry, ChunkQuery, IntegrityReport, RepositoryStatistics};
use crate::ChunkRepository;

const LAST_CLEANUP_KEY: &str = "last_cleanup";
const INITIALIZED_AT_KEY: &str = "initialized_at";

pub struct IndexedChunkRepository {
    store: Arc<dyn ObjectStore>,
    idle_eviction: Duration,
}

impl IndexedChunkRepository {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, idle_eviction: DEFAULT_IDLE_EVICTION }
    }

    pub fn with_idle_eviction(mut self, idle_eviction: Duration) -> Self {
        self.idle_eviction = idle_eviction;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn all_entries(&self) -> Result<Vec<ChunkEntry>> {
        Ok(self.store.get_all().await?.into_iter().map(StoredChunk::into_entry).collect())
    }

    fn keys_for(ids: &[ChunkId]) -> Vec<String> {
        ids.iter().filter_map(ChunkId::position).map(|p| p.key()).collect()
    }
}

#[async_trait]
impl ChunkRepository for IndexedChunkRepository {
    fn backend_name(&self) -> &'static str {
        "indexed"
    }

    async fn find_by_id(&self, id: &ChunkId) -> Result<Option<ChunkData>> {
        match id.position() {
            Some(position) => self.find_by_position(position).await,
            None => Ok(None),
        }
    }

    async fn find_by_position(&self, position: ChunkPosition) -> Result<Option<ChunkData>> {
        let record = self.store.touch(&position.key(), Utc::now()).await?;
        Ok(record.map(|r| r.chunk))
    }

    async fn find_by_region(&self, region: ChunkRegion) -> Result<Vec<ChunkData>> {
        let records = self.store.get_all().await?;
        Ok(records
            .into_iter()
            .filter(|r| region.contains(&r.chunk.position))
            .map(|r| r.chunk)
            .collect())
    }

    async fn find_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkData>> {
        let records = self.store.get_many(&Self::keys_for(ids)).await?;
        Ok(records.into_iter().map(|r| r.chunk).collect())
    }

    async fn find_by_positions(&self, positions: &[ChunkPosition]) -> Result<Vec<ChunkData>> {
        let keys: Vec<String> = positions.iter().map(ChunkPosition::key).collect();
        let records = self.store.get_many(&keys).await?;
        Ok(records.into_iter().map(|r| r.chunk).collect())
    }

    async fn save(&self, chunk: ChunkData) -> Result<()> {
        chunk.validate()?;
        log::debug!("{}: saving chunk {}", self.store.name(), chunk.position);
        self.store.put_many(&[StoredChunk::new(chunk, Utc::now())]).await
    }

    async fn save_all(&self, chunks: Vec<ChunkData>) -> Result<()> {
        for chunk in &chunks {
            chunk.validate()?;
        }
        let now = Utc::now();
        let records: Vec<StoredChunk> = chunks.into_iter().map(|c| StoredChunk::new(c, now)).collect();
        self.store.put_many(&records).await
    }

    async fn delete(&self, id: &ChunkId) -> Result<()> {
        self.store.delete_many(&Self::keys_for(std::slice::from_ref(id))).await?;
        Ok(())
    }

    async fn delete_by_position(&self, position: ChunkPosition) -> Result<()> {
        self.store.delete_many(&[position.key()]).await?;
        Ok(())
    }

    async fn delete_all(&self, ids: &[ChunkId]) -> Result<()> {
        self.store.delete_many(&Self::keys_for(ids)).await?;
        Ok(())
    }

    async fn exists(&self, id: &ChunkId) -> Result<bool> {
        match id.position() {
            Some(position) => self.exists_by_position(position).await,
            None => Ok(false),
        }
    }

    async fn exists_by_position(&self, position: ChunkPosition) -> Result<bool> {
        Ok(!self.store.get_by_position(position.x, position.z).await?.is_empty())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.store.count().await? as usize)
    }

    async fn count_by_region(&self, region: ChunkRegion) -> Result<usize> {
        let records = self.store.get_all().await?;
        Ok(records.iter().filter(|r| region.contains(&r.chunk.position)).count())
    }

    async fn find_entries(&self, query: &ChunkQuery) -> Result<Vec<ChunkEntry>> {
        let entries = self.all_entries().await?;
        Ok(query.apply(&entries))
    }

    async fn find_recently_loaded(&self, limit: usize) -> Result<Vec<ChunkData>> {
        let mut entries = self.all_entries().await?;
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.position().cmp(&b.position())));
        Ok(entries.into_iter().take(limit).map(|e| e.chunk).collect())
    }

    async fn find_modified(&self) -> Result<Vec<ChunkData>> {
        let entries = self.all_entries().await?;
        Ok(entries.into_iter().filter(|e| e.chunk.is_dirty).map(|e| e.chunk).collect())
    }

    async fn get_statistics(&self) -> Result<RepositoryStatistics> {
        // no cache in front of the store, so no hit/miss counters
        let entries = self.all_entries().await?;
        Ok(RepositoryStatistics::from_entries(&entries, 0, 0, 0))
    }

    async fn batch_save(&self, chunks: Vec<ChunkData>) -> Result<BatchOutcome<ChunkPosition>> {
        let mut outcome = BatchOutcome::default();
        let now = Utc::now();
        for chunk in chunks {
            let position = chunk.position;
            let result = match chunk.validate() {
                Ok(()) => self.store.put_many(&[StoredChunk::new(chunk, now)]).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => outcome.succeed(position),
                Err(e) => outcome.fail(position, e),
            }
        }
        Ok(outcome)
    }

    async fn batch_delete(&self, ids: Vec<ChunkId>) -> Result<BatchOutcome<ChunkId>> {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            match self.delete(&id).await {
                Ok(()) => outcome.succeed(id),
                Err(e) => outcome.fail(id, e),
            }
        }
        Ok(outcome)
    }

    async fn initialize(&self) -> Result<()> {
        self.store.open().await?;
        let now = serde_json::to_value(Utc::now())?;
        self.store.put_metadata(INITIALIZED_AT_KEY, &now).await?;
        log::info!("{}: chunk repository initialized", self.store.name());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        log::info!("{}: cleared all chunks", self.store.name());
        Ok(())
    }

    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        let records = self.store.get_all().await?;
        let mut report = IntegrityReport::default();
        for record in records {
            let recorded_size = record.size;
            let actual_size = record.chunk.estimated_size() as u64;
            let id = record.chunk.id();
            let key = record.id.clone();
            check_entry(&mut report, &key, &record.into_entry());
            if recorded_size != actual_size {
                let mismatch = RepositoryError::integrity(
                    format!("{} bytes", recorded_size),
                    format!("{} bytes", actual_size),
                    None,
                );
                report.flag(id, mismatch.to_string());
            }
        }
        Ok(report.finish())
    }

    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }

    /// Durable storage never evicts: cleanup only records how many clean
    /// records have gone idle, and always reports zero evictions.
    async fn cleanup(&self) -> Result<usize> {
        let idle = match idle_cutoff(self.idle_eviction) {
            Some(cutoff) => {
                let records = self.store.get_all().await?;
                records.iter().filter(|r| !r.chunk.is_dirty && r.last_access_at < cutoff).count()
            }
            None => 0,
        };
        self.store
            .put_metadata(LAST_CLEANUP_KEY, &serde_json::json!({ "at": Utc::now(), "idle": idle, "evicted": 0 }))
            .await?;
        log::debug!("{}: cleanup found {} idle chunks", self.store.name(), idle);
        Ok(0)
    }
}
