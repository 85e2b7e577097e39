//! Off-thread offload point.
//!
//! Every call currently goes straight to an owned in-memory repository, so
//! the observable behavior is identical to `InMemoryChunkRepository`. Moving
//! the work onto a dedicated executor only has to change this file.

use async_trait::async_trait;

use crate::chunk::{ChunkData, ChunkId, ChunkPosition, ChunkRegion};
use crate::error::Result;
use crate::memory::InMemoryChunkRepository;
use crate::types::{BatchOutcome, ChunkEntry, ChunkQuery, IntegrityReport, RepositoryStatistics};
use crate::ChunkRepository;

#[derive(Default)]
pub struct WorkerChunkRepository {
    inner: InMemoryChunkRepository,
}

impl WorkerChunkRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inner(inner: InMemoryChunkRepository) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ChunkRepository for WorkerChunkRepository {
    fn backend_name(&self) -> &'static str {
        "worker"
    }

    async fn find_by_id(&self, id: &ChunkId) -> Result<Option<ChunkData>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_position(&self, position: ChunkPosition) -> Result<Option<ChunkData>> {
        self.inner.find_by_position(position).await
    }

    async fn find_by_region(&self, region: ChunkRegion) -> Result<Vec<ChunkData>> {
        self.inner.find_by_region(region).await
    }

    async fn find_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkData>> {
        self.inner.find_by_ids(ids).await
    }

    async fn find_by_positions(&self, positions: &[ChunkPosition]) -> Result<Vec<ChunkData>> {
        self.inner.find_by_positions(positions).await
    }

    async fn save(&self, chunk: ChunkData) -> Result<()> {
        self.inner.save(chunk).await
    }

    async fn save_all(&self, chunks: Vec<ChunkData>) -> Result<()> {
        self.inner.save_all(chunks).await
    }

    async fn delete(&self, id: &ChunkId) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn delete_by_position(&self, position: ChunkPosition) -> Result<()> {
        self.inner.delete_by_position(position).await
    }

    async fn delete_all(&self, ids: &[ChunkId]) -> Result<()> {
        self.inner.delete_all(ids).await
    }

    async fn exists(&self, id: &ChunkId) -> Result<bool> {
        self.inner.exists(id).await
    }

    async fn exists_by_position(&self, position: ChunkPosition) -> Result<bool> {
        self.inner.exists_by_position(position).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn count_by_region(&self, region: ChunkRegion) -> Result<usize> {
        self.inner.count_by_region(region).await
    }

    async fn find_entries(&self, query: &ChunkQuery) -> Result<Vec<ChunkEntry>> {
        self.inner.find_entries(query).await
    }

    async fn find_recently_loaded(&self, limit: usize) -> Result<Vec<ChunkData>> {
        self.inner.find_recently_loaded(limit).await
    }

    async fn find_modified(&self) -> Result<Vec<ChunkData>> {
        self.inner.find_modified().await
    }

    async fn get_statistics(&self) -> Result<RepositoryStatistics> {
        self.inner.get_statistics().await
    }

    async fn memory_usage_bytes(&self) -> Result<u64> {
        self.inner.memory_usage_bytes().await
    }

    async fn batch_save(&self, chunks: Vec<ChunkData>) -> Result<BatchOutcome<ChunkPosition>> {
        self.inner.batch_save(chunks).await
    }

    async fn batch_delete(&self, ids: Vec<ChunkId>) -> Result<BatchOutcome<ChunkId>> {
        self.inner.batch_delete(ids).await
    }

    async fn initialize(&self) -> Result<()> {
        log::info!("Worker: running on the in-memory repository");
        self.inner.initialize().await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        self.inner.validate_integrity().await
    }

    async fn clear_cache(&self) -> Result<()> {
        self.inner.clear_cache().await
    }

    async fn cleanup(&self) -> Result<usize> {
        self.inner.cleanup().await
    }
}
