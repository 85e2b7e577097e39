use async_trait::async_trait;

pub mod chunk;
pub mod error;
pub mod hybrid;
pub mod indexed;
pub mod memory;
pub mod object_store;
pub mod strategy;
pub mod types;
pub mod worker;

pub use chunk::{BiomeType, BlockId, ChunkBuilder, ChunkData, ChunkId, ChunkMetadata, ChunkPosition, ChunkRegion};
pub use error::{RepositoryError, Result};
pub use hybrid::HybridChunkRepository;
pub use indexed::IndexedChunkRepository;
pub use memory::InMemoryChunkRepository;
pub use strategy::{
    ConsistencyLevel, DurabilityLevel, EnvironmentInfo, MemoryConstraints, PerformanceProfile, PerformanceRequirements,
    Platform, RepositoryConfig, RepositoryFactory, RepositoryStrategy, RepositoryStrategySelector,
};
pub use types::{BatchOutcome, ChunkEntry, ChunkQuery, IntegrityReport, RepositoryStatistics};
pub use worker::WorkerChunkRepository;

/// Write-side storage contract for chunks.
///
/// Implementations:
/// - `InMemoryChunkRepository` - authoritative, low latency (default)
/// - `IndexedChunkRepository` - persistent object store (SQLite / PostgreSQL)
/// - `WorkerChunkRepository` - offload point, currently delegates to memory
/// - `HybridChunkRepository` - memory reads, memory + background persistent writes
///
/// Lookups return `None` on a miss. `ChunkNotFound` is left to the callers
/// that need it (see the CQRS handlers).
#[async_trait]
pub trait ChunkRepository: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Lookup by id. Counts as an access on a hit.
    async fn find_by_id(&self, id: &ChunkId) -> Result<Option<ChunkData>>;

    /// Lookup by position. Counts as an access on a hit.
    async fn find_by_position(&self, position: ChunkPosition) -> Result<Option<ChunkData>>;

    /// All chunks inside the inclusive region.
    async fn find_by_region(&self, region: ChunkRegion) -> Result<Vec<ChunkData>>;

    async fn find_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkData>>;

    async fn find_by_positions(&self, positions: &[ChunkPosition]) -> Result<Vec<ChunkData>>;

    /// Insert or overwrite the chunk at its position.
    async fn save(&self, chunk: ChunkData) -> Result<()>;

    /// All or nothing: nothing is stored if any chunk fails validation.
    async fn save_all(&self, chunks: Vec<ChunkData>) -> Result<()>;

    /// Deleting an absent id is not an error.
    async fn delete(&self, id: &ChunkId) -> Result<()>;

    async fn delete_by_position(&self, position: ChunkPosition) -> Result<()>;

    async fn delete_all(&self, ids: &[ChunkId]) -> Result<()>;

    async fn exists(&self, id: &ChunkId) -> Result<bool>;

    async fn exists_by_position(&self, position: ChunkPosition) -> Result<bool>;

    async fn count(&self) -> Result<usize>;

    async fn count_by_region(&self, region: ChunkRegion) -> Result<usize>;

    async fn find_by_query(&self, query: &ChunkQuery) -> Result<Vec<ChunkData>> {
        Ok(self.find_entries(query).await?.into_iter().map(|e| e.chunk).collect())
    }

    /// Same filter as `find_by_query`, but keeps the bookkeeping around each chunk.
    async fn find_entries(&self, query: &ChunkQuery) -> Result<Vec<ChunkEntry>>;

    /// Newest first.
    async fn find_recently_loaded(&self, limit: usize) -> Result<Vec<ChunkData>>;

    /// Chunks with unsaved changes (`is_dirty`).
    async fn find_modified(&self) -> Result<Vec<ChunkData>>;

    async fn get_statistics(&self) -> Result<RepositoryStatistics>;

    /// Sum of stored chunk sizes, as in `get_statistics().memory_usage_bytes`.
    async fn memory_usage_bytes(&self) -> Result<u64> {
        Ok(self.get_statistics().await?.memory_usage_bytes)
    }

    async fn batch_save(&self, chunks: Vec<ChunkData>) -> Result<BatchOutcome<ChunkPosition>>;

    async fn batch_delete(&self, ids: Vec<ChunkId>) -> Result<BatchOutcome<ChunkId>>;

    async fn initialize(&self) -> Result<()>;

    /// Remove every chunk.
    async fn clear(&self) -> Result<()>;

    async fn validate_integrity(&self) -> Result<IntegrityReport>;

    /// Reset hit/miss bookkeeping. Chunks are untouched.
    async fn clear_cache(&self) -> Result<()>;

    /// Evict clean chunks that have been idle too long. Returns how many went.
    async fn cleanup(&self) -> Result<usize>;

    /// Wait for any background writes issued so far. Most backends have none.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
