//! Read side of the chunk store.
//!
//! `ChunkQueryRepository` reads through a `ChunkRepository` and keeps its
//! own TTL cache of query results, separate from any cache the backend has.
//! Results come back as `Arc`s: a cache hit hands out the stored value as is.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chunkvault_benchmark::BenchmarkMetrics;
use chunkvault_storage::{
    BiomeType, BlockId, ChunkData, ChunkEntry, ChunkPosition, ChunkQuery, ChunkRegion, ChunkRepository, RepositoryError,
    Result,
};
use serde::{Deserialize, Serialize};

use crate::cache::{QueryCache, DEFAULT_TTL};
use crate::performance::PerformanceLog;

/// Serialized size above which a chunk is worth a closer look.
pub const OVERSIZED_CHUNK_BYTES: usize = 256 * 1024;

/// Dirty chunks untouched for this long are flagged for a flush.
pub const STALE_DIRTY_AFTER: Duration = Duration::from_secs(5 * 60);

/// A chunk this many times the mean size counts towards memory pressure.
const PRESSURE_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    ModifiedAt,
    AccessCount,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiusFilter {
    pub center: ChunkPosition,
    pub radius: f64,
}

/// Inclusive on both ends. Matched against `modified_at`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Composite search. Filters run in field order; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkSearchCriteria {
    pub positions: Option<Vec<ChunkPosition>>,
    pub bounding_box: Option<ChunkRegion>,
    pub radius: Option<RadiusFilter>,
    pub time_range: Option<TimeRange>,
    pub biomes: Option<Vec<BiomeType>>,
    /// Chunk must contain at least one of these.
    pub block_types: Option<Vec<BlockId>>,
    pub sort_by: Option<SortField>,
    pub sort_direction: SortDirection,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl ChunkSearchCriteria {
    fn cache_key(&self) -> Result<String> {
        Ok(format!("search_{}", serde_json::to_string(self)?))
    }

    fn matches(&self, entry: &ChunkEntry) -> bool {
        let chunk = &entry.chunk;
        if let Some(positions) = &self.positions {
            if !positions.contains(&chunk.position) {
                return false;
            }
        }
        if let Some(bbox) = &self.bounding_box {
            if !bbox.contains(&chunk.position) {
                return false;
            }
        }
        if let Some(filter) = &self.radius {
            if chunk.position.distance_to(&filter.center) > filter.radius {
                return false;
            }
        }
        if let Some(range) = &self.time_range {
            if entry.modified_at < range.start || entry.modified_at > range.end {
                return false;
            }
        }
        if let Some(biomes) = &self.biomes {
            if !biomes.contains(&chunk.metadata.biome) {
                return false;
            }
        }
        if let Some(block_types) = &self.block_types {
            if !block_types.iter().any(|b| chunk.contains_block(*b)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunks: Vec<ChunkData>,
    /// Matches before pagination.
    pub total_count: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// (dx, dz). North is -z.
    pub fn offset(&self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkNeighborhood {
    pub center: ChunkData,
    /// Only the neighbors that exist.
    pub neighbors: Vec<(Direction, ChunkData)>,
    pub radius_2: Vec<ChunkData>,
    pub radius_3: Vec<ChunkData>,
}

impl ChunkNeighborhood {
    pub fn neighbor(&self, direction: Direction) -> Option<&ChunkData> {
        self.neighbors.iter().find(|(d, _)| *d == direction).map(|(_, c)| c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationReason {
    /// Serialized size above `OVERSIZED_CHUNK_BYTES`.
    Oversized,
    /// Every block is the same, compresses to almost nothing.
    Uniform,
    NeverAccessed,
    /// Dirty and not written for `STALE_DIRTY_AFTER`.
    StaleDirty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationCandidate {
    pub position: ChunkPosition,
    pub size_bytes: usize,
    pub reasons: Vec<OptimizationReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryPressureCause {
    pub position: ChunkPosition,
    pub size_bytes: usize,
    /// Fraction of the total serialized size.
    pub share: f64,
    pub is_dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveChunk {
    pub position: ChunkPosition,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

pub struct ChunkQueryRepository {
    repository: Arc<dyn ChunkRepository>,
    cache: QueryCache,
    pub(crate) performance: PerformanceLog,
    metrics: Option<Arc<BenchmarkMetrics>>,
}

impl ChunkQueryRepository {
    pub fn new(repository: Arc<dyn ChunkRepository>) -> Self {
        Self::with_ttl(repository, DEFAULT_TTL)
    }

    pub fn with_ttl(repository: Arc<dyn ChunkRepository>, ttl: Duration) -> Self {
        Self {
            repository,
            cache: QueryCache::new(ttl),
            performance: PerformanceLog::default(),
            metrics: None,
        }
    }

    /// Count query cache hits and misses into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<BenchmarkMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn repository(&self) -> &Arc<dyn ChunkRepository> {
        &self.repository
    }

    /// Serve `key` from the cache, or run `compute` and cache its result.
    pub(crate) async fn cached<T, F, Fut>(&self, key: String, compute: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.cache.get::<T>(&key) {
            log::debug!("Query cache hit: {}", key);
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_hit();
            }
            return Ok(hit);
        }

        log::debug!("Query cache miss: {}", key);
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_miss();
        }
        // no lock held while computing; two racing misses both compute and the last insert wins
        let value = Arc::new(compute().await?);
        self.cache.insert(key, value.clone());
        Ok(value)
    }

    pub(crate) async fn all_entries(&self) -> Result<Vec<ChunkEntry>> {
        self.repository.find_entries(&ChunkQuery::all()).await
    }

    /// Chunks within `radius` (Euclidean, chunk units) of `center`.
    pub async fn find_chunks_in_radius(&self, center: ChunkPosition, radius: u32) -> Result<Arc<Vec<ChunkData>>> {
        let key = format!("radius_{}_{}_{}", center.x, center.z, radius);
        self.cached(key, || async move {
            let chunks = self.repository.find_by_region(ChunkRegion::around(center, radius)).await?;
            Ok(chunks
                .into_iter()
                .filter(|c| c.position.distance_to(&center) <= f64::from(radius))
                .collect())
        })
        .await
    }

    pub async fn find_chunks_by_biome(&self, biome: BiomeType) -> Result<Arc<Vec<ChunkData>>> {
        self.cached(format!("biome_{}", biome), || async move {
            let chunks = self.repository.find_by_query(&ChunkQuery::all()).await?;
            Ok(chunks.into_iter().filter(|c| c.metadata.biome == biome).collect())
        })
        .await
    }

    pub async fn find_chunks_in_region(&self, region: ChunkRegion) -> Result<Arc<Vec<ChunkData>>> {
        let key = format!("region_{}_{}_{}_{}", region.min_x, region.max_x, region.min_z, region.max_z);
        self.cached(key, || self.repository.find_by_region(region)).await
    }

    pub async fn search_chunks(&self, criteria: &ChunkSearchCriteria) -> Result<Arc<SearchResult>> {
        let key = criteria.cache_key()?;
        self.cached(key, || async move {
            let mut matched: Vec<ChunkEntry> =
                self.all_entries().await?.into_iter().filter(|e| criteria.matches(e)).collect();

            if let Some(field) = criteria.sort_by {
                sort_entries(&mut matched, field, criteria.sort_direction);
            }

            let total_count = matched.len();
            let offset = criteria.offset.unwrap_or(0);
            let limit = criteria.limit.unwrap_or(usize::MAX);
            let chunks: Vec<ChunkData> = matched.into_iter().skip(offset).take(limit).map(|e| e.chunk).collect();
            let has_more = offset.saturating_add(chunks.len()) < total_count;

            Ok(SearchResult { chunks, total_count, has_more })
        })
        .await
    }

    /// The center chunk, its 8 direct neighbors, and the chunks within
    /// radius 2 and 3. Fails with `ChunkNotFound` when the center is missing.
    pub async fn get_chunk_neighborhood(&self, center: ChunkPosition) -> Result<ChunkNeighborhood> {
        let Some(center_chunk) = self.repository.find_by_position(center).await? else {
            return Err(RepositoryError::not_found_position(center));
        };

        let mut neighbors = Vec::with_capacity(Direction::ALL.len());
        for direction in Direction::ALL {
            let (dx, dz) = direction.offset();
            if let Some(chunk) = self.repository.find_by_position(center.offset(dx, dz)).await? {
                neighbors.push((direction, chunk));
            }
        }

        let radius_2 = self.repository.find_by_region(ChunkRegion::around(center, 2)).await?;
        let radius_3 = self.repository.find_by_region(ChunkRegion::around(center, 3)).await?;

        Ok(ChunkNeighborhood { center: center_chunk, neighbors, radius_2, radius_3 })
    }

    /// Chunks with no stored neighbor in the surrounding 3x3.
    pub async fn find_orphaned_chunks(&self) -> Result<Vec<ChunkData>> {
        let chunks = self.repository.find_by_query(&ChunkQuery::all()).await?;
        let mut orphans = Vec::new();
        for chunk in chunks {
            let around = self.repository.count_by_region(ChunkRegion::around(chunk.position, 1)).await?;
            if around <= 1 {
                orphans.push(chunk);
            }
        }
        orphans.sort_by_key(|c| c.position);
        Ok(orphans)
    }

    pub async fn find_optimization_candidates(&self) -> Result<Vec<OptimizationCandidate>> {
        let entries = self.all_entries().await?;
        let stale_before = chrono::Duration::from_std(STALE_DIRTY_AFTER)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));

        let mut candidates: Vec<OptimizationCandidate> = entries
            .iter()
            .filter_map(|entry| {
                let size_bytes = entry.size as usize;
                let mut reasons = Vec::new();
                if size_bytes > OVERSIZED_CHUNK_BYTES {
                    reasons.push(OptimizationReason::Oversized);
                }
                if entry.chunk.is_uniform() {
                    reasons.push(OptimizationReason::Uniform);
                }
                if entry.access_count == 0 {
                    reasons.push(OptimizationReason::NeverAccessed);
                }
                if entry.chunk.is_dirty && stale_before.is_some_and(|t| entry.modified_at < t) {
                    reasons.push(OptimizationReason::StaleDirty);
                }
                (!reasons.is_empty()).then_some(OptimizationCandidate {
                    position: entry.position(),
                    size_bytes,
                    reasons,
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then_with(|| a.position.cmp(&b.position)));
        Ok(candidates)
    }

    /// Chunks whose serialized size is oversized or well above the mean,
    /// largest first.
    pub async fn find_memory_pressure_causes(&self) -> Result<Vec<MemoryPressureCause>> {
        let entries = self.all_entries().await?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let sizes: Vec<usize> = entries.iter().map(|e| e.size as usize).collect();
        let total: usize = sizes.iter().sum();
        let mean = total as f64 / sizes.len() as f64;

        let mut causes: Vec<MemoryPressureCause> = entries
            .iter()
            .zip(sizes)
            .filter(|(_, size)| *size > OVERSIZED_CHUNK_BYTES || *size as f64 > mean * PRESSURE_FACTOR)
            .map(|(entry, size)| MemoryPressureCause {
                position: entry.position(),
                size_bytes: size,
                share: size as f64 / total.max(1) as f64,
                is_dirty: entry.chunk.is_dirty,
            })
            .collect();
        causes.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then_with(|| a.position.cmp(&b.position)));
        Ok(causes)
    }

    /// The `limit` most recently loaded chunks with their access stats.
    pub async fn monitor_active_chunks(&self, limit: usize) -> Result<Vec<ActiveChunk>> {
        let mut entries = self.all_entries().await?;
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.position().cmp(&b.position())));
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| ActiveChunk {
                position: e.position(),
                access_count: e.access_count,
                created_at: e.created_at,
                last_access_at: e.last_access_at,
            })
            .collect())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn evict_expired(&self) -> usize {
        let evicted = self.cache.evict_expired();
        if evicted > 0 {
            log::debug!("Query cache: evicted {} expired entries", evicted);
        }
        evicted
    }

    /// Hits recorded for a cache key, `None` when nothing is cached under it.
    pub fn cache_hit_count(&self, key: &str) -> Option<u64> {
        self.cache.hit_count(key)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn sort_entries(entries: &mut [ChunkEntry], field: SortField, direction: SortDirection) {
    match field {
        SortField::CreatedAt => entries.sort_by_key(|e| e.created_at),
        SortField::ModifiedAt => entries.sort_by_key(|e| e.modified_at),
        SortField::AccessCount => entries.sort_by_key(|e| e.access_count),
        SortField::Size => entries.sort_by_key(|e| e.size),
    }
    if direction == SortDirection::Desc {
        entries.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkvault_storage::chunk::blocks;
    use chunkvault_storage::InMemoryChunkRepository;

    async fn seeded(positions: &[(i32, i32)]) -> (Arc<InMemoryChunkRepository>, ChunkQueryRepository) {
        let repo = Arc::new(InMemoryChunkRepository::new());
        for (x, z) in positions {
            repo.save(ChunkData::empty(ChunkPosition::new(*x, *z))).await.unwrap();
        }
        let query = ChunkQueryRepository::new(repo.clone());
        (repo, query)
    }

    #[tokio::test]
    async fn test_radius_is_euclidean() {
        let (_, query) = seeded(&[(0, 0), (2, 0), (2, 2), (3, 0)]).await;
        let found = query.find_chunks_in_radius(ChunkPosition::new(0, 0), 2).await.unwrap();
        let mut positions: Vec<ChunkPosition> = found.iter().map(|c| c.position).collect();
        positions.sort();
        assert_eq!(positions, vec![ChunkPosition::new(0, 0), ChunkPosition::new(2, 0)]);
    }

    #[tokio::test]
    async fn test_huge_radius_covers_the_world() {
        let (_, query) = seeded(&[(0, 0), (-5_000, 9_000), (i32::MAX, i32::MIN)]).await;
        let found = query.find_chunks_in_radius(ChunkPosition::new(10, 10), u32::MAX).await.unwrap();
        assert_eq!(found.len(), 3);

        let edge = query.find_chunks_in_radius(ChunkPosition::new(i32::MAX, i32::MIN), 3).await.unwrap();
        assert_eq!(edge.len(), 1);
    }

    #[tokio::test]
    async fn test_biome_filter() {
        let (repo, query) = seeded(&[(0, 0)]).await;
        repo.save(ChunkData::empty(ChunkPosition::new(1, 0)).with_biome(BiomeType::Desert)).await.unwrap();

        let deserts = query.find_chunks_by_biome(BiomeType::Desert).await.unwrap();
        assert_eq!(deserts.len(), 1);
        assert_eq!(deserts[0].position, ChunkPosition::new(1, 0));
        assert_eq!(query.cache_hit_count("biome_desert"), Some(0));
    }

    #[tokio::test]
    async fn test_search_filters_sorts_and_pages() {
        let (repo, query) = seeded(&[(0, 0), (1, 0), (2, 0), (3, 0), (10, 10)]).await;
        repo.save(ChunkData::empty(ChunkPosition::new(2, 0)).with_block(0, 0, 0, blocks::STONE)).await.unwrap();
        repo.find_by_position(ChunkPosition::new(3, 0)).await.unwrap();
        repo.find_by_position(ChunkPosition::new(3, 0)).await.unwrap();
        repo.find_by_position(ChunkPosition::new(1, 0)).await.unwrap();

        let criteria = ChunkSearchCriteria {
            bounding_box: Some(ChunkRegion::new(0, 5, 0, 0)),
            sort_by: Some(SortField::AccessCount),
            sort_direction: SortDirection::Desc,
            limit: Some(2),
            ..Default::default()
        };
        let result = query.search_chunks(&criteria).await.unwrap();
        assert_eq!(result.total_count, 4);
        assert!(result.has_more);
        let positions: Vec<ChunkPosition> = result.chunks.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![ChunkPosition::new(3, 0), ChunkPosition::new(1, 0)]);

        let stone = ChunkSearchCriteria { block_types: Some(vec![blocks::STONE]), ..Default::default() };
        let result = query.search_chunks(&stone).await.unwrap();
        assert_eq!(result.total_count, 1);
        assert!(!result.has_more);
        assert_eq!(result.chunks[0].position, ChunkPosition::new(2, 0));
    }

    #[tokio::test]
    async fn test_neighborhood() {
        let (_, query) = seeded(&[(0, 0), (1, 0), (-1, -1), (3, 3)]).await;
        let hood = query.get_chunk_neighborhood(ChunkPosition::new(0, 0)).await.unwrap();

        assert_eq!(hood.neighbors.len(), 2);
        assert!(hood.neighbor(Direction::East).is_some());
        assert!(hood.neighbor(Direction::NorthWest).is_some());
        assert!(hood.neighbor(Direction::South).is_none());
        assert_eq!(hood.radius_2.len(), 3);
        assert_eq!(hood.radius_3.len(), 4);

        let missing = query.get_chunk_neighborhood(ChunkPosition::new(50, 50)).await;
        assert!(matches!(missing, Err(RepositoryError::ChunkNotFound { .. })));
    }

    #[tokio::test]
    async fn test_optimization_and_pressure() {
        let (repo, query) = seeded(&[(0, 0), (1, 0)]).await;
        repo.find_by_position(ChunkPosition::new(0, 0)).await.unwrap();

        let candidates = query.find_optimization_candidates().await.unwrap();
        assert_eq!(candidates.len(), 2);
        let never = candidates.iter().find(|c| c.position == ChunkPosition::new(1, 0)).unwrap();
        assert!(never.reasons.contains(&OptimizationReason::Uniform));
        assert!(never.reasons.contains(&OptimizationReason::NeverAccessed));

        // equal sizes, nothing stands out
        assert!(query.find_memory_pressure_causes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_active_chunks() {
        let (_, query) = seeded(&[(0, 0), (1, 0), (2, 0)]).await;
        let active = query.monitor_active_chunks(2).await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active[0].created_at >= active[1].created_at);
    }
}
