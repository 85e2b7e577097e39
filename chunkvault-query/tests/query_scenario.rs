use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chunkvault_benchmark::BenchmarkMetrics;
use chunkvault_query::{ChunkQueryRepository, ChunkSearchCriteria, RadiusFilter};
use chunkvault_storage::{
    BatchOutcome, ChunkData, ChunkEntry, ChunkId, ChunkPosition, ChunkQuery, ChunkRegion, ChunkRepository,
    InMemoryChunkRepository, IntegrityReport, RepositoryConfig, RepositoryError, RepositoryFactory,
    RepositoryStatistics, RepositoryStrategy, Result,
};

/// In-memory repository that counts the region scans and full statistics
/// passes it serves.
#[derive(Default)]
struct CountingRepository {
    inner: InMemoryChunkRepository,
    region_calls: AtomicUsize,
    statistics_calls: AtomicUsize,
}

impl CountingRepository {
    fn region_calls(&self) -> usize {
        self.region_calls.load(Ordering::SeqCst)
    }

    fn statistics_calls(&self) -> usize {
        self.statistics_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkRepository for CountingRepository {
    fn backend_name(&self) -> &'static str {
        "counting"
    }
    async fn find_by_id(&self, id: &ChunkId) -> Result<Option<ChunkData>> {
        self.inner.find_by_id(id).await
    }
    async fn find_by_position(&self, position: ChunkPosition) -> Result<Option<ChunkData>> {
        self.inner.find_by_position(position).await
    }
    async fn find_by_region(&self, region: ChunkRegion) -> Result<Vec<ChunkData>> {
        self.region_calls.fetch_add(1, Ordering::SeqCst);
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
        self.region_calls.fetch_add(1, Ordering::SeqCst);
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
        self.statistics_calls.fetch_add(1, Ordering::SeqCst);
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

async fn seed(repo: &dyn ChunkRepository, positions: &[(i32, i32)]) {
    for (x, z) in positions {
        repo.save(ChunkData::empty(ChunkPosition::new(*x, *z))).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn radius_query_is_served_from_cache_until_ttl() {
    let repo = Arc::new(CountingRepository::default());
    seed(repo.as_ref(), &[(0, 0), (1, 0), (0, 1)]).await;
    let metrics = Arc::new(BenchmarkMetrics::new());
    let query = ChunkQueryRepository::with_ttl(repo.clone(), Duration::from_secs(60)).with_metrics(metrics.clone());

    let first = query.find_chunks_in_radius(ChunkPosition::new(0, 0), 1).await.unwrap();
    let second = query.find_chunks_in_radius(ChunkPosition::new(0, 0), 1).await.unwrap();
    assert_eq!(first.len(), 3);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(repo.region_calls(), 1);
    assert_eq!(query.cache_hit_count("radius_0_0_1"), Some(1));
    assert_eq!(metrics.cache_hits(), 1);
    assert_eq!(metrics.cache_misses(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    let third = query.find_chunks_in_radius(ChunkPosition::new(0, 0), 1).await.unwrap();
    assert_eq!(repo.region_calls(), 2);
    assert_eq!(third.len(), 3);
    assert_eq!(query.cache_hit_count("radius_0_0_1"), Some(0));
}

#[tokio::test]
async fn region_and_orphan_scenario() {
    let repo = Arc::new(InMemoryChunkRepository::new());
    seed(repo.as_ref(), &[(0, 0), (1, 0), (0, 1), (5, 5)]).await;
    let query = ChunkQueryRepository::new(repo.clone());

    let mut region: Vec<ChunkPosition> = repo
        .find_by_region(ChunkRegion::new(0, 1, 0, 1))
        .await
        .unwrap()
        .iter()
        .map(|c| c.position)
        .collect();
    region.sort();
    assert_eq!(region, vec![ChunkPosition::new(0, 0), ChunkPosition::new(0, 1), ChunkPosition::new(1, 0)]);

    let orphans = query.find_orphaned_chunks().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].position, ChunkPosition::new(5, 5));
}

// Cached results are not invalidated by writes: a save within the TTL is
// invisible to an identical query until the entry expires or is cleared.
#[tokio::test(start_paused = true)]
async fn writes_within_ttl_are_not_visible_to_cached_queries() {
    let repo = Arc::new(InMemoryChunkRepository::new());
    seed(repo.as_ref(), &[(0, 0)]).await;
    let query = ChunkQueryRepository::new(repo.clone());

    assert_eq!(query.find_chunks_in_radius(ChunkPosition::new(0, 0), 2).await.unwrap().len(), 1);
    repo.save(ChunkData::empty(ChunkPosition::new(1, 1))).await.unwrap();
    assert_eq!(query.find_chunks_in_radius(ChunkPosition::new(0, 0), 2).await.unwrap().len(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(query.evict_expired(), 1);
    assert_eq!(query.find_chunks_in_radius(ChunkPosition::new(0, 0), 2).await.unwrap().len(), 2);

    repo.save(ChunkData::empty(ChunkPosition::new(2, 0))).await.unwrap();
    query.clear_cache();
    assert_eq!(query.find_chunks_in_radius(ChunkPosition::new(0, 0), 2).await.unwrap().len(), 3);
}

#[tokio::test]
async fn search_by_radius_and_paging() {
    let repo = Arc::new(InMemoryChunkRepository::new());
    seed(repo.as_ref(), &[(0, 0), (1, 0), (2, 0), (3, 0), (4, 0)]).await;
    let query = ChunkQueryRepository::new(repo);

    let criteria = ChunkSearchCriteria {
        radius: Some(RadiusFilter { center: ChunkPosition::new(0, 0), radius: 3.0 }),
        offset: Some(1),
        limit: Some(2),
        ..Default::default()
    };
    let result = query.search_chunks(&criteria).await.unwrap();
    assert_eq!(result.total_count, 4);
    assert_eq!(result.chunks.len(), 2);
    assert!(result.has_more);

    let last_page = ChunkSearchCriteria { offset: Some(3), ..criteria };
    let result = query.search_chunks(&last_page).await.unwrap();
    assert_eq!(result.chunks.len(), 1);
    assert!(!result.has_more);
}

#[tokio::test]
async fn neighborhood_of_missing_chunk_fails() {
    let repo = Arc::new(InMemoryChunkRepository::new());
    let query = ChunkQueryRepository::new(repo);
    let err = query.get_chunk_neighborhood(ChunkPosition::new(3, 4)).await.unwrap_err();
    match err {
        RepositoryError::ChunkNotFound { position, .. } => assert_eq!(position, Some(ChunkPosition::new(3, 4))),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn measured_queries_land_in_the_ring_buffer() {
    let repo = Arc::new(InMemoryChunkRepository::new());
    let query = ChunkQueryRepository::new(repo.clone());

    query
        .measure_query_performance("seed", async { repo.save(ChunkData::empty(ChunkPosition::new(0, 0))).await })
        .await
        .unwrap();
    let missing = query
        .measure_query_performance("neighborhood", query.get_chunk_neighborhood(ChunkPosition::new(9, 9)))
        .await;
    assert!(missing.is_err());

    let metrics = query.get_query_performance_metrics();
    assert_eq!(metrics.samples, 2);
    assert_eq!(metrics.failures, 1);
    let seed = &metrics.recent[0];
    assert_eq!(seed.name, "seed");
    assert!(seed.memory_delta_bytes.is_some_and(|d| d > 0));
}

#[tokio::test]
async fn measuring_reads_size_counters_not_full_statistics() {
    let repo = Arc::new(CountingRepository::default());
    seed(repo.as_ref(), &[(0, 0), (1, 0)]).await;
    let query = ChunkQueryRepository::new(repo.clone());

    let added = ChunkData::empty(ChunkPosition::new(2, 0));
    let expected = added.estimated_size() as i64;
    query
        .measure_query_performance("save", async { repo.save(added).await })
        .await
        .unwrap();

    assert_eq!(repo.statistics_calls(), 0);
    let metrics = query.get_query_performance_metrics();
    assert_eq!(metrics.recent[0].memory_delta_bytes, Some(expected));
}

#[tokio::test]
async fn hybrid_backend_serves_queries_and_replicates() {
    let metrics = Arc::new(BenchmarkMetrics::new());
    let config = RepositoryConfig { strategy: RepositoryStrategy::Hybrid, ..Default::default() };
    let factory = RepositoryFactory::new(config, chunkvault_storage::EnvironmentInfo::detect(), metrics.clone());
    let repo = factory.create().await.unwrap();
    seed(repo.as_ref(), &[(0, 0), (1, 0), (0, 1), (5, 5)]).await;

    let query = ChunkQueryRepository::new(repo.clone());
    assert_eq!(query.find_chunks_in_region(ChunkRegion::new(0, 1, 0, 1)).await.unwrap().len(), 3);
    assert_eq!(query.find_orphaned_chunks().await.unwrap().len(), 1);

    repo.flush().await.unwrap();
    // initialize + four saves
    assert_eq!(metrics.replications(), 5);
    assert_eq!(metrics.replication_failures(), 0);
}
