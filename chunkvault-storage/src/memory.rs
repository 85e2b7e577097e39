//! In-memory storage backend.
//!
//! The authoritative, low-latency store and the fast half of the hybrid
//! backend. Data is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::chunk::{ChunkData, ChunkId, ChunkPosition, ChunkRegion};
use crate::error::Result;
use crate::types::{check_entry, BatchOutcome, ChunkEntry, ChunkQuery, IntegrityReport, RepositoryStatistics};
use crate::ChunkRepository;

/// Clean chunks untouched for this long are evicted by `cleanup`.
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(10 * 60);

/// Everything the in-memory backend knows.
///
/// Cloning is cheap: the chunk map is shared, and the first write after a
/// clone copies it (`Arc::make_mut`), so a snapshot never sees later writes.
#[derive(Debug, Clone, Default)]
pub struct RepositoryState {
    pub chunks: Arc<HashMap<String, ChunkEntry>>,
    pub total_operations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl RepositoryState {
    fn chunks_mut(&mut self) -> &mut HashMap<String, ChunkEntry> {
        Arc::make_mut(&mut self.chunks)
    }

    /// Hit-or-miss lookup that updates access bookkeeping.
    fn lookup(&mut self, position: ChunkPosition) -> Option<ChunkData> {
        self.total_operations += 1;
        let key = position.key();
        if !self.chunks.contains_key(&key) {
            self.cache_misses += 1;
            return None;
        }
        self.cache_hits += 1;
        let entry = self.chunks_mut().get_mut(&key)?;
        entry.touch(Utc::now());
        Some(entry.chunk.clone())
    }

    fn store(&mut self, chunk: ChunkData) {
        self.total_operations += 1;
        let now = Utc::now();
        let chunks = self.chunks_mut();
        match chunks.get_mut(&chunk.position.key()) {
            Some(entry) => entry.overwrite(chunk, now),
            None => {
                chunks.insert(chunk.position.key(), ChunkEntry::new(chunk, now));
            }
        }
    }

    fn remove(&mut self, position: ChunkPosition) -> bool {
        self.total_operations += 1;
        let key = position.key();
        // don't force a copy of the map for a no-op delete
        if !self.chunks.contains_key(&key) {
            return false;
        }
        self.chunks_mut().remove(&key).is_some()
    }

    fn entries(&self) -> impl Iterator<Item = &ChunkEntry> {
        self.chunks.values()
    }
}

/// In-memory chunk repository.
///
/// All state sits behind one async mutex owned by this instance. Each
/// operation takes the lock once, applies its whole update and releases it,
/// so concurrent calls are serialized and the counters never race.
pub struct InMemoryChunkRepository {
    state: Mutex<RepositoryState>,
    idle_eviction: Duration,
}

impl InMemoryChunkRepository {
    pub fn new() -> Self {
        Self::with_idle_eviction(DEFAULT_IDLE_EVICTION)
    }

    pub fn with_idle_eviction(idle_eviction: Duration) -> Self {
        Self {
            state: Mutex::new(RepositoryState::default()),
            idle_eviction,
        }
    }

    async fn update<R>(&self, f: impl FnOnce(&mut RepositoryState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Point-in-time copy of the state.
    pub async fn snapshot(&self) -> RepositoryState {
        self.state.lock().await.clone()
    }
}

impl Default for InMemoryChunkRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-access time before which a clean chunk counts as idle. `None` when
/// the threshold reaches past the representable range.
pub(crate) fn idle_cutoff(idle: Duration) -> Option<chrono::DateTime<Utc>> {
    let idle = chrono::Duration::from_std(idle).ok()?;
    Utc::now().checked_sub_signed(idle)
}

fn position_of(id: &ChunkId) -> Option<ChunkPosition> {
    let position = id.position();
    if position.is_none() {
        log::debug!("Memory: ignoring unrecognised chunk id {}", id);
    }
    position
}

#[async_trait]
impl ChunkRepository for InMemoryChunkRepository {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn find_by_id(&self, id: &ChunkId) -> Result<Option<ChunkData>> {
        let Some(position) = position_of(id) else {
            return Ok(None);
        };
        self.find_by_position(position).await
    }

    async fn find_by_position(&self, position: ChunkPosition) -> Result<Option<ChunkData>> {
        Ok(self.update(|state| state.lookup(position)).await)
    }

    async fn find_by_region(&self, region: ChunkRegion) -> Result<Vec<ChunkData>> {
        let state = self.snapshot().await;
        Ok(state
            .entries()
            .filter(|e| region.contains(&e.position()))
            .map(|e| e.chunk.clone())
            .collect())
    }

    async fn find_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkData>> {
        let positions: Vec<ChunkPosition> = ids.iter().filter_map(position_of).collect();
        self.find_by_positions(&positions).await
    }

    async fn find_by_positions(&self, positions: &[ChunkPosition]) -> Result<Vec<ChunkData>> {
        let state = self.snapshot().await;
        Ok(positions
            .iter()
            .filter_map(|p| state.chunks.get(&p.key()))
            .map(|e| e.chunk.clone())
            .collect())
    }

    async fn save(&self, chunk: ChunkData) -> Result<()> {
        chunk.validate()?;
        log::debug!("Memory: saving chunk {}", chunk.position);
        self.update(|state| state.store(chunk)).await;
        Ok(())
    }

    async fn save_all(&self, chunks: Vec<ChunkData>) -> Result<()> {
        for chunk in &chunks {
            chunk.validate()?;
        }
        self.update(|state| {
            for chunk in chunks {
                state.store(chunk);
            }
        })
        .await;
        Ok(())
    }

    async fn delete(&self, id: &ChunkId) -> Result<()> {
        match position_of(id) {
            Some(position) => self.delete_by_position(position).await,
            None => Ok(()),
        }
    }

    async fn delete_by_position(&self, position: ChunkPosition) -> Result<()> {
        let removed = self.update(|state| state.remove(position)).await;
        if removed {
            log::debug!("Memory: deleted chunk {}", position);
        }
        Ok(())
    }

    async fn delete_all(&self, ids: &[ChunkId]) -> Result<()> {
        let positions: Vec<ChunkPosition> = ids.iter().filter_map(position_of).collect();
        self.update(|state| {
            for position in positions {
                state.remove(position);
            }
        })
        .await;
        Ok(())
    }

    async fn exists(&self, id: &ChunkId) -> Result<bool> {
        match position_of(id) {
            Some(position) => self.exists_by_position(position).await,
            None => Ok(false),
        }
    }

    async fn exists_by_position(&self, position: ChunkPosition) -> Result<bool> {
        Ok(self.state.lock().await.chunks.contains_key(&position.key()))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.state.lock().await.chunks.len())
    }

    async fn count_by_region(&self, region: ChunkRegion) -> Result<usize> {
        let state = self.snapshot().await;
        Ok(state.entries().filter(|e| region.contains(&e.position())).count())
    }

    async fn find_entries(&self, query: &ChunkQuery) -> Result<Vec<ChunkEntry>> {
        let state = self.snapshot().await;
        Ok(query.apply(state.entries()))
    }

    async fn find_recently_loaded(&self, limit: usize) -> Result<Vec<ChunkData>> {
        let state = self.snapshot().await;
        let mut entries: Vec<&ChunkEntry> = state.entries().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.position().cmp(&b.position())));
        Ok(entries.into_iter().take(limit).map(|e| e.chunk.clone()).collect())
    }

    async fn find_modified(&self) -> Result<Vec<ChunkData>> {
        let state = self.snapshot().await;
        Ok(state.entries().filter(|e| e.chunk.is_dirty).map(|e| e.chunk.clone()).collect())
    }

    async fn get_statistics(&self) -> Result<RepositoryStatistics> {
        let state = self.snapshot().await;
        Ok(RepositoryStatistics::from_entries(
            state.entries(),
            state.total_operations,
            state.cache_hits,
            state.cache_misses,
        ))
    }

    async fn memory_usage_bytes(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.entries().map(|e| e.size).sum())
    }

    async fn batch_save(&self, chunks: Vec<ChunkData>) -> Result<BatchOutcome<ChunkPosition>> {
        let mut outcome = BatchOutcome::default();
        let mut valid = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match chunk.validate() {
                Ok(()) => valid.push(chunk),
                Err(e) => outcome.fail(chunk.position, e),
            }
        }
        self.update(|state| {
            for chunk in valid {
                let position = chunk.position;
                state.store(chunk);
                outcome.succeed(position);
            }
        })
        .await;
        Ok(outcome)
    }

    async fn batch_delete(&self, ids: Vec<ChunkId>) -> Result<BatchOutcome<ChunkId>> {
        let mut outcome = BatchOutcome::default();
        self.update(|state| {
            for id in ids {
                // unknown ids are already "deleted"
                if let Some(position) = id.position() {
                    state.remove(position);
                }
                outcome.succeed(id);
            }
        })
        .await;
        Ok(outcome)
    }

    async fn initialize(&self) -> Result<()> {
        log::debug!("Memory: repository ready");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.update(|state| *state = RepositoryState::default()).await;
        log::info!("Memory: cleared all chunks");
        Ok(())
    }

    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        let state = self.snapshot().await;
        let mut report = IntegrityReport::default();
        for (key, entry) in state.chunks.iter() {
            check_entry(&mut report, key, entry);
        }
        Ok(report.finish())
    }

    async fn clear_cache(&self) -> Result<()> {
        self.update(|state| {
            state.total_operations = 0;
            state.cache_hits = 0;
            state.cache_misses = 0;
        })
        .await;
        Ok(())
    }

    async fn cleanup(&self) -> Result<usize> {
        let Some(cutoff) = idle_cutoff(self.idle_eviction) else {
            return Ok(0);
        };
        let evicted = self
            .update(|state| {
                let stale: Vec<String> = state
                    .chunks
                    .iter()
                    .filter(|(_, e)| !e.chunk.is_dirty && e.last_access_at < cutoff)
                    .map(|(k, _)| k.clone())
                    .collect();
                if !stale.is_empty() {
                    let chunks = state.chunks_mut();
                    for key in &stale {
                        chunks.remove(key);
                    }
                }
                stale.len()
            })
            .await;
        if evicted > 0 {
            log::info!("Memory: cleanup evicted {} idle chunks", evicted);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{blocks, ChunkBuilder};
    use proptest::prelude::*;

    fn chunk(x: i32, z: i32) -> ChunkData {
        ChunkData::empty(ChunkPosition::new(x, z))
    }

    #[tokio::test]
    async fn test_save_then_find_round_trip() {
        let repo = InMemoryChunkRepository::new();
        let original = ChunkBuilder::flat().build(ChunkPosition::new(10, -5));

        repo.save(original.clone()).await.unwrap();

        let found = repo.find_by_position(ChunkPosition::new(10, -5)).await.unwrap();
        assert_eq!(found, Some(original.clone()));
        let by_id = repo.find_by_id(&original.id()).await.unwrap();
        assert_eq!(by_id.map(|c| c.blocks), Some(original.blocks));
    }

    #[tokio::test]
    async fn test_save_same_position_keeps_one_entry() {
        let repo = InMemoryChunkRepository::new();
        let first = chunk(3, 3);
        let second = chunk(3, 3).with_block(0, 0, 0, blocks::STONE);

        repo.save(first).await.unwrap();
        let created = repo.snapshot().await.chunks["3,3"].created_at;
        repo.save(second.clone()).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 1);
        let state = repo.snapshot().await;
        let entry = &state.chunks["3,3"];
        assert_eq!(entry.chunk, second);
        assert_eq!(entry.created_at, created);
        assert!(entry.modified_at >= created);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let repo = InMemoryChunkRepository::new();
        repo.save(chunk(1, 1)).await.unwrap();
        let id = ChunkId::for_position(ChunkPosition::new(1, 1));

        repo.delete(&id).await.unwrap();
        let before = repo.snapshot().await.chunks.clone();
        repo.delete(&id).await.unwrap();
        repo.delete(&ChunkId::new("garbage")).await.unwrap();

        assert_eq!(repo.snapshot().await.chunks, before);
        assert!(!repo.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_region_scenario() {
        let repo = InMemoryChunkRepository::new();
        for (x, z) in [(0, 0), (1, 0), (0, 1), (5, 5)] {
            repo.save(chunk(x, z)).await.unwrap();
        }

        let mut found: Vec<ChunkPosition> = repo
            .find_by_region(ChunkRegion::new(0, 1, 0, 1))
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.position)
            .collect();
        found.sort();
        assert_eq!(
            found,
            vec![ChunkPosition::new(0, 0), ChunkPosition::new(0, 1), ChunkPosition::new(1, 0)]
        );
        assert_eq!(repo.count_by_region(ChunkRegion::new(0, 1, 0, 1)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_access_bookkeeping_and_hit_rate() {
        let repo = InMemoryChunkRepository::new();
        assert_eq!(repo.get_statistics().await.unwrap().cache_hit_rate, 0.0);

        repo.save(chunk(0, 0)).await.unwrap(); // 1 op
        repo.find_by_position(ChunkPosition::new(0, 0)).await.unwrap(); // hit
        repo.find_by_position(ChunkPosition::new(0, 0)).await.unwrap(); // hit
        repo.find_by_position(ChunkPosition::new(9, 9)).await.unwrap(); // miss

        let stats = repo.get_statistics().await.unwrap();
        assert_eq!(stats.total_operations, 4);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hit_rate, 0.5);

        let state = repo.snapshot().await;
        assert_eq!(state.chunks["0,0"].access_count, 2);

        // region scans do not count as accesses
        repo.find_by_region(ChunkRegion::around(ChunkPosition::new(0, 0), 1)).await.unwrap();
        assert_eq!(repo.snapshot().await.chunks["0,0"].access_count, 2);

        repo.clear_cache().await.unwrap();
        let stats = repo.get_statistics().await.unwrap();
        assert_eq!(stats.total_operations, 0);
        assert_eq!(stats.total_chunks, 1);
    }

    #[tokio::test]
    async fn test_memory_usage_follows_overwrites() {
        let repo = InMemoryChunkRepository::new();
        repo.save(chunk(0, 0)).await.unwrap();
        repo.save(chunk(1, 0)).await.unwrap();
        let small = repo.memory_usage_bytes().await.unwrap();
        assert_eq!(small, repo.get_statistics().await.unwrap().memory_usage_bytes);

        let bigger = chunk(1, 0).with_block(0, 0, 0, blocks::STONE).with_block(1, 0, 0, blocks::STONE);
        let expected = small - chunk(1, 0).estimated_size() as u64 + bigger.estimated_size() as u64;
        repo.save(bigger).await.unwrap();
        assert_eq!(repo.memory_usage_bytes().await.unwrap(), expected);
        assert_eq!(repo.get_statistics().await.unwrap().memory_usage_bytes, expected);
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_writes() {
        let repo = InMemoryChunkRepository::new();
        repo.save(chunk(0, 0)).await.unwrap();
        let snapshot = repo.snapshot().await;

        repo.save(chunk(1, 0)).await.unwrap();
        repo.delete_by_position(ChunkPosition::new(0, 0)).await.unwrap();

        assert_eq!(snapshot.chunks.len(), 1);
        assert!(snapshot.chunks.contains_key("0,0"));
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_saves_do_not_lose_updates() {
        let repo = Arc::new(InMemoryChunkRepository::new());
        let mut handles = Vec::new();
        for x in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move { repo.save(chunk(x, 0)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(repo.count().await.unwrap(), 16);
        assert_eq!(repo.get_statistics().await.unwrap().total_operations, 16);
    }

    #[tokio::test]
    async fn test_batch_save_partitions_invalid_chunks() {
        let repo = InMemoryChunkRepository::new();
        let mut broken = chunk(2, 2);
        broken.blocks.truncate(5);

        let outcome = repo.batch_save(vec![chunk(1, 1), broken, chunk(3, 3)]).await.unwrap();
        assert_eq!(outcome.successful, vec![ChunkPosition::new(1, 1), ChunkPosition::new(3, 3)]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].item, ChunkPosition::new(2, 2));
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_save_all_is_all_or_nothing() {
        let repo = InMemoryChunkRepository::new();
        let mut broken = chunk(2, 2);
        broken.metadata.height_map.clear();

        assert!(repo.save_all(vec![chunk(1, 1), broken]).await.is_err());
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_integrity_flags_corrupted_entries() {
        let repo = InMemoryChunkRepository::new();
        repo.save(chunk(0, 0)).await.unwrap();
        repo.save(chunk(1, 0)).await.unwrap();
        assert!(repo.validate_integrity().await.unwrap().is_valid);

        // corrupt the store directly, bypassing validation
        repo.update(|state| {
            let chunks = state.chunks_mut();
            chunks.get_mut("1,0").unwrap().chunk.blocks.truncate(1);
            let moved = ChunkEntry::new(chunk(7, 7), Utc::now());
            chunks.insert("8,8".to_string(), moved);
        })
        .await;

        let report = repo.validate_integrity().await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.checked, 3);
        assert_eq!(report.corrupted.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_idle_clean_chunks_only() {
        let repo = InMemoryChunkRepository::with_idle_eviction(Duration::ZERO);
        repo.save(chunk(0, 0)).await.unwrap();
        repo.save(chunk(1, 0).mark_dirty()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let evicted = repo.cleanup().await.unwrap();
        assert_eq!(evicted, 1);
        assert!(repo.exists_by_position(ChunkPosition::new(1, 0)).await.unwrap());
        assert_eq!(repo.find_modified().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recently_loaded_is_newest_first() {
        let repo = InMemoryChunkRepository::new();
        for x in 0..3 {
            repo.save(chunk(x, 0)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let recent = repo.find_recently_loaded(2).await.unwrap();
        let xs: Vec<i32> = recent.iter().map(|c| c.position.x).collect();
        assert_eq!(xs, vec![2, 1]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_region_contains_exactly_inside_chunks(
            coords in proptest::collection::hash_set((-6i32..6, -6i32..6), 0..12),
            min_x in -6i32..6, w in 0i32..6, min_z in -6i32..6, d in 0i32..6,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let region = ChunkRegion::new(min_x, min_x + w, min_z, min_z + d);
            let found = rt.block_on(async {
                let repo = InMemoryChunkRepository::new();
                for (x, z) in &coords {
                    repo.save(chunk(*x, *z)).await.unwrap();
                }
                repo.find_by_region(region).await.unwrap()
            });

            let found: std::collections::HashSet<(i32, i32)> =
                found.iter().map(|c| (c.position.x, c.position.z)).collect();
            for (x, z) in &coords {
                let inside = region.min_x <= *x && *x <= region.max_x && region.min_z <= *z && *z <= region.max_z;
                prop_assert_eq!(found.contains(&(*x, *z)), inside);
            }
            prop_assert!(found.iter().all(|p| coords.contains(p)));
        }
    }
}
