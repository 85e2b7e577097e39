//! Records and value types shared by every backend.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkData, ChunkId, ChunkPosition, ChunkRegion};
use crate::error::RepositoryError;

/// A stored chunk plus its bookkeeping.
///
/// `modified_at` and `chunk` only move on writes, `access_count` and
/// `last_access_at` only on successful single-chunk lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub chunk: ChunkData,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_access_at: DateTime<Utc>,
    /// `chunk.estimated_size()` as of the last write.
    #[serde(default)]
    pub size: u64,
}

impl ChunkEntry {
    pub fn new(chunk: ChunkData, now: DateTime<Utc>) -> Self {
        let size = chunk.estimated_size() as u64;
        Self { chunk, created_at: now, modified_at: now, access_count: 0, last_access_at: now, size }
    }

    /// Replace the chunk, keeping creation time and access history.
    pub fn overwrite(&mut self, chunk: ChunkData, now: DateTime<Utc>) {
        self.size = chunk.estimated_size() as u64;
        self.chunk = chunk;
        self.modified_at = now;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_access_at = now;
    }

    pub fn position(&self) -> ChunkPosition {
        self.chunk.position
    }

    /// Time between first store and last lookup, in milliseconds.
    pub fn load_time_ms(&self) -> f64 {
        (self.last_access_at - self.created_at).num_milliseconds().max(0) as f64
    }
}

/// Filter for `find_by_query`. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkQuery {
    pub positions: Option<Vec<ChunkPosition>>,
    pub region: Option<ChunkRegion>,
    pub loaded_after: Option<DateTime<Utc>>,
    pub modified_after: Option<DateTime<Utc>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl ChunkQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_region(region: ChunkRegion) -> Self {
        Self { region: Some(region), ..Self::default() }
    }

    pub fn at_positions(positions: Vec<ChunkPosition>) -> Self {
        Self { positions: Some(positions), ..Self::default() }
    }

    pub fn loaded_after(mut self, at: DateTime<Utc>) -> Self {
        self.loaded_after = Some(at);
        self
    }

    pub fn modified_after(mut self, at: DateTime<Utc>) -> Self {
        self.modified_after = Some(at);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    /// Applies the filter, then orders by creation time (position breaks
    /// ties) so offset/limit pages are stable, then windows the result.
    pub fn apply<'a, I>(&self, entries: I) -> Vec<ChunkEntry>
    where
        I: IntoIterator<Item = &'a ChunkEntry>,
    {
        let positions: Option<HashSet<ChunkPosition>> =
            self.positions.as_ref().map(|p| p.iter().copied().collect());

        let mut matched: Vec<ChunkEntry> = entries
            .into_iter()
            .filter(|e| positions.as_ref().is_none_or(|set| set.contains(&e.position())))
            .filter(|e| self.region.is_none_or(|r| r.contains(&e.position())))
            .filter(|e| self.loaded_after.is_none_or(|t| e.created_at > t))
            .filter(|e| self.modified_after.is_none_or(|t| e.modified_at > t))
            .cloned()
            .collect();

        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.position().cmp(&b.position())));

        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        matched.into_iter().skip(offset).take(limit).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStatistics {
    pub total_chunks: usize,
    pub dirty_chunks: usize,
    pub memory_usage_bytes: u64,
    pub cache_hit_rate: f64,
    pub average_load_time_ms: f64,
    pub total_operations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub oldest_chunk: Option<DateTime<Utc>>,
    pub newest_chunk: Option<DateTime<Utc>>,
}

impl RepositoryStatistics {
    pub fn from_entries<'a, I>(entries: I, total_operations: u64, cache_hits: u64, cache_misses: u64) -> Self
    where
        I: IntoIterator<Item = &'a ChunkEntry>,
    {
        let mut stats = Self { total_operations, cache_hits, cache_misses, ..Self::default() };
        let mut load_time_total = 0.0;

        for entry in entries {
            stats.total_chunks += 1;
            if entry.chunk.is_dirty {
                stats.dirty_chunks += 1;
            }
            stats.memory_usage_bytes += entry.size;
            load_time_total += entry.load_time_ms();
            stats.oldest_chunk = Some(stats.oldest_chunk.map_or(entry.created_at, |t| t.min(entry.created_at)));
            stats.newest_chunk = Some(stats.newest_chunk.map_or(entry.created_at, |t| t.max(entry.created_at)));
        }

        stats.cache_hit_rate = if total_operations > 0 { cache_hits as f64 / total_operations as f64 } else { 0.0 };
        stats.average_load_time_ms =
            if stats.total_chunks > 0 { load_time_total / stats.total_chunks as f64 } else { 0.0 };
        stats
    }
}

#[derive(Debug)]
pub struct BatchFailure<K> {
    pub item: K,
    pub error: RepositoryError,
}

/// Per-item result of a batch call.
#[derive(Debug)]
pub struct BatchOutcome<K> {
    pub successful: Vec<K>,
    pub failed: Vec<BatchFailure<K>>,
}

impl<K> Default for BatchOutcome<K> {
    fn default() -> Self {
        Self { successful: Vec::new(), failed: Vec::new() }
    }
}

impl<K> BatchOutcome<K> {
    pub fn succeed(&mut self, item: K) {
        self.successful.push(item);
    }

    pub fn fail(&mut self, item: K, error: RepositoryError) {
        self.failed.push(BatchFailure { item, error });
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub checked: usize,
    pub errors: Vec<String>,
    pub corrupted: Vec<ChunkId>,
}

impl IntegrityReport {
    pub fn flag(&mut self, id: ChunkId, message: String) {
        log::error!("Integrity check failed for {}: {}", id, message);
        self.errors.push(message);
        if !self.corrupted.contains(&id) {
            self.corrupted.push(id);
        }
    }

    pub fn finish(mut self) -> Self {
        self.is_valid = self.errors.is_empty();
        self
    }
}

/// Checks shared by every backend: stored key matches the chunk, and the
/// chunk itself is well formed.
pub fn check_entry(report: &mut IntegrityReport, key: &str, entry: &ChunkEntry) {
    report.checked += 1;
    let expected = entry.position().key();
    if key != expected {
        report.flag(entry.chunk.id(), format!("stored under key {} but chunk is at {}", key, expected));
    }
    if let Err(e) = entry.chunk.validate() {
        report.flag(entry.chunk.id(), e.to_string());
    }
    if entry.modified_at < entry.created_at {
        report.flag(entry.chunk.id(), "modified before it was created".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry_at(x: i32, z: i32, created: DateTime<Utc>) -> ChunkEntry {
        ChunkEntry::new(ChunkData::empty(ChunkPosition::new(x, z)), created)
    }

    #[test]
    fn test_query_filters_and_pages() {
        let t0 = Utc::now();
        let entries = vec![
            entry_at(0, 0, t0),
            entry_at(1, 0, t0 + Duration::seconds(1)),
            entry_at(2, 0, t0 + Duration::seconds(2)),
            entry_at(9, 9, t0 + Duration::seconds(3)),
        ];

        let region = ChunkQuery::in_region(ChunkRegion::new(0, 2, 0, 0)).apply(&entries);
        assert_eq!(region.len(), 3);

        let page = ChunkQuery::all().page(1, 2).apply(&entries);
        let xs: Vec<i32> = page.iter().map(|e| e.position().x).collect();
        assert_eq!(xs, vec![1, 2]);

        let recent = ChunkQuery::all().loaded_after(t0 + Duration::seconds(1)).apply(&entries);
        assert_eq!(recent.len(), 2);

        let picked = ChunkQuery::at_positions(vec![ChunkPosition::new(9, 9)]).apply(&entries);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn test_statistics_with_no_operations() {
        let stats = RepositoryStatistics::from_entries(&Vec::<ChunkEntry>::new(), 0, 0, 0);
        assert_eq!(stats.cache_hit_rate, 0.0);
        assert_eq!(stats.average_load_time_ms, 0.0);
        assert_eq!(stats.total_chunks, 0);
    }

    #[test]
    fn test_statistics_load_time_and_hit_rate() {
        let t0 = Utc::now();
        let mut a = entry_at(0, 0, t0);
        a.touch(t0 + Duration::milliseconds(100));
        let b = entry_at(1, 0, t0);

        let stats = RepositoryStatistics::from_entries(&[a, b], 4, 1, 3);
        assert_eq!(stats.cache_hit_rate, 0.25);
        assert_eq!(stats.average_load_time_ms, 50.0);
        assert_eq!(stats.total_chunks, 2);
    }
}
