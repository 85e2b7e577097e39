//! Aggregates over the whole chunk set: summary statistics, per anvil
//! region estimates, heatmaps and load/modify time series.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chunkvault_storage::{BiomeType, ChunkEntry, ChunkRegion, RepositoryError, RepositoryStatistics, Result};
use serde::{Deserialize, Serialize};

use crate::repository::ChunkQueryRepository;

/// Largest region `generate_heatmap` will rasterize.
pub const MAX_HEATMAP_CELLS: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkAnalytics {
    pub statistics: RepositoryStatistics,
    pub biome_distribution: BTreeMap<BiomeType, usize>,
    pub total_access_count: u64,
    pub average_size_bytes: f64,
    pub dirty_ratio: f64,
    /// Anvil regions with at least one chunk.
    pub region_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegionAnalytics {
    pub region_x: i32,
    pub region_z: i32,
    pub chunk_count: usize,
    pub memory_bytes: u64,
    pub access_count: u64,
    pub average_access: f64,
    pub dirty_chunks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatmapMetric {
    AccessCount,
    /// Milliseconds between first store and last lookup.
    LoadTime,
    /// `modified_at` as milliseconds since the epoch.
    ModificationTime,
    /// Serialized size in bytes.
    Size,
}

impl HeatmapMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeatmapMetric::AccessCount => "access_count",
            HeatmapMetric::LoadTime => "load_time",
            HeatmapMetric::ModificationTime => "modification_time",
            HeatmapMetric::Size => "size",
        }
    }

    fn value(&self, entry: &ChunkEntry) -> f64 {
        match self {
            HeatmapMetric::AccessCount => entry.access_count as f64,
            HeatmapMetric::LoadTime => entry.load_time_ms(),
            HeatmapMetric::ModificationTime => entry.modified_at.timestamp_millis() as f64,
            HeatmapMetric::Size => entry.size as f64,
        }
    }
}

/// Grid over a region, `cells[z - min_z][x - min_x]`. Missing chunks are
/// `None` and do not count towards `min` / `max`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heatmap {
    pub region: ChunkRegion,
    pub metric: HeatmapMetric,
    pub cells: Vec<Vec<Option<f64>>>,
    pub min: f64,
    pub max: f64,
}

impl Heatmap {
    pub fn value_at(&self, x: i32, z: i32) -> Option<f64> {
        let row = usize::try_from(i64::from(z) - i64::from(self.region.min_z)).ok()?;
        let col = usize::try_from(i64::from(x) - i64::from(self.region.min_x)).ok()?;
        self.cells.get(row)?.get(col).copied().flatten()
    }

    /// 0.0 ..= 1.0 relative to the realized min and max.
    pub fn normalized_at(&self, x: i32, z: i32) -> Option<f64> {
        let value = self.value_at(x, z)?;
        let span = self.max - self.min;
        Some(if span > 0.0 { (value - self.min) / span } else { 0.0 })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    pub start: DateTime<Utc>,
    /// Chunks first stored in this bucket.
    pub loaded: usize,
    /// Chunks last written in this bucket.
    pub modified: usize,
}

impl ChunkQueryRepository {
    pub async fn get_chunk_analytics(&self) -> Result<Arc<ChunkAnalytics>> {
        self.cached("analytics".to_string(), || async move {
            let statistics = self.repository().get_statistics().await?;
            let entries = self.all_entries().await?;

            let mut biome_distribution = BTreeMap::new();
            let mut regions = std::collections::BTreeSet::new();
            let mut total_access_count = 0;
            for entry in &entries {
                *biome_distribution.entry(entry.chunk.metadata.biome).or_insert(0) += 1;
                regions.insert(entry.position().region());
                total_access_count += entry.access_count;
            }

            let count = entries.len();
            let (average_size_bytes, dirty_ratio) = if count > 0 {
                (
                    statistics.memory_usage_bytes as f64 / count as f64,
                    statistics.dirty_chunks as f64 / count as f64,
                )
            } else {
                (0.0, 0.0)
            };

            Ok(ChunkAnalytics {
                statistics,
                biome_distribution,
                total_access_count,
                average_size_bytes,
                dirty_ratio,
                region_count: regions.len(),
            })
        })
        .await
    }

    /// One row per anvil region that holds chunks, ordered by region.
    pub async fn get_region_analytics(&self) -> Result<Arc<Vec<RegionAnalytics>>> {
        self.cached("region_analytics".to_string(), || async move {
            let entries = self.all_entries().await?;
            let mut regions: BTreeMap<(i32, i32), RegionAnalytics> = BTreeMap::new();

            for entry in &entries {
                let (region_x, region_z) = entry.position().region();
                let row = regions.entry((region_x, region_z)).or_insert_with(|| RegionAnalytics {
                    region_x,
                    region_z,
                    ..Default::default()
                });
                row.chunk_count += 1;
                row.memory_bytes += entry.size;
                row.access_count += entry.access_count;
                if entry.chunk.is_dirty {
                    row.dirty_chunks += 1;
                }
            }

            Ok(regions
                .into_values()
                .map(|mut row| {
                    row.average_access = row.access_count as f64 / row.chunk_count as f64;
                    row
                })
                .collect())
        })
        .await
    }

    pub async fn generate_heatmap(&self, region: ChunkRegion, metric: HeatmapMetric) -> Result<Arc<Heatmap>> {
        let key = format!(
            "heatmap_{}_{}_{}_{}_{}",
            metric.as_str(),
            region.min_x,
            region.max_x,
            region.min_z,
            region.max_z
        );
        let area = region.area();
        if area > MAX_HEATMAP_CELLS {
            return Err(RepositoryError::resource_limit("heatmap cells", MAX_HEATMAP_CELLS, area));
        }
        self.cached(key, || async move {
            let entries = self.repository().find_entries(&chunkvault_storage::ChunkQuery::in_region(region)).await?;

            // rows are only allocated when the area is non-zero and bounded
            let width = region.width() as usize;
            let mut cells: Vec<Vec<Option<f64>>> = (0..region.depth()).map(|_| vec![None; width]).collect();
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for entry in &entries {
                let position = entry.position();
                let value = metric.value(entry);
                let row = (i64::from(position.z) - i64::from(region.min_z)) as usize;
                let col = (i64::from(position.x) - i64::from(region.min_x)) as usize;
                if let Some(cell) = cells.get_mut(row).and_then(|r| r.get_mut(col)) {
                    *cell = Some(value);
                    min = min.min(value);
                    max = max.max(value);
                }
            }
            if entries.is_empty() {
                min = 0.0;
                max = 0.0;
            }

            Ok(Heatmap { region, metric, cells, min, max })
        })
        .await
    }

    /// `buckets` consecutive windows of `bucket` each, oldest first, the last
    /// one ending now. Not cached: the windows move with the clock.
    pub async fn get_time_series(&self, bucket: Duration, buckets: usize) -> Result<Vec<TimeSeriesPoint>> {
        let width = chrono::Duration::from_std(bucket)
            .ok()
            .filter(|w| *w > chrono::Duration::zero())
            .ok_or_else(|| RepositoryError::validation("bucket", format!("{:?}", bucket), "positive and finite"))?;
        if buckets == 0 {
            return Ok(Vec::new());
        }
        let span = i32::try_from(buckets)
            .ok()
            .and_then(|n| width.checked_mul(n))
            .ok_or_else(|| RepositoryError::validation("buckets", buckets.to_string(), "fits in the time range"))?;

        let now = Utc::now();
        let origin = now
            .checked_sub_signed(span)
            .ok_or_else(|| RepositoryError::validation("buckets", buckets.to_string(), "fits in the time range"))?;

        let mut points: Vec<TimeSeriesPoint> = (0..buckets as i32)
            .map(|i| TimeSeriesPoint { start: origin + width * i, loaded: 0, modified: 0 })
            .collect();

        let bucket_of = |at: DateTime<Utc>| -> Option<usize> {
            if at < origin || at > now {
                return None;
            }
            let index = ((at - origin).num_milliseconds() / width.num_milliseconds().max(1)) as usize;
            Some(index.min(buckets.saturating_sub(1)))
        };

        for entry in self.all_entries().await? {
            if let Some(i) = bucket_of(entry.created_at) {
                points[i].loaded += 1;
            }
            if let Some(i) = bucket_of(entry.modified_at) {
                points[i].modified += 1;
            }
        }
        Ok(points)
    }
}
