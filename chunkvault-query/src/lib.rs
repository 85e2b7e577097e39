//! Read side: cached queries, analytics and the CQRS handlers on top of a
//! `ChunkRepository`.

pub mod analytics;
pub mod cache;
pub mod handlers;
pub mod performance;
pub mod repository;

pub use analytics::{ChunkAnalytics, Heatmap, HeatmapMetric, RegionAnalytics, TimeSeriesPoint};
pub use cache::{CacheEntry, QueryCache, DEFAULT_TTL};
pub use handlers::{ChunkCommand, ChunkCommandHandler, ChunkQueryHandler, ChunkQueryMessage, CommandOutcome, QueryOutcome};
pub use performance::{QueryPerformanceMetrics, QueryPerformanceSample, PERFORMANCE_HISTORY};
pub use repository::{
    ActiveChunk, ChunkNeighborhood, ChunkQueryRepository, ChunkSearchCriteria, Direction, MemoryPressureCause,
    OptimizationCandidate, OptimizationReason, RadiusFilter, SearchResult, SortDirection, SortField, TimeRange,
};
