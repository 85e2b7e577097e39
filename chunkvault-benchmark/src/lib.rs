use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Lock-free counters shared by the repositories, the hybrid replication
/// worker and the query side. Everything is `Relaxed`: the numbers are only
/// read for reports.
#[derive(Debug, Default)]
pub struct BenchmarkMetrics {
    // Storage Stats
    pub total_chunks_loaded: AtomicUsize,
    pub total_load_time_us: AtomicU64,
    pub total_chunks_saved: AtomicUsize,
    pub total_save_time_us: AtomicU64,
    pub max_save_time_us: AtomicU64,

    // Hybrid replication
    pub total_replications: AtomicUsize,
    pub total_replication_time_us: AtomicU64,
    pub total_replication_failures: AtomicUsize,
    pub total_replications_dropped: AtomicUsize,

    // Query cache
    pub total_cache_hits: AtomicUsize,
    pub total_cache_misses: AtomicUsize,

    // Session
    pub start_time: Option<Instant>,
}

impl BenchmarkMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn record_load(&self, duration: Duration) {
        self.total_chunks_loaded.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_save(&self, duration: Duration) {
        self.total_chunks_saved.fetch_add(1, Ordering::Relaxed);
        let us = duration.as_micros() as u64;
        self.total_save_time_us.fetch_add(us, Ordering::Relaxed);
        self.max_save_time_us.fetch_max(us, Ordering::Relaxed);
    }

    /// A write that reached the persistent side of a hybrid repository.
    pub fn record_replication(&self, duration: Duration) {
        self.total_replications.fetch_add(1, Ordering::Relaxed);
        self.total_replication_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_replication_failure(&self) {
        self.total_replication_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// The replication queue was full (or closed) and the write was never attempted.
    pub fn record_replication_dropped(&self) {
        self.total_replications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.total_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.total_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replications(&self) -> usize {
        self.total_replications.load(Ordering::Relaxed)
    }

    pub fn replication_failures(&self) -> usize {
        self.total_replication_failures.load(Ordering::Relaxed)
    }

    pub fn replications_dropped(&self) -> usize {
        self.total_replications_dropped.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> usize {
        self.total_cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> usize {
        self.total_cache_misses.load(Ordering::Relaxed)
    }

    pub fn generate_report(&self) -> String {
        let uptime = self.start_time.unwrap_or_else(Instant::now).elapsed();

        let loaded = self.total_chunks_loaded.load(Ordering::Relaxed);
        let load_time = self.total_load_time_us.load(Ordering::Relaxed) as f64 / 1000.0; // ms
        let load_avg = if loaded > 0 { load_time / loaded as f64 } else { 0.0 };

        let saved = self.total_chunks_saved.load(Ordering::Relaxed);
        let save_time = self.total_save_time_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let save_avg = if saved > 0 { save_time / saved as f64 } else { 0.0 };
        let save_max = self.max_save_time_us.load(Ordering::Relaxed) as f64 / 1000.0;

        let replicated = self.replications();
        let repl_time = self.total_replication_time_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let repl_avg = if replicated > 0 { repl_time / replicated as f64 } else { 0.0 };
        let repl_failed = self.replication_failures();
        let repl_dropped = self.replications_dropped();

        let hits = self.cache_hits();
        let misses = self.cache_misses();
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 { (hits as f64 / total_requests as f64) * 100.0 } else { 0.0 };

        format!(
            "ChunkVault Benchmark Report\n\
             ===========================\n\
             Session Duration: {:.2?}\n\n\
             [Storage Read]\n\
             Chunks Loaded: {}\n\
             Avg Time: {:.2} ms/chunk\n\n\
             [Storage Write]\n\
             Chunks Saved: {}\n\
             Avg Time: {:.2} ms/chunk\n\
             Max Time: {:.2} ms\n\n\
             [Replication]\n\
             Applied: {}\n\
             Avg Time: {:.2} ms/op\n\
             Failed: {}\n\
             Dropped: {}\n\n\
             [Query Cache]\n\
             Hits: {}\n\
             Misses: {}\n\
             Hit Rate: {:.1}%\n",
            uptime,
            loaded, load_avg,
            saved, save_avg, save_max,
            replicated, repl_avg, repl_failed, repl_dropped,
            hits, misses, hit_rate
        )
    }
}
