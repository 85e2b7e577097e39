use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chunkvault_storage::Result;
use serde::Serialize;

use crate::repository::ChunkQueryRepository;

/// Samples kept by the ring buffer.
pub const PERFORMANCE_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPerformanceSample {
    pub name: String,
    pub duration: Duration,
    /// Change in the repository's reported memory usage, when both readings
    /// were available.
    pub memory_delta_bytes: Option<i64>,
    pub succeeded: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryPerformanceMetrics {
    pub samples: usize,
    pub average_duration: Duration,
    pub max_duration: Duration,
    pub slowest_query: Option<String>,
    pub failures: usize,
    pub recent: Vec<QueryPerformanceSample>,
}

#[derive(Debug, Default)]
pub(crate) struct PerformanceLog {
    samples: Mutex<VecDeque<QueryPerformanceSample>>,
}

impl PerformanceLog {
    fn lock(&self) -> MutexGuard<'_, VecDeque<QueryPerformanceSample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, sample: QueryPerformanceSample) {
        let mut samples = self.lock();
        if samples.len() == PERFORMANCE_HISTORY {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub(crate) fn metrics(&self) -> QueryPerformanceMetrics {
        let samples = self.lock();
        let recent: Vec<QueryPerformanceSample> = samples.iter().cloned().collect();
        if recent.is_empty() {
            return QueryPerformanceMetrics::default();
        }

        let total: Duration = recent.iter().map(|s| s.duration).sum();
        let slowest = recent.iter().max_by_key(|s| s.duration);
        QueryPerformanceMetrics {
            samples: recent.len(),
            average_duration: total / recent.len() as u32,
            max_duration: slowest.map(|s| s.duration).unwrap_or_default(),
            slowest_query: slowest.map(|s| s.name.clone()),
            failures: recent.iter().filter(|s| !s.succeeded).count(),
            recent,
        }
    }
}

impl ChunkQueryRepository {
    /// Run `query`, recording its wall-clock time and the stored chunk bytes
    /// the repository reports before and after. The query's own result is
    /// passed through untouched.
    pub async fn measure_query_performance<T, F>(&self, name: &str, query: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let before = self.memory_usage().await;
        let start = Instant::now();
        let result = query.await;
        let duration = start.elapsed();
        let after = self.memory_usage().await;

        let memory_delta_bytes = before.zip(after).map(|(b, a)| a as i64 - b as i64);
        log::debug!("Query {} took {:?} (memory delta {:?})", name, duration, memory_delta_bytes);

        self.performance.push(QueryPerformanceSample {
            name: name.to_string(),
            duration,
            memory_delta_bytes,
            succeeded: result.is_ok(),
            recorded_at: Utc::now(),
        });
        result
    }

    pub fn get_query_performance_metrics(&self) -> QueryPerformanceMetrics {
        self.performance.metrics()
    }

    async fn memory_usage(&self) -> Option<u64> {
        match self.repository().memory_usage_bytes().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::debug!("Query: memory reading unavailable: {}", e);
                None
            }
        }
    }
}
