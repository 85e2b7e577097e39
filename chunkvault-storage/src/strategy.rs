//! Backend selection: environment probe, rule cascade and factory.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chunkvault_benchmark::BenchmarkMetrics;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};
use crate::hybrid::{HybridChunkRepository, DEFAULT_REPLICATION_QUEUE};
use crate::indexed::IndexedChunkRepository;
use crate::memory::{InMemoryChunkRepository, DEFAULT_IDLE_EVICTION};
use crate::object_store::{ObjectStore, PostgresObjectStore, SqliteObjectStore};
use crate::worker::WorkerChunkRepository;
use crate::ChunkRepository;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Browser,
    /// Hosted process with a file system.
    Native,
    Worker,
    Unclassified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryConstraints {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceProfile {
    Low,
    Medium,
    High,
}

/// Snapshot of what the current process can do. Built once at startup with
/// `detect()` (or by hand in tests) and passed down explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub platform: Platform,
    pub has_browser_api: bool,
    pub has_indexed_store: bool,
    pub has_workers: bool,
    pub has_file_system: bool,
    pub memory_constraints: MemoryConstraints,
    pub performance_profile: PerformanceProfile,
    /// Threads available to the process.
    pub concurrency_support: usize,
}

impl EnvironmentInfo {
    pub fn detect() -> Self {
        let platform = if cfg!(target_arch = "wasm32") {
            Platform::Browser
        } else if cfg!(any(unix, windows)) {
            Platform::Native
        } else {
            Platform::Unclassified
        };

        let parallelism = std::thread::available_parallelism().ok().map(|n| n.get());
        let has_file_system = probe_file_system();
        let available = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_mem_available(&meminfo));

        let info = Self {
            platform,
            has_browser_api: platform == Platform::Browser,
            has_indexed_store: platform == Platform::Browser || has_file_system,
            has_workers: parallelism.unwrap_or(1) > 1,
            has_file_system,
            memory_constraints: memory_constraints_for(available),
            performance_profile: performance_profile_for(parallelism),
            concurrency_support: parallelism.unwrap_or(1),
        };
        log::debug!("Environment: {:?}", info);
        info
    }
}

/// `MemAvailable` from `/proc/meminfo`, in bytes.
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Unknown memory counts as `Medium`.
pub fn memory_constraints_for(available_bytes: Option<u64>) -> MemoryConstraints {
    match available_bytes {
        Some(bytes) if bytes < GIB => MemoryConstraints::Low,
        Some(bytes) if bytes < 4 * GIB => MemoryConstraints::Medium,
        Some(_) => MemoryConstraints::High,
        None => MemoryConstraints::Medium,
    }
}

/// Unknown parallelism counts as `High`.
pub fn performance_profile_for(parallelism: Option<usize>) -> PerformanceProfile {
    match parallelism {
        Some(n) if n >= 8 => PerformanceProfile::High,
        Some(n) if n >= 4 => PerformanceProfile::Medium,
        Some(_) => PerformanceProfile::Low,
        None => PerformanceProfile::High,
    }
}

fn probe_file_system() -> bool {
    let probe = std::env::temp_dir().join(format!("chunkvault-probe-{}", std::process::id()));
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(e) => {
            log::debug!("Environment: temp dir not writable: {}", e);
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryStrategy {
    Memory,
    #[serde(alias = "indexeddb")]
    Indexed,
    #[serde(alias = "webworker")]
    Worker,
    Hybrid,
    Auto,
}

impl RepositoryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryStrategy::Memory => "memory",
            RepositoryStrategy::Indexed => "indexed",
            RepositoryStrategy::Worker => "worker",
            RepositoryStrategy::Hybrid => "hybrid",
            RepositoryStrategy::Auto => "auto",
        }
    }
}

impl fmt::Display for RepositoryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryStrategy {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(RepositoryStrategy::Memory),
            "indexed" | "indexeddb" | "sqlite" | "postgres" => Ok(RepositoryStrategy::Indexed),
            "worker" | "webworker" => Ok(RepositoryStrategy::Worker),
            "hybrid" => Ok(RepositoryStrategy::Hybrid),
            "auto" => Ok(RepositoryStrategy::Auto),
            other => Err(RepositoryError::validation(
                "strategy",
                other,
                "one of memory, indexed, worker, hybrid, auto",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    #[default]
    Eventual,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityLevel {
    #[default]
    Memory,
    Persistent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRequirements {
    pub max_latency: Option<Duration>,
    pub concurrent_operations: usize,
    pub consistency: ConsistencyLevel,
    pub durability: DurabilityLevel,
    pub memory_budget: MemoryConstraints,
}

impl Default for PerformanceRequirements {
    fn default() -> Self {
        Self {
            max_latency: None,
            concurrent_operations: 1,
            consistency: ConsistencyLevel::Eventual,
            durability: DurabilityLevel::Memory,
            memory_budget: MemoryConstraints::Medium,
        }
    }
}

/// Signature of the auto-selection rule, swappable on the factory.
pub type AutoSelector = fn(&EnvironmentInfo, &PerformanceRequirements) -> RepositoryStrategy;

pub struct RepositoryStrategySelector;

impl RepositoryStrategySelector {
    pub fn detect_environment() -> EnvironmentInfo {
        EnvironmentInfo::detect()
    }

    /// First matching rule wins.
    pub fn select_optimal_strategy(env: &EnvironmentInfo, req: &PerformanceRequirements) -> RepositoryStrategy {
        let indexed_or_memory = if env.has_indexed_store {
            RepositoryStrategy::Indexed
        } else {
            RepositoryStrategy::Memory
        };

        // 1. Tight memory
        if req.memory_budget == MemoryConstraints::Low || env.memory_constraints == MemoryConstraints::Low {
            return indexed_or_memory;
        }
        // 2. Heavy concurrency
        if req.concurrent_operations > 10 && env.has_workers {
            return RepositoryStrategy::Worker;
        }
        // 3. Strong consistency
        if req.consistency == ConsistencyLevel::Strong {
            return RepositoryStrategy::Memory;
        }
        // 4. Must survive restarts
        if req.durability == DurabilityLevel::Persistent {
            return indexed_or_memory;
        }
        // 5. Latency critical
        if req.max_latency.is_some_and(|l| l < Duration::from_millis(10)) {
            return RepositoryStrategy::Memory;
        }
        // 6. Room for both
        if env.has_indexed_store && env.memory_constraints == MemoryConstraints::High {
            return RepositoryStrategy::Hybrid;
        }
        RepositoryStrategy::Memory
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub strategy: RepositoryStrategy,
    /// PostgreSQL connection string. Takes precedence over `sqlite_path`.
    pub database_url: Option<String>,
    /// SQLite database file. Neither set means a private in-memory SQLite database.
    pub sqlite_path: Option<PathBuf>,
    pub replication_queue_capacity: usize,
    pub idle_eviction: Duration,
    pub requirements: PerformanceRequirements,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            strategy: RepositoryStrategy::Auto,
            database_url: None,
            sqlite_path: None,
            replication_queue_capacity: DEFAULT_REPLICATION_QUEUE,
            idle_eviction: DEFAULT_IDLE_EVICTION,
            requirements: PerformanceRequirements::default(),
        }
    }
}

pub struct RepositoryFactory {
    config: RepositoryConfig,
    environment: EnvironmentInfo,
    metrics: Arc<BenchmarkMetrics>,
    auto_selector: AutoSelector,
}

impl RepositoryFactory {
    pub fn new(config: RepositoryConfig, environment: EnvironmentInfo, metrics: Arc<BenchmarkMetrics>) -> Self {
        Self {
            config,
            environment,
            metrics,
            auto_selector: RepositoryStrategySelector::select_optimal_strategy,
        }
    }

    pub fn with_auto_selector(mut self, auto_selector: AutoSelector) -> Self {
        self.auto_selector = auto_selector;
        self
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn environment(&self) -> &EnvironmentInfo {
        &self.environment
    }

    pub fn auto_select_strategy(&self) -> RepositoryStrategy {
        (self.auto_selector)(&self.environment, &self.config.requirements)
    }

    /// Concrete strategy for a tag. `Auto` is resolved once; if the selector
    /// answers `Auto` again it falls back to `Memory`.
    pub fn resolve_strategy(&self, strategy: RepositoryStrategy) -> RepositoryStrategy {
        if strategy != RepositoryStrategy::Auto {
            return strategy;
        }
        match self.auto_select_strategy() {
            RepositoryStrategy::Auto => {
                log::warn!("Factory: auto selection chose auto, falling back to memory");
                RepositoryStrategy::Memory
            }
            chosen => chosen,
        }
    }

    /// Build (but do not initialize) the backend for a strategy. `Hybrid`
    /// spawns its replication task, so call this inside a tokio runtime.
    pub fn create_repository_layer(&self, strategy: RepositoryStrategy) -> Result<Arc<dyn ChunkRepository>> {
        let resolved = self.resolve_strategy(strategy);
        if strategy == RepositoryStrategy::Auto {
            log::info!("Factory: auto selected {} repository", resolved);
        } else {
            log::info!("Factory: using {} repository", resolved);
        }

        let repo: Arc<dyn ChunkRepository> = match resolved {
            RepositoryStrategy::Memory | RepositoryStrategy::Auto => Arc::new(self.memory()),
            RepositoryStrategy::Indexed => Arc::new(self.indexed()?),
            RepositoryStrategy::Worker => Arc::new(WorkerChunkRepository::with_inner(self.memory())),
            RepositoryStrategy::Hybrid => Arc::new(HybridChunkRepository::with_queue_capacity(
                Arc::new(self.memory()),
                Arc::new(self.indexed()?),
                self.metrics.clone(),
                self.config.replication_queue_capacity,
            )),
        };
        Ok(repo)
    }

    /// Build and initialize the configured backend.
    pub async fn create(&self) -> Result<Arc<dyn ChunkRepository>> {
        let repo = self.create_repository_layer(self.config.strategy)?;
        repo.initialize().await?;
        Ok(repo)
    }

    fn memory(&self) -> InMemoryChunkRepository {
        InMemoryChunkRepository::with_idle_eviction(self.config.idle_eviction)
    }

    fn indexed(&self) -> Result<IndexedChunkRepository> {
        Ok(IndexedChunkRepository::new(self.object_store()?).with_idle_eviction(self.config.idle_eviction))
    }

    fn object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        if let Some(url) = &self.config.database_url {
            return Ok(Arc::new(PostgresObjectStore::connect(url)?));
        }
        match &self.config.sqlite_path {
            Some(path) => Ok(Arc::new(SqliteObjectStore::open_file(path)?)),
            None => Ok(Arc::new(SqliteObjectStore::in_memory()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkData, ChunkPosition};

    fn native(memory: MemoryConstraints) -> EnvironmentInfo {
        EnvironmentInfo {
            platform: Platform::Native,
            has_browser_api: false,
            has_indexed_store: true,
            has_workers: true,
            has_file_system: true,
            memory_constraints: memory,
            performance_profile: PerformanceProfile::High,
            concurrency_support: 8,
        }
    }

    fn factory(strategy: RepositoryStrategy) -> RepositoryFactory {
        let config = RepositoryConfig { strategy, ..Default::default() };
        RepositoryFactory::new(config, native(MemoryConstraints::Medium), Arc::new(BenchmarkMetrics::new()))
    }

    #[test]
    fn test_rule_cascade() {
        let select = RepositoryStrategySelector::select_optimal_strategy;
        let req = PerformanceRequirements::default();

        // 1. low memory wins over everything
        let greedy = PerformanceRequirements {
            concurrent_operations: 50,
            consistency: ConsistencyLevel::Strong,
            ..Default::default()
        };
        assert_eq!(select(&native(MemoryConstraints::Low), &greedy), RepositoryStrategy::Indexed);
        let mut no_store = native(MemoryConstraints::Low);
        no_store.has_indexed_store = false;
        assert_eq!(select(&no_store, &req), RepositoryStrategy::Memory);
        let small_budget = PerformanceRequirements { memory_budget: MemoryConstraints::Low, ..Default::default() };
        assert_eq!(select(&native(MemoryConstraints::High), &small_budget), RepositoryStrategy::Indexed);

        // 2. concurrency, only with workers
        assert_eq!(select(&native(MemoryConstraints::Medium), &greedy), RepositoryStrategy::Worker);
        let mut single = native(MemoryConstraints::Medium);
        single.has_workers = false;
        assert_eq!(select(&single, &greedy), RepositoryStrategy::Memory);

        // 4. durability
        let durable = PerformanceRequirements { durability: DurabilityLevel::Persistent, ..Default::default() };
        assert_eq!(select(&native(MemoryConstraints::High), &durable), RepositoryStrategy::Indexed);

        // 5. latency beats hybrid
        let fast = PerformanceRequirements { max_latency: Some(Duration::from_millis(5)), ..Default::default() };
        assert_eq!(select(&native(MemoryConstraints::High), &fast), RepositoryStrategy::Memory);

        // 6. and 7.
        assert_eq!(select(&native(MemoryConstraints::High), &req), RepositoryStrategy::Hybrid);
        assert_eq!(select(&native(MemoryConstraints::Medium), &req), RepositoryStrategy::Memory);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let env = native(MemoryConstraints::High);
        let req = PerformanceRequirements { max_latency: Some(Duration::from_millis(50)), ..Default::default() };
        let first = RepositoryStrategySelector::select_optimal_strategy(&env, &req);
        for _ in 0..10 {
            assert_eq!(RepositoryStrategySelector::select_optimal_strategy(&env, &req), first);
        }
    }

    #[test]
    fn test_parse_strategy_aliases() {
        assert_eq!("indexeddb".parse::<RepositoryStrategy>().unwrap(), RepositoryStrategy::Indexed);
        assert_eq!("WebWorker".parse::<RepositoryStrategy>().unwrap(), RepositoryStrategy::Worker);
        assert_eq!("auto".parse::<RepositoryStrategy>().unwrap(), RepositoryStrategy::Auto);
        assert!("redis".parse::<RepositoryStrategy>().is_err());

        let parsed: RepositoryStrategy = serde_json::from_str("\"indexeddb\"").unwrap();
        assert_eq!(parsed, RepositoryStrategy::Indexed);
    }

    #[test]
    fn test_memory_and_performance_heuristics() {
        let meminfo = "MemTotal:       16316412 kB\nMemFree:          512000 kB\nMemAvailable:    2097152 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(2 * GIB));
        assert_eq!(parse_mem_available("MemTotal: 1 kB"), None);

        assert_eq!(memory_constraints_for(Some(GIB / 2)), MemoryConstraints::Low);
        assert_eq!(memory_constraints_for(Some(2 * GIB)), MemoryConstraints::Medium);
        assert_eq!(memory_constraints_for(Some(8 * GIB)), MemoryConstraints::High);
        assert_eq!(memory_constraints_for(None), MemoryConstraints::Medium);

        assert_eq!(performance_profile_for(Some(2)), PerformanceProfile::Low);
        assert_eq!(performance_profile_for(Some(4)), PerformanceProfile::Medium);
        assert_eq!(performance_profile_for(Some(16)), PerformanceProfile::High);
        assert_eq!(performance_profile_for(None), PerformanceProfile::High);
    }

    #[test]
    fn test_detect_is_consistent() {
        let env = EnvironmentInfo::detect();
        assert!(env.concurrency_support >= 1);
        assert_eq!(env.has_browser_api, env.platform == Platform::Browser);
    }

    #[tokio::test]
    async fn test_auto_terminates_when_selector_answers_auto() {
        let factory = factory(RepositoryStrategy::Auto).with_auto_selector(|_, _| RepositoryStrategy::Auto);
        assert_eq!(factory.resolve_strategy(RepositoryStrategy::Auto), RepositoryStrategy::Memory);
        let repo = factory.create().await.unwrap();
        assert_eq!(repo.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_factory_builds_every_backend() {
        for (strategy, name) in [
            (RepositoryStrategy::Memory, "memory"),
            (RepositoryStrategy::Indexed, "indexed"),
            (RepositoryStrategy::Worker, "worker"),
            (RepositoryStrategy::Hybrid, "hybrid"),
        ] {
            let repo = factory(strategy).create().await.unwrap();
            assert_eq!(repo.backend_name(), name);

            let pos = ChunkPosition::new(1, 2);
            repo.save(ChunkData::empty(pos)).await.unwrap();
            assert!(repo.exists_by_position(pos).await.unwrap());
            repo.flush().await.unwrap();
        }
    }
}
