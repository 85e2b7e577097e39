use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use chunkvault_benchmark::BenchmarkMetrics;
use chunkvault_query::{ChunkQueryRepository, HeatmapMetric};
use chunkvault_storage::chunk::blocks;
use chunkvault_storage::{
    BiomeType, ChunkBuilder, ChunkData, ChunkPosition, ChunkRegion, ChunkRepository, DurabilityLevel,
    PerformanceRequirements, RepositoryConfig, RepositoryFactory, RepositoryStrategy, RepositoryStrategySelector,
};

#[derive(Parser)]
#[command(name = "chunkvault", about = "Chunk persistence and query engine with pluggable storage backends")]
pub struct Args {
    /// Backend: "memory", "indexed", "worker", "hybrid" or "auto"
    #[arg(short, long, env = "STRATEGY", default_value = "auto")]
    pub strategy: RepositoryStrategy,

    /// PostgreSQL connection string for the indexed backend
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// SQLite file for the indexed backend (in-memory when unset)
    #[arg(long, env = "SQLITE_PATH")]
    pub sqlite_path: Option<PathBuf>,

    /// Query cache time-to-live
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "60")]
    pub cache_ttl_secs: u64,

    /// Hybrid replication queue capacity
    #[arg(long, env = "REPLICATION_QUEUE", default_value = "1024")]
    pub replication_queue: usize,

    /// Seed a (2r+1)^2 square of flat chunks around the origin
    #[arg(long, env = "SEED_RADIUS", default_value = "4")]
    pub seed_radius: i32,

    /// Require data to survive restarts (steers "auto")
    #[arg(long, env = "PERSISTENT")]
    pub persistent: bool,

    /// Attempts for backends that fail with a retryable error
    #[arg(long, env = "CONNECT_RETRIES", default_value = "5")]
    pub connect_retries: u32,
}

const BIOMES: [BiomeType; 4] = [BiomeType::Plains, BiomeType::Forest, BiomeType::Desert, BiomeType::Ocean];

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let environment = RepositoryStrategySelector::detect_environment();
    println!(
        "Environment: {:?}, memory {:?}, performance {:?}, {} threads",
        environment.platform, environment.memory_constraints, environment.performance_profile, environment.concurrency_support
    );

    let requirements = PerformanceRequirements {
        durability: if args.persistent { DurabilityLevel::Persistent } else { DurabilityLevel::Memory },
        ..Default::default()
    };
    let config = RepositoryConfig {
        strategy: args.strategy,
        database_url: args.database_url.clone(),
        sqlite_path: args.sqlite_path.clone(),
        replication_queue_capacity: args.replication_queue,
        requirements,
        ..Default::default()
    };

    let metrics = Arc::new(BenchmarkMetrics::new());
    let benchmark = std::env::var("BENCHMARK").is_ok();
    if benchmark {
        println!("BENCHMARK MODE ENABLED");
    }

    let factory = RepositoryFactory::new(config, environment, metrics.clone());
    let repo = connect(&factory, args.connect_retries).await?;
    println!("Storage backend: {}", repo.backend_name());

    // 1. Seed
    let seeded = seed(repo.as_ref(), args.seed_radius).await?;
    println!("Seeded {} chunks", seeded);

    // 2. Query
    let query = ChunkQueryRepository::with_ttl(repo.clone(), Duration::from_secs(args.cache_ttl_secs))
        .with_metrics(metrics.clone());
    run_queries(&query, args.seed_radius).await?;

    // 3. Housekeeping
    let report = repo.validate_integrity().await.context("integrity check")?;
    println!("Integrity: {} chunks checked, valid = {}", report.checked, report.is_valid);
    let evicted = repo.cleanup().await.context("cleanup")?;
    println!("Cleanup evicted {} idle chunks", evicted);
    repo.flush().await.context("flush replication")?;

    let stats = repo.get_statistics().await?;
    println!(
        "Statistics: {} chunks, {} bytes, hit rate {:.2}, {} operations",
        stats.total_chunks, stats.memory_usage_bytes, stats.cache_hit_rate, stats.total_operations
    );

    if benchmark {
        write_report(&metrics);
    }
    Ok(())
}

/// Build the configured backend, retrying while the failure is retryable
/// (e.g. the database is still starting).
async fn connect(factory: &RepositoryFactory, retries: u32) -> Result<Arc<dyn ChunkRepository>> {
    let mut attempt = 0;
    loop {
        match factory.create().await {
            Ok(repo) => return Ok(repo),
            Err(e) if e.is_retryable() && attempt + 1 < retries => {
                let delay = e.retry_delay(attempt);
                eprintln!("Failed to open storage: {}. Retrying {}/{} in {:?}...", e, attempt + 1, retries, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e).context("could not open chunk storage"),
        }
    }
}

async fn seed(repo: &dyn ChunkRepository, radius: i32) -> Result<usize> {
    let mut chunks = Vec::new();
    for (i, position) in ChunkRegion::around(ChunkPosition::new(0, 0), radius.max(0) as u32).positions().enumerate() {
        let mut builder = ChunkBuilder::flat();
        builder.biome(BIOMES[i % BIOMES.len()]);
        if position.x == position.z {
            builder.fill_layer(1, blocks::WATER);
        }
        chunks.push(builder.build(position));
    }
    // a lone chunk far from the rest
    let far = radius.saturating_mul(4).saturating_add(8);
    chunks.push(ChunkData::empty(ChunkPosition::new(far, far)));

    let outcome = repo.batch_save(chunks).await.context("seeding chunks")?;
    for failure in &outcome.failed {
        log::warn!("Seed: chunk {} rejected: {}", failure.item, failure.error);
    }
    Ok(outcome.successful.len())
}

async fn run_queries(query: &ChunkQueryRepository, radius: i32) -> Result<()> {
    let origin = ChunkPosition::new(0, 0);
    let r = radius.max(0) as u32;

    let nearby = query
        .measure_query_performance("radius", query.find_chunks_in_radius(origin, r))
        .await?;
    // second call is a cache hit
    query.find_chunks_in_radius(origin, r).await?;
    println!("Chunks within {} of {}: {}", r, origin, nearby.len());

    let deserts = query.find_chunks_by_biome(BiomeType::Desert).await?;
    println!("Desert chunks: {}", deserts.len());

    let analytics = query.measure_query_performance("analytics", query.get_chunk_analytics()).await?;
    println!(
        "Analytics: {} chunks in {} regions, avg size {:.0} bytes",
        analytics.statistics.total_chunks, analytics.region_count, analytics.average_size_bytes
    );
    for region in query.get_region_analytics().await?.iter() {
        println!(
            "  region ({}, {}): {} chunks, {} bytes",
            region.region_x, region.region_z, region.chunk_count, region.memory_bytes
        );
    }

    let heatmap = query
        .generate_heatmap(ChunkRegion::around(origin, r), HeatmapMetric::Size)
        .await?;
    println!("Size heatmap range: {:.0} .. {:.0} bytes", heatmap.min, heatmap.max);

    let orphans = query.find_orphaned_chunks().await?;
    println!("Orphaned chunks: {}", orphans.len());
    let candidates = query.find_optimization_candidates().await?;
    println!("Optimization candidates: {}", candidates.len());
    let pressure = query.find_memory_pressure_causes().await?;
    println!("Memory pressure causes: {}", pressure.len());

    if let Ok(hood) = query.get_chunk_neighborhood(origin).await {
        println!("Neighbors of {}: {}", origin, hood.neighbors.len());
    }

    let perf = query.get_query_performance_metrics();
    println!(
        "Measured {} queries, avg {:?}, slowest {:?}",
        perf.samples, perf.average_duration, perf.slowest_query
    );
    Ok(())
}

fn write_report(metrics: &BenchmarkMetrics) {
    let report = metrics.generate_report();
    let timestamp = unix_timestamp();

    // Ensure benchmarks directory exists
    if let Err(e) = std::fs::create_dir_all("benchmarks") {
        eprintln!("Failed to create benchmarks directory: {}", e);
    }

    let filename = format!("benchmarks/benchmark-{}.txt", timestamp);
    if let Err(e) = std::fs::write(&filename, &report) {
        eprintln!("Failed to write benchmark report: {}", e);
    } else {
        println!("Benchmark report written to {}", filename);
        println!("{}", report);
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
