//! Memory-first repository with background persistence.
//!
//! Reads only ever hit the fast repository. Writes land on the fast side
//! first and are then queued for the persistent side, where a single task
//! replays them in order. A replication failure is logged and counted, never
//! returned to the caller and never rolled back on the fast side.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chunkvault_benchmark::BenchmarkMetrics;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::chunk::{ChunkData, ChunkId, ChunkPosition, ChunkRegion};
use crate::error::Result;
use crate::types::{BatchOutcome, ChunkEntry, ChunkQuery, IntegrityReport, RepositoryStatistics};
use crate::ChunkRepository;

pub const DEFAULT_REPLICATION_QUEUE: usize = 1024;

enum Replication {
    Save(ChunkData),
    SaveAll(Vec<ChunkData>),
    Delete(ChunkId),
    DeleteByPosition(ChunkPosition),
    DeleteAll(Vec<ChunkId>),
    Initialize,
    Clear,
    ClearCache,
    Cleanup,
}

enum Queued {
    Op(Replication),
    /// Answered once everything queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

impl Replication {
    fn name(&self) -> &'static str {
        match self {
            Replication::Save(_) => "save",
            Replication::SaveAll(_) => "save_all",
            Replication::Delete(_) => "delete",
            Replication::DeleteByPosition(_) => "delete_by_position",
            Replication::DeleteAll(_) => "delete_all",
            Replication::Initialize => "initialize",
            Replication::Clear => "clear",
            Replication::ClearCache => "clear_cache",
            Replication::Cleanup => "cleanup",
        }
    }

    async fn apply(self, target: &dyn ChunkRepository) -> Result<()> {
        match self {
            Replication::Save(chunk) => target.save(chunk).await,
            Replication::SaveAll(chunks) => target.save_all(chunks).await,
            Replication::Delete(id) => target.delete(&id).await,
            Replication::DeleteByPosition(position) => target.delete_by_position(position).await,
            Replication::DeleteAll(ids) => target.delete_all(&ids).await,
            Replication::Initialize => target.initialize().await,
            Replication::Clear => target.clear().await,
            Replication::ClearCache => target.clear_cache().await,
            Replication::Cleanup => target.cleanup().await.map(|_| ()),
        }
    }
}

pub struct HybridChunkRepository {
    fast: Arc<dyn ChunkRepository>,
    replicator: mpsc::Sender<Queued>,
    metrics: Arc<BenchmarkMetrics>,
}

impl HybridChunkRepository {
    /// Spawns the replication task, so this must run inside a tokio runtime.
    pub fn new(
        fast: Arc<dyn ChunkRepository>,
        persistent: Arc<dyn ChunkRepository>,
        metrics: Arc<BenchmarkMetrics>,
    ) -> Self {
        Self::with_queue_capacity(fast, persistent, metrics, DEFAULT_REPLICATION_QUEUE)
    }

    pub fn with_queue_capacity(
        fast: Arc<dyn ChunkRepository>,
        persistent: Arc<dyn ChunkRepository>,
        metrics: Arc<BenchmarkMetrics>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        log::info!(
            "Hybrid: reads from {}, replicating writes to {} (queue {})",
            fast.backend_name(),
            persistent.backend_name(),
            capacity.max(1)
        );
        // The task lives until every sender is gone, i.e. until this repository is dropped.
        tokio::spawn(run_replication(persistent, rx, metrics.clone()));
        Self { fast, replicator: tx, metrics }
    }

    pub fn metrics(&self) -> &Arc<BenchmarkMetrics> {
        &self.metrics
    }

    fn replicate(&self, op: Replication) {
        let name = op.name();
        match self.replicator.try_send(Queued::Op(op)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_replication_dropped();
                log::warn!("Hybrid: replication queue full, dropping {}", name);
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_replication_dropped();
                log::warn!("Hybrid: replication task gone, dropping {}", name);
            }
        }
    }
}

async fn run_replication(
    persistent: Arc<dyn ChunkRepository>,
    mut rx: mpsc::Receiver<Queued>,
    metrics: Arc<BenchmarkMetrics>,
) {
    while let Some(queued) = rx.recv().await {
        let op = match queued {
            Queued::Op(op) => op,
            Queued::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let name = op.name();
        let start = Instant::now();
        match op.apply(persistent.as_ref()).await {
            Ok(()) => {
                metrics.record_replication(start.elapsed());
                log::debug!("Hybrid: replicated {} to {}", name, persistent.backend_name());
            }
            Err(e) => {
                metrics.record_replication_failure();
                log::warn!("Hybrid: {} on {} failed: {}", name, persistent.backend_name(), e);
            }
        }
    }
    log::debug!("Hybrid: replication queue closed");
}

#[async_trait]
impl ChunkRepository for HybridChunkRepository {
    fn backend_name(&self) -> &'static str {
        "hybrid"
    }

    async fn find_by_id(&self, id: &ChunkId) -> Result<Option<ChunkData>> {
        let start = Instant::now();
        let found = self.fast.find_by_id(id).await?;
        if found.is_some() {
            self.metrics.record_load(start.elapsed());
        }
        Ok(found)
    }

    async fn find_by_position(&self, position: ChunkPosition) -> Result<Option<ChunkData>> {
        let start = Instant::now();
        let found = self.fast.find_by_position(position).await?;
        if found.is_some() {
            self.metrics.record_load(start.elapsed());
        }
        Ok(found)
    }

    async fn find_by_region(&self, region: ChunkRegion) -> Result<Vec<ChunkData>> {
        self.fast.find_by_region(region).await
    }

    async fn find_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<ChunkData>> {
        self.fast.find_by_ids(ids).await
    }

    async fn find_by_positions(&self, positions: &[ChunkPosition]) -> Result<Vec<ChunkData>> {
        self.fast.find_by_positions(positions).await
    }

    async fn save(&self, chunk: ChunkData) -> Result<()> {
        let start = Instant::now();
        self.fast.save(chunk.clone()).await?;
        self.metrics.record_save(start.elapsed());
        self.replicate(Replication::Save(chunk));
        Ok(())
    }

    async fn save_all(&self, chunks: Vec<ChunkData>) -> Result<()> {
        self.fast.save_all(chunks.clone()).await?;
        self.replicate(Replication::SaveAll(chunks));
        Ok(())
    }

    async fn delete(&self, id: &ChunkId) -> Result<()> {
        self.fast.delete(id).await?;
        self.replicate(Replication::Delete(id.clone()));
        Ok(())
    }

    async fn delete_by_position(&self, position: ChunkPosition) -> Result<()> {
        self.fast.delete_by_position(position).await?;
        self.replicate(Replication::DeleteByPosition(position));
        Ok(())
    }

    async fn delete_all(&self, ids: &[ChunkId]) -> Result<()> {
        self.fast.delete_all(ids).await?;
        self.replicate(Replication::DeleteAll(ids.to_vec()));
        Ok(())
    }

    async fn exists(&self, id: &ChunkId) -> Result<bool> {
        self.fast.exists(id).await
    }

    async fn exists_by_position(&self, position: ChunkPosition) -> Result<bool> {
        self.fast.exists_by_position(position).await
    }

    async fn count(&self) -> Result<usize> {
        self.fast.count().await
    }

    async fn count_by_region(&self, region: ChunkRegion) -> Result<usize> {
        self.fast.count_by_region(region).await
    }

    async fn find_entries(&self, query: &ChunkQuery) -> Result<Vec<ChunkEntry>> {
        self.fast.find_entries(query).await
    }

    async fn find_recently_loaded(&self, limit: usize) -> Result<Vec<ChunkData>> {
        self.fast.find_recently_loaded(limit).await
    }

    async fn find_modified(&self) -> Result<Vec<ChunkData>> {
        self.fast.find_modified().await
    }

    async fn get_statistics(&self) -> Result<RepositoryStatistics> {
        self.fast.get_statistics().await
    }

    async fn memory_usage_bytes(&self) -> Result<u64> {
        self.fast.memory_usage_bytes().await
    }

    async fn batch_save(&self, chunks: Vec<ChunkData>) -> Result<BatchOutcome<ChunkPosition>> {
        let outcome = self.fast.batch_save(chunks.clone()).await?;
        // only what the fast side accepted goes to the persistent side
        let accepted: Vec<ChunkData> = chunks
            .into_iter()
            .filter(|c| outcome.successful.contains(&c.position))
            .collect();
        if !accepted.is_empty() {
            self.replicate(Replication::SaveAll(accepted));
        }
        Ok(outcome)
    }

    async fn batch_delete(&self, ids: Vec<ChunkId>) -> Result<BatchOutcome<ChunkId>> {
        let outcome = self.fast.batch_delete(ids).await?;
        if !outcome.successful.is_empty() {
            self.replicate(Replication::DeleteAll(outcome.successful.clone()));
        }
        Ok(outcome)
    }

    async fn initialize(&self) -> Result<()> {
        self.fast.initialize().await?;
        self.replicate(Replication::Initialize);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.fast.clear().await?;
        self.replicate(Replication::Clear);
        Ok(())
    }

    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        self.fast.validate_integrity().await
    }

    async fn clear_cache(&self) -> Result<()> {
        self.fast.clear_cache().await?;
        self.replicate(Replication::ClearCache);
        Ok(())
    }

    async fn cleanup(&self) -> Result<usize> {
        let evicted = self.fast.cleanup().await?;
        self.replicate(Replication::Cleanup);
        Ok(evicted)
    }

    async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.replicator.send(Queued::Flush(done_tx)).await.is_err() {
            log::warn!("Hybrid: replication task gone, nothing to flush");
            return Ok(());
        }
        if done_rx.await.is_err() {
            log::warn!("Hybrid: replication task stopped before the flush completed");
        }
        Ok(())
    }
}
