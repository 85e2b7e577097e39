//! CQRS entry points. Both handlers translate a message into repository
//! calls and add nothing but the not-found case for single-chunk lookups.

use std::sync::Arc;

use chunkvault_storage::{
    ChunkData, ChunkId, ChunkPosition, ChunkRegion, ChunkRepository, RepositoryError, RepositoryStatistics, Result,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChunkCommand {
    /// At least one of the two must be set. `position` wins when both are.
    LoadChunk {
        chunk_id: Option<ChunkId>,
        position: Option<ChunkPosition>,
    },
    SaveChunk {
        chunk: ChunkData,
    },
    UnloadChunk {
        chunk_id: ChunkId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Loaded(ChunkData),
    Saved(ChunkPosition),
    Unloaded(ChunkId),
}

pub struct ChunkCommandHandler {
    repository: Arc<dyn ChunkRepository>,
}

impl ChunkCommandHandler {
    pub fn new(repository: Arc<dyn ChunkRepository>) -> Self {
        Self { repository }
    }

    pub async fn handle(&self, command: ChunkCommand) -> Result<CommandOutcome> {
        match command {
            ChunkCommand::LoadChunk { chunk_id, position } => {
                let target = position.or_else(|| chunk_id.as_ref().and_then(ChunkId::position));
                let found = match target {
                    Some(target) => self.repository.find_by_position(target).await?,
                    None => None,
                };
                found
                    .map(CommandOutcome::Loaded)
                    .ok_or_else(|| RepositoryError::not_found(chunk_id, position))
            }
            ChunkCommand::SaveChunk { chunk } => {
                let position = chunk.position;
                self.repository.save(chunk).await?;
                Ok(CommandOutcome::Saved(position))
            }
            ChunkCommand::UnloadChunk { chunk_id } => {
                self.repository.delete(&chunk_id).await?;
                Ok(CommandOutcome::Unloaded(chunk_id))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChunkQueryMessage {
    GetChunkById(ChunkId),
    GetChunkByPosition(ChunkPosition),
    ListChunksInRegion(ChunkRegion),
    GetChunkStatistics,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Chunk(ChunkData),
    Chunks(Vec<ChunkData>),
    Statistics(RepositoryStatistics),
}

pub struct ChunkQueryHandler {
    repository: Arc<dyn ChunkRepository>,
}

impl ChunkQueryHandler {
    pub fn new(repository: Arc<dyn ChunkRepository>) -> Self {
        Self { repository }
    }

    pub async fn execute(&self, query: ChunkQueryMessage) -> Result<QueryOutcome> {
        match query {
            ChunkQueryMessage::GetChunkById(id) => match self.repository.find_by_id(&id).await? {
                Some(chunk) => Ok(QueryOutcome::Chunk(chunk)),
                None => Err(RepositoryError::not_found_id(id)),
            },
            ChunkQueryMessage::GetChunkByPosition(position) => {
                match self.repository.find_by_position(position).await? {
                    Some(chunk) => Ok(QueryOutcome::Chunk(chunk)),
                    None => Err(RepositoryError::not_found_position(position)),
                }
            }
            ChunkQueryMessage::ListChunksInRegion(region) => {
                Ok(QueryOutcome::Chunks(self.repository.find_by_region(region).await?))
            }
            ChunkQueryMessage::GetChunkStatistics => {
                Ok(QueryOutcome::Statistics(self.repository.get_statistics().await?))
            }
        }
    }
}
