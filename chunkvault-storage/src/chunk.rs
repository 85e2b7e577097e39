//! Chunk aggregate and coordinates.
//!
//! A chunk is a 16x384x16 column of blocks spanning world Y -64..320.
//! Blocks are stored densely, Y-major: index = ((y - MIN_Y) * 16 + z) * 16 + x.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};

pub const CHUNK_SIZE: usize = 16;
pub const CHUNK_HEIGHT: usize = 384;
pub const MIN_Y: i32 = -64;
pub const MAX_Y: i32 = MIN_Y + CHUNK_HEIGHT as i32 - 1;
pub const CHUNK_VOLUME: usize = CHUNK_SIZE * CHUNK_HEIGHT * CHUNK_SIZE;
pub const HEIGHT_MAP_LEN: usize = CHUNK_SIZE * CHUNK_SIZE;

/// Number of chunks per anvil region dimension.
pub const REGION_SIZE: i32 = 32;

pub type BlockId = u16;

/// Block ids known to the storage layer. Anything else is opaque.
pub mod blocks {
    use super::BlockId;

    pub const AIR: BlockId = 0;
    pub const STONE: BlockId = 1;
    pub const DIRT: BlockId = 2;
    pub const GRASS: BlockId = 3;
    pub const BEDROCK: BlockId = 4;
    pub const WATER: BlockId = 5;
    pub const SAND: BlockId = 6;
}

/// Coordinates for a chunk in the world.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub x: i32,
    pub z: i32,
}

impl ChunkPosition {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Storage key, `"x,z"`.
    pub fn key(&self) -> String {
        format!("{},{}", self.x, self.z)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let (x, z) = key.split_once(',')?;
        Some(Self::new(x.trim().parse().ok()?, z.trim().parse().ok()?))
    }

    /// Anvil region containing this chunk.
    pub fn region(&self) -> (i32, i32) {
        (self.x.div_euclid(REGION_SIZE), self.z.div_euclid(REGION_SIZE))
    }

    /// Saturates at the edge of the coordinate range.
    pub fn offset(&self, dx: i32, dz: i32) -> Self {
        Self::new(self.x.saturating_add(dx), self.z.saturating_add(dz))
    }

    /// Euclidean distance in chunk units.
    pub fn distance_to(&self, other: &ChunkPosition) -> f64 {
        let dx = (i64::from(self.x) - i64::from(other.x)) as f64;
        let dz = (i64::from(self.z) - i64::from(other.z)) as f64;
        (dx * dx + dz * dz).sqrt()
    }
}

impl fmt::Display for ChunkPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// String identity of a chunk, `chunk_{x}_{z}`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn for_position(position: ChunkPosition) -> Self {
        Self(format!("chunk_{}_{}", position.x, position.z))
    }

    /// The position this id refers to, or `None` for ids we did not mint.
    pub fn position(&self) -> Option<ChunkPosition> {
        let coords = self.0.strip_prefix("chunk_")?;
        let (x, z) = coords.split_once('_')?;
        Some(ChunkPosition::new(x.parse().ok()?, z.parse().ok()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ChunkPosition> for ChunkId {
    fn from(position: ChunkPosition) -> Self {
        Self::for_position(position)
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiomeType {
    Plains,
    Forest,
    Desert,
    Mountains,
    Ocean,
    Tundra,
    Swamp,
    Jungle,
}

impl BiomeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiomeType::Plains => "plains",
            BiomeType::Forest => "forest",
            BiomeType::Desert => "desert",
            BiomeType::Mountains => "mountains",
            BiomeType::Ocean => "ocean",
            BiomeType::Tundra => "tundra",
            BiomeType::Swamp => "swamp",
            BiomeType::Jungle => "jungle",
        }
    }
}

impl fmt::Display for BiomeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub biome: BiomeType,
    pub light_level: u8,
    /// Highest non-air Y per column, `x + z * 16`. `MIN_Y - 1` for empty columns.
    pub height_map: Vec<i32>,
    /// Milliseconds since the Unix epoch.
    pub last_update: i64,
}

impl Default for ChunkMetadata {
    fn default() -> Self {
        Self {
            biome: BiomeType::Plains,
            light_level: 15,
            height_map: vec![MIN_Y - 1; HEIGHT_MAP_LEN],
            last_update: Utc::now().timestamp_millis(),
        }
    }
}

/// The chunk aggregate. Mutators consume the value and hand back a new one,
/// so a chunk read out of a repository never changes under the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    pub position: ChunkPosition,
    pub blocks: Vec<BlockId>,
    pub metadata: ChunkMetadata,
    pub is_dirty: bool,
}

impl ChunkData {
    /// An all-air chunk.
    pub fn empty(position: ChunkPosition) -> Self {
        Self {
            position,
            blocks: vec![blocks::AIR; CHUNK_VOLUME],
            metadata: ChunkMetadata::default(),
            is_dirty: false,
        }
    }

    pub fn id(&self) -> ChunkId {
        ChunkId::for_position(self.position)
    }

    pub fn block_index(x: usize, y: i32, z: usize) -> Option<usize> {
        if x >= CHUNK_SIZE || z >= CHUNK_SIZE || !(MIN_Y..=MAX_Y).contains(&y) {
            return None;
        }
        let ly = (y - MIN_Y) as usize;
        Some((ly * CHUNK_SIZE + z) * CHUNK_SIZE + x)
    }

    pub fn get_block(&self, x: usize, y: i32, z: usize) -> Option<BlockId> {
        Self::block_index(x, y, z).and_then(|i| self.blocks.get(i).copied())
    }

    /// Returns a copy with one block replaced. Out of range coordinates leave
    /// the chunk untouched.
    pub fn with_block(mut self, x: usize, y: i32, z: usize, block: BlockId) -> Self {
        let Some(index) = Self::block_index(x, y, z) else {
            return self;
        };
        if index >= self.blocks.len() {
            return self;
        }
        self.blocks[index] = block;
        let column = x + z * CHUNK_SIZE;
        if let Some(height) = self.metadata.height_map.get_mut(column) {
            if block != blocks::AIR && y > *height {
                *height = y;
            } else if block == blocks::AIR && y == *height {
                *height = column_height(&self.blocks, x, z);
            }
        }
        self.metadata.last_update = Utc::now().timestamp_millis();
        self.is_dirty = true;
        self
    }

    pub fn with_biome(mut self, biome: BiomeType) -> Self {
        self.metadata.biome = biome;
        self
    }

    pub fn mark_clean(mut self) -> Self {
        self.is_dirty = false;
        self
    }

    pub fn mark_dirty(mut self) -> Self {
        self.is_dirty = true;
        self
    }

    pub fn contains_block(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }

    /// True when every block is the same id (all air, all stone, ...).
    pub fn is_uniform(&self) -> bool {
        match self.blocks.first() {
            Some(first) => self.blocks.iter().all(|b| b == first),
            None => true,
        }
    }

    pub fn non_air_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| **b != blocks::AIR).count()
    }

    /// Serialized JSON length, used as a size proxy everywhere.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }

    /// Structural checks applied before anything is stored.
    pub fn validate(&self) -> Result<()> {
        if self.blocks.len() != CHUNK_VOLUME {
            return Err(RepositoryError::validation(
                "blocks",
                self.blocks.len().to_string(),
                format!("must contain exactly {} blocks", CHUNK_VOLUME),
            ));
        }
        if self.metadata.height_map.len() != HEIGHT_MAP_LEN {
            return Err(RepositoryError::validation(
                "metadata.height_map",
                self.metadata.height_map.len().to_string(),
                format!("must contain exactly {} columns", HEIGHT_MAP_LEN),
            ));
        }
        if self.metadata.light_level > 15 {
            return Err(RepositoryError::validation(
                "metadata.light_level",
                self.metadata.light_level.to_string(),
                "must be between 0 and 15",
            ));
        }
        Ok(())
    }
}

fn column_height(blocks: &[BlockId], x: usize, z: usize) -> i32 {
    (MIN_Y..=MAX_Y)
        .rev()
        .find(|y| {
            ChunkData::block_index(x, *y, z)
                .and_then(|i| blocks.get(i))
                .is_some_and(|b| *b != blocks::AIR)
        })
        .unwrap_or(MIN_Y - 1)
}

/// Inclusive rectangle of chunk positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRegion {
    pub min_x: i32,
    pub max_x: i32,
    pub min_z: i32,
    pub max_z: i32,
}

impl ChunkRegion {
    pub fn new(min_x: i32, max_x: i32, min_z: i32, max_z: i32) -> Self {
        Self { min_x, max_x, min_z, max_z }
    }

    /// Square of side `2 * radius + 1` centered on `center`, clipped to the
    /// coordinate range.
    pub fn around(center: ChunkPosition, radius: u32) -> Self {
        let clip = |v: i64| v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        let r = i64::from(radius);
        let (x, z) = (i64::from(center.x), i64::from(center.z));
        Self::new(clip(x - r), clip(x + r), clip(z - r), clip(z + r))
    }

    /// The 32x32 chunks of an anvil region.
    /// Region 0,0 -> chunks 0..31, region -1,-1 -> chunks -32..-1.
    pub fn for_anvil_region(region_x: i32, region_z: i32) -> Self {
        let min_x = region_x.saturating_mul(REGION_SIZE);
        let min_z = region_z.saturating_mul(REGION_SIZE);
        Self::new(
            min_x,
            min_x.saturating_add(REGION_SIZE - 1),
            min_z,
            min_z.saturating_add(REGION_SIZE - 1),
        )
    }

    pub fn contains(&self, position: &ChunkPosition) -> bool {
        (self.min_x..=self.max_x).contains(&position.x) && (self.min_z..=self.max_z).contains(&position.z)
    }

    pub fn width(&self) -> u64 {
        span(self.min_x, self.max_x)
    }

    pub fn depth(&self) -> u64 {
        span(self.min_z, self.max_z)
    }

    /// Number of positions covered; `width * depth` can exceed `u32`.
    pub fn area(&self) -> u64 {
        self.width().saturating_mul(self.depth())
    }

    pub fn positions(&self) -> impl Iterator<Item = ChunkPosition> + '_ {
        (self.min_z..=self.max_z).flat_map(move |z| (self.min_x..=self.max_x).map(move |x| ChunkPosition::new(x, z)))
    }
}

fn span(min: i32, max: i32) -> u64 {
    (i64::from(max) - i64::from(min) + 1).max(0) as u64
}

/// Builds chunks layer by layer. Handy for tests and seeding.
#[derive(Default)]
pub struct ChunkBuilder {
    // Key: (x, y, z), Value: block
    custom_blocks: HashMap<(u8, i32, u8), BlockId>,
    // Key: y, Value: block for the whole 16x16 layer
    full_layers: HashMap<i32, BlockId>,
    biome: Option<BiomeType>,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bedrock floor, stone, dirt, grass at Y=0.
    pub fn flat() -> Self {
        let mut builder = Self::new();
        builder.fill_layer(MIN_Y, blocks::BEDROCK);
        for y in (MIN_Y + 1)..-4 {
            builder.fill_layer(y, blocks::STONE);
        }
        for y in -4..=-1 {
            builder.fill_layer(y, blocks::DIRT);
        }
        builder.fill_layer(0, blocks::GRASS);
        builder
    }

    /// Set a single block at chunk-local coordinates (x: 0..15, z: 0..15)
    pub fn set_block(&mut self, x: u8, y: i32, z: u8, block: BlockId) -> &mut Self {
        if (x as usize) < CHUNK_SIZE && (z as usize) < CHUNK_SIZE {
            self.custom_blocks.insert((x, y, z), block);
        }
        self
    }

    /// Fill an entire Y-layer with a block
    pub fn fill_layer(&mut self, y: i32, block: BlockId) -> &mut Self {
        self.full_layers.insert(y, block);
        // individual blocks at this Y are overwritten
        self.custom_blocks.retain(|(_, by, _), _| *by != y);
        self
    }

    pub fn biome(&mut self, biome: BiomeType) -> &mut Self {
        self.biome = Some(biome);
        self
    }

    pub fn build(&self, position: ChunkPosition) -> ChunkData {
        let mut blocks = vec![blocks::AIR; CHUNK_VOLUME];

        for (y, block) in &self.full_layers {
            for z in 0..CHUNK_SIZE {
                for x in 0..CHUNK_SIZE {
                    if let Some(i) = ChunkData::block_index(x, *y, z) {
                        blocks[i] = *block;
                    }
                }
            }
        }
        for ((x, y, z), block) in &self.custom_blocks {
            if let Some(i) = ChunkData::block_index(*x as usize, *y, *z as usize) {
                blocks[i] = *block;
            }
        }

        let mut height_map = Vec::with_capacity(HEIGHT_MAP_LEN);
        for z in 0..CHUNK_SIZE {
            for x in 0..CHUNK_SIZE {
                height_map.push(column_height(&blocks, x, z));
            }
        }

        ChunkData {
            position,
            blocks,
            metadata: ChunkMetadata {
                biome: self.biome.unwrap_or(BiomeType::Plains),
                light_level: 15,
                height_map,
                last_update: Utc::now().timestamp_millis(),
            },
            is_dirty: false,
        }
    }
}
