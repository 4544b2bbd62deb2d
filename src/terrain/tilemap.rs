//! Tile map worlds: one atlas-textured quad per non-empty tile

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use noise::{NoiseFn, Perlin};

use crate::core::types::{UVec2, Vec2};
use crate::core::{Error, Result};
use crate::gpu::VertexFormat;
use crate::streaming::{ChunkCoord, ChunkGrid, ChunkMesher, MeshData, MeshInput, StreamableGrid, Vertex};

pub type TileId = u16;

/// Tile that produces no geometry
pub const EMPTY_TILE: TileId = 0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TileVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub color: [u8; 4],
}

impl Vertex for TileVertex {
    const FORMAT: VertexFormat = VertexFormat::PosUvColor;
}

/// Emits a quad per non-empty tile, textured from a square atlas
pub struct TileMapMesher {
    /// Atlas cells per row and column
    atlas_columns: u32,
    /// Tint per tile id, cycled
    palette: Vec<[u8; 4]>,
}

impl TileMapMesher {
    pub fn new(atlas_columns: u32) -> Self {
        Self {
            atlas_columns: atlas_columns.max(1),
            palette: vec![[255, 255, 255, 255]],
        }
    }

    pub fn with_palette(mut self, palette: Vec<[u8; 4]>) -> Self {
        if !palette.is_empty() {
            self.palette = palette;
        }
        self
    }

    /// Atlas rectangle (min, max) of a tile id
    pub fn atlas_uv(&self, id: TileId) -> (Vec2, Vec2) {
        let index = u32::from(id.saturating_sub(1)) % (self.atlas_columns * self.atlas_columns);
        let cell = 1.0 / self.atlas_columns as f32;
        let min = Vec2::new((index % self.atlas_columns) as f32, (index / self.atlas_columns) as f32) * cell;
        (min, min + Vec2::splat(cell))
    }

    fn tint(&self, id: TileId) -> [u8; 4] {
        self.palette[usize::from(id) % self.palette.len()]
    }
}

impl ChunkMesher<TileId> for TileMapMesher {
    fn build_mesh(&self, input: &MeshInput<TileId>) -> Result<MeshData> {
        let filled = input.tiles.iter().filter(|&&id| id != EMPTY_TILE).count();
        let mut vertices = Vec::with_capacity(filled * 4);
        let mut indices = Vec::with_capacity(filled * 6);

        for y in 0..input.chunk_size.y {
            for x in 0..input.chunk_size.x {
                let Some(&id) = input.tile(x, y) else {
                    continue;
                };
                if id == EMPTY_TILE {
                    continue;
                }

                let min = input.origin + Vec2::new(x as f32, y as f32) * input.tile_size;
                let max = min + input.tile_size;
                let (uv_min, uv_max) = self.atlas_uv(id);
                let color = self.tint(id);
                let base = vertices.len() as u32;

                for (px, py, u, v) in [
                    (min.x, min.y, uv_min.x, uv_max.y),
                    (max.x, min.y, uv_max.x, uv_max.y),
                    (max.x, max.y, uv_max.x, uv_min.y),
                    (min.x, max.y, uv_min.x, uv_min.y),
                ] {
                    vertices.push(TileVertex {
                        position: [px, py, 0.0],
                        uv: [u, v],
                        color,
                    });
                }
                indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
            }
        }

        MeshData::from_vertices(&vertices, indices)
    }
}

/// Streamable tile map generated from Perlin noise.
///
/// Noise below `fill_threshold` leaves a tile empty; the rest is bucketed
/// into `tile_kinds` ids starting at 1.
pub struct TileMapGrid {
    chunks: ChunkGrid<TileId>,
    mesher: Arc<TileMapMesher>,
    noise: Perlin,
    scale: f64,
    fill_threshold: f64,
    tile_kinds: u16,
}

impl TileMapGrid {
    pub fn new(seed: u32, chunk_tiles: u32, tile_size: f32, tile_kinds: u16) -> Result<Self> {
        let tile_kinds = tile_kinds.max(1);
        let columns = (f32::from(tile_kinds)).sqrt().ceil() as u32;
        Ok(Self {
            chunks: ChunkGrid::new(UVec2::splat(chunk_tiles), Vec2::splat(tile_size))?,
            mesher: Arc::new(TileMapMesher::new(columns)),
            noise: Perlin::new(seed),
            scale: 0.05,
            fill_threshold: -0.1,
            tile_kinds,
        })
    }

    pub fn with_mesher(mut self, mesher: TileMapMesher) -> Self {
        self.mesher = Arc::new(mesher);
        self
    }

    fn tile_for_noise(&self, value: f64) -> TileId {
        if value < self.fill_threshold {
            return EMPTY_TILE;
        }
        let t = ((value - self.fill_threshold) / (1.0 - self.fill_threshold)).clamp(0.0, 0.999_999);
        1 + (t * f64::from(self.tile_kinds)) as TileId
    }

    /// Tile at a world position, if its chunk exists
    pub fn tile_at(&self, pos: Vec2) -> Option<TileId> {
        let (coord, index) = self.locate(pos);
        self.chunks.get_chunk(coord)?.tiles().get(index).copied()
    }

    /// Overwrite one tile. The chunk's meshes are rebuilt while it is in range.
    pub fn set_tile(&mut self, pos: Vec2, id: TileId) -> Result<()> {
        let (coord, index) = self.locate(pos);
        let chunk = self
            .chunks
            .get_chunk(coord)
            .ok_or_else(|| Error::generation(coord, "tile edit on a chunk that does not exist"))?;

        let mut tiles = chunk.tiles().to_vec();
        if tiles[index] == id {
            return Ok(());
        }
        tiles[index] = id;
        self.chunks.set_tiles(coord, tiles)
    }

    fn locate(&self, pos: Vec2) -> (ChunkCoord, usize) {
        let coord = self.chunks.chunk_at(pos);
        let size = self.chunks.chunk_size();
        let local = ((pos - coord.world_origin(self.chunks.chunk_world_size())) / self.chunks.tile_size())
            .floor()
            .as_uvec2()
            .min(size - UVec2::ONE);
        (coord, (local.y * size.x + local.x) as usize)
    }
}

impl StreamableGrid for TileMapGrid {
    type Tile = TileId;

    fn chunks(&self) -> &ChunkGrid<TileId> {
        &self.chunks
    }

    fn chunks_mut(&mut self) -> &mut ChunkGrid<TileId> {
        &mut self.chunks
    }

    fn mesher(&self) -> Arc<dyn ChunkMesher<TileId>> {
        self.mesher.clone()
    }

    fn generate_chunk_data(&mut self, coord: ChunkCoord) -> Result<Vec<TileId>> {
        let size = self.chunks.chunk_size();
        let tile_size = self.chunks.tile_size();
        let origin = coord.world_origin(self.chunks.chunk_world_size());

        let mut tiles = Vec::with_capacity(self.chunks.tiles_per_chunk());
        for y in 0..size.y {
            for x in 0..size.x {
                // Sample at tile centers
                let pos = origin + (Vec2::new(x as f32, y as f32) + 0.5) * tile_size;
                let value = self.noise.get([pos.x as f64 * self.scale, pos.y as f64 * self.scale]);
                tiles.push(self.tile_for_noise(value));
            }
        }
        Ok(tiles)
    }
}
