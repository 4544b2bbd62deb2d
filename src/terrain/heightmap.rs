//! Heightfield terrain: one height per tile corner, meshed as a lit surface

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::generator::{TerrainGenerator, TerrainParams};
use crate::core::types::{UVec2, Vec2, Vec3};
use crate::core::Result;
use crate::gpu::VertexFormat;
use crate::streaming::{ChunkCoord, ChunkGrid, ChunkMesher, MeshData, MeshInput, StreamableGrid, Vertex};

/// Vertex layout of terrain meshes
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
    pub color: [u8; 4],
}

impl Vertex for TerrainVertex {
    const FORMAT: VertexFormat = VertexFormat::PosUvNormalColor;
}

/// Color band for a height relative to sea level
fn height_color(height: f32, params: &TerrainParams) -> [u8; 4] {
    let above = height - params.sea_level;
    let peak = (params.height_scale - params.sea_level).max(1.0);
    match above / peak {
        f if f < 0.0 => [30, 80, 150, 255],   // water
        f if f < 0.05 => [238, 214, 175, 255], // sand
        f if f < 0.5 => [100, 180, 80, 255],   // grass
        f if f < 0.8 => [120, 120, 120, 255],  // rock
        _ => [240, 248, 255, 255],             // snow
    }
}

/// Meshes height tiles into a triangle grid.
///
/// A chunk of `n` x `n` tiles yields `(n + 1)^2` vertices; the far edge
/// and the normals at the borders come from the generator so neighbouring
/// chunks meet without seams.
pub struct HeightmapMesher {
    generator: Arc<TerrainGenerator>,
}

impl HeightmapMesher {
    pub fn new(generator: Arc<TerrainGenerator>) -> Self {
        Self { generator }
    }

    fn height(&self, input: &MeshInput<f32>, x: i64, y: i64) -> f32 {
        let inside = x >= 0 && y >= 0 && x < input.chunk_size.x as i64 && y < input.chunk_size.y as i64;
        if inside {
            if let Some(h) = input.tile(x as u32, y as u32) {
                return *h;
            }
        }
        let pos = input.origin + Vec2::new(x as f32, y as f32) * input.tile_size;
        self.generator.height_at(pos)
    }
}

impl ChunkMesher<f32> for HeightmapMesher {
    fn build_mesh(&self, input: &MeshInput<f32>) -> Result<MeshData> {
        let size = input.chunk_size;
        let (w, h) = (size.x as i64 + 1, size.y as i64 + 1);
        let params = self.generator.params();

        let mut vertices = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let height = self.height(input, x, y);
                let pos = input.origin + Vec2::new(x as f32, y as f32) * input.tile_size;

                let dx = self.height(input, x + 1, y) - self.height(input, x - 1, y);
                let dy = self.height(input, x, y + 1) - self.height(input, x, y - 1);
                let normal = Vec3::new(-dx, 2.0 * input.tile_size.x, -dy)
                    .try_normalize()
                    .unwrap_or(Vec3::Y);

                vertices.push(TerrainVertex {
                    position: [pos.x, height, pos.y],
                    uv: [x as f32 / size.x as f32, y as f32 / size.y as f32],
                    normal: normal.to_array(),
                    color: height_color(height, params),
                });
            }
        }

        let mut indices = Vec::with_capacity((size.x * size.y * 6) as usize);
        let row = w as u32;
        for y in 0..size.y {
            for x in 0..size.x {
                let i = y * row + x;
                indices.extend_from_slice(&[i, i + row, i + 1, i + 1, i + row, i + row + 1]);
            }
        }

        MeshData::from_vertices(&vertices, indices)
    }
}

/// Streamable heightfield world
pub struct TerrainGrid {
    chunks: ChunkGrid<f32>,
    generator: Arc<TerrainGenerator>,
    mesher: Arc<HeightmapMesher>,
}

impl TerrainGrid {
    pub fn new(params: TerrainParams, chunk_tiles: u32, tile_size: f32) -> Result<Self> {
        let chunks = ChunkGrid::new(UVec2::splat(chunk_tiles), Vec2::splat(tile_size))?;
        let generator = Arc::new(TerrainGenerator::new(params));
        Ok(Self {
            chunks,
            mesher: Arc::new(HeightmapMesher::new(generator.clone())),
            generator,
        })
    }

    pub fn generator(&self) -> &TerrainGenerator {
        &self.generator
    }

    /// Height of the nearest resident tile corner, if its chunk exists
    pub fn height_at(&self, pos: Vec2) -> Option<f32> {
        let coord = self.chunks.chunk_at(pos);
        let chunk = self.chunks.get_chunk(coord)?;
        let local = ((pos - coord.world_origin(self.chunks.chunk_world_size())) / self.chunks.tile_size())
            .floor()
            .as_uvec2();
        let size = self.chunks.chunk_size();
        chunk.tiles().get((local.y.min(size.y - 1) * size.x + local.x.min(size.x - 1)) as usize).copied()
    }
}

impl StreamableGrid for TerrainGrid {
    type Tile = f32;

    fn chunks(&self) -> &ChunkGrid<f32> {
        &self.chunks
    }

    fn chunks_mut(&mut self) -> &mut ChunkGrid<f32> {
        &mut self.chunks
    }

    fn mesher(&self) -> Arc<dyn ChunkMesher<f32>> {
        self.mesher.clone()
    }

    fn generate_chunk_data(&mut self, coord: ChunkCoord) -> Result<Vec<f32>> {
        let origin = coord.world_origin(self.chunks.chunk_world_size());
        let size = self.chunks.chunk_size();
        debug_assert_eq!(size.x, size.y);
        Ok(self.generator.sample_block(origin, size.x, self.chunks.tile_size()))
    }
}
