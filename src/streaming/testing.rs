//! Fixtures shared by the streaming tests

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use super::chunk::{ChunkCoord, ChunkState};
use super::config::StreamingConfig;
use super::grid::{ChunkGrid, StreamableGrid};
use super::manager::ChunkStreamManager;
use super::mesh::{ChunkMesher, MeshData, MeshInput, Vertex};
use crate::core::types::{UVec2, Vec2};
use crate::core::{Error, Result};
use crate::gpu::{GpuBackend, GpuBufferPool, HostBackend, VertexFormat};
use crate::jobs::AsyncJobManager;

pub const FRAME: Duration = Duration::from_millis(16);

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct QuadVertex {
    position: [f32; 3],
    uv: [f32; 2],
    color: [u8; 4],
}

impl Vertex for QuadVertex {
    const FORMAT: VertexFormat = VertexFormat::PosUvColor;
}

/// One quad per chunk, with injectable failures
#[derive(Default)]
pub struct QuadMesher {
    pub fail: HashSet<ChunkCoord>,
    pub panic: HashSet<ChunkCoord>,
}

impl ChunkMesher<u8> for QuadMesher {
    fn build_mesh(&self, input: &MeshInput<u8>) -> Result<MeshData> {
        if self.panic.contains(&input.coord) {
            panic!("mesher panicked at {}", input.coord);
        }
        if self.fail.contains(&input.coord) {
            return Err(Error::generation(input.coord, "mesher refused"));
        }

        let size = input.chunk_size.as_vec2() * input.tile_size;
        let vertices: Vec<QuadVertex> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .into_iter()
            .map(|(u, v)| QuadVertex {
                position: [input.origin.x + u * size.x, 0.0, input.origin.y + v * size.y],
                uv: [u, v],
                color: [input.tiles[0], 0, 0, 255],
            })
            .collect();
        MeshData::from_vertices(&vertices, vec![0, 1, 2, 0, 2, 3])
    }
}

pub struct FlatWorld {
    pub grid: ChunkGrid<u8>,
    pub mesher: Arc<QuadMesher>,
    pub fail_generation: HashSet<ChunkCoord>,
}

impl FlatWorld {
    pub fn new() -> Self {
        Self::with_mesher(QuadMesher::default())
    }

    pub fn with_mesher(mesher: QuadMesher) -> Self {
        Self {
            grid: ChunkGrid::new(UVec2::splat(4), Vec2::ONE).unwrap(),
            mesher: Arc::new(mesher),
            fail_generation: HashSet::new(),
        }
    }
}

impl StreamableGrid for FlatWorld {
    type Tile = u8;

    fn chunks(&self) -> &ChunkGrid<u8> {
        &self.grid
    }

    fn chunks_mut(&mut self) -> &mut ChunkGrid<u8> {
        &mut self.grid
    }

    fn mesher(&self) -> Arc<dyn ChunkMesher<u8>> {
        self.mesher.clone()
    }

    fn generate_chunk_data(&mut self, coord: ChunkCoord) -> Result<Vec<u8>> {
        if self.fail_generation.contains(&coord) {
            return Err(Error::generation(coord, "no data source"));
        }
        Ok(vec![1; self.grid.tiles_per_chunk()])
    }
}

/// A stream manager with everything it drives
pub struct Harness {
    pub manager: ChunkStreamManager<u8>,
    pub world: FlatWorld,
    pub pool: GpuBufferPool,
    pub jobs: AsyncJobManager,
}

impl Harness {
    pub fn new(config: StreamingConfig) -> Self {
        Self::with(config, FlatWorld::new(), HostBackend::new())
    }

    pub fn with(config: StreamingConfig, world: FlatWorld, backend: impl GpuBackend + 'static) -> Self {
        Self {
            manager: ChunkStreamManager::new(config).unwrap(),
            world,
            pool: GpuBufferPool::new(Box::new(backend)),
            jobs: AsyncJobManager::with_workers(2).unwrap(),
        }
    }

    /// One frame: stream update, then the frame boundary
    pub fn frame(&mut self) -> Result<()> {
        let result = self
            .manager
            .update(FRAME, &mut self.world, &mut self.pool, &self.jobs);
        self.pool.process_freed();
        result
    }

    /// Run frames until nothing is in flight or waiting for eviction
    pub fn settle(&mut self) {
        for _ in 0..5000 {
            self.frame().unwrap();
            if self.manager.is_idle() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("streaming did not settle");
    }

    /// Run frames until `done` holds; false on timeout
    pub fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..5000 {
            self.frame().unwrap();
            if done(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    pub fn state(&self, coord: ChunkCoord) -> Option<ChunkState> {
        self.world.grid.get_chunk(coord).map(|chunk| chunk.state())
    }
}
