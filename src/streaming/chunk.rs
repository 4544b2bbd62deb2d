//! Chunk coordinates, residency tiers and the per-chunk resource container

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::mesh::MeshData;
use crate::core::types::Vec2;
use crate::gpu::GpuBuffer;
use crate::jobs::TaskHandle;
use crate::math::Aabb;

/// Integer coordinate identifying a chunk in the world grid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    /// Create a new chunk coordinate
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Convert a world position to the chunk containing it
    pub fn from_world_pos(pos: Vec2, chunk_world_size: Vec2) -> Self {
        Self {
            x: (pos.x / chunk_world_size.x).floor() as i32,
            y: (pos.y / chunk_world_size.y).floor() as i32,
        }
    }

    /// World-space origin (minimum corner) of this chunk
    pub fn world_origin(&self, chunk_world_size: Vec2) -> Vec2 {
        Vec2::new(self.x as f32, self.y as f32) * chunk_world_size
    }

    /// Chebyshev distance in chunk units
    pub fn chebyshev_distance(&self, other: ChunkCoord) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// Neighbouring coordinate; clamps at the edge of the coordinate space
    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x.saturating_add(dx), self.y.saturating_add(dy))
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Residency tier of a chunk, ordered from least to most resident
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkState {
    /// Only raw tile data is resident
    DataOnly = 0,
    /// Raw data plus a CPU-side mesh
    HasMesh = 1,
    /// Raw data, CPU mesh and uploaded GPU buffers
    HasGpuData = 2,
}

impl ChunkState {
    pub const ALL: [ChunkState; 3] = [Self::DataOnly, Self::HasMesh, Self::HasGpuData];

    /// The next tier up, if any
    pub fn promoted(self) -> Option<Self> {
        match self {
            Self::DataOnly => Some(Self::HasMesh),
            Self::HasMesh => Some(Self::HasGpuData),
            Self::HasGpuData => None,
        }
    }

    /// The next tier down, if any
    pub fn demoted(self) -> Option<Self> {
        match self {
            Self::DataOnly => None,
            Self::HasMesh => Some(Self::DataOnly),
            Self::HasGpuData => Some(Self::HasMesh),
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// GPU buffers of a chunk that reached [`ChunkState::HasGpuData`]
#[derive(Debug)]
pub struct GpuMesh {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub index_count: usize,
    /// Mesh version these buffers were uploaded from
    pub version: u32,
}

/// The single promotion in flight for a chunk
#[derive(Clone, Debug)]
pub struct InFlight {
    pub ticket: u64,
    pub target: ChunkState,
    /// Mesh generation on a worker, when the promotion needed one
    pub cpu: Option<TaskHandle>,
    /// Commit and upload on the render thread, once started
    pub gpu: Option<TaskHandle>,
}

impl InFlight {
    /// Ask every phase of this promotion to stop
    pub fn request_stop(&self) -> bool {
        let already = self.is_stop_requested();
        for handle in self.cpu.iter().chain(self.gpu.iter()) {
            handle.request_stop();
        }
        !already
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cpu.iter().chain(self.gpu.iter()).any(|h| h.is_stop_requested())
    }
}

/// A fixed-size region of world data with an independent residency tier.
///
/// Raw tiles are always resident. The CPU mesh is present only at
/// `HasMesh` or above and GPU buffers only at `HasGpuData`. State and
/// resources are only mutated by the chunk's one in-flight task or by the
/// stream manager on the render thread.
pub struct Chunk<T> {
    coord: ChunkCoord,
    tiles: Arc<[T]>,
    /// Bumped whenever raw data changes; invalidates meshes built from older data
    version: u32,
    bounds: Aabb,
    pub(crate) state: ChunkState,
    pub(crate) mesh: Option<MeshData>,
    pub(crate) mesh_version: Option<u32>,
    pub(crate) gpu: Option<GpuMesh>,
    pub(crate) task: Option<InFlight>,
}

impl<T> Chunk<T> {
    pub(crate) fn new(coord: ChunkCoord, tiles: Arc<[T]>, bounds: Aabb) -> Self {
        Self {
            coord,
            tiles,
            version: 0,
            bounds,
            state: ChunkState::DataOnly,
            mesh: None,
            mesh_version: None,
            gpu: None,
            task: None,
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Tier derived purely from which resources are actually present.
    ///
    /// Differs from [`state`](Self::state) only while a task is in flight,
    /// or when the two have gone out of sync. Held GPU buffers count as
    /// `HasGpuData` even without a mesh.
    pub fn calculated_state(&self) -> ChunkState {
        match (&self.mesh, &self.gpu) {
            (_, Some(_)) => ChunkState::HasGpuData,
            (Some(_), None) => ChunkState::HasMesh,
            (None, None) => ChunkState::DataOnly,
        }
    }

    /// Whether a promotion is in flight
    pub fn is_busy(&self) -> bool {
        self.task.is_some()
    }

    pub fn task(&self) -> Option<&InFlight> {
        self.task.as_ref()
    }

    pub fn tiles(&self) -> &[T] {
        &self.tiles
    }

    pub(crate) fn tiles_shared(&self) -> Arc<[T]> {
        self.tiles.clone()
    }

    pub(crate) fn replace_tiles(&mut self, tiles: Arc<[T]>) {
        self.tiles = tiles;
        self.version = self.version.wrapping_add(1);
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// CPU mesh, present at `HasMesh` and above
    pub fn mesh(&self) -> Option<&MeshData> {
        self.mesh.as_ref()
    }

    pub fn mesh_version(&self) -> Option<u32> {
        self.mesh_version
    }

    /// GPU buffers for draw-call emission, valid only at `HasGpuData`
    pub fn gpu_mesh(&self) -> Option<&GpuMesh> {
        match self.state {
            ChunkState::HasGpuData => self.gpu.as_ref(),
            _ => None,
        }
    }

    pub fn uploaded_version(&self) -> Option<u32> {
        self.gpu.as_ref().map(|gpu| gpu.version)
    }

    /// Whether resident tiers were built from older raw data than the chunk holds
    pub fn is_stale(&self) -> bool {
        match self.state {
            ChunkState::DataOnly => false,
            ChunkState::HasMesh => self.mesh_is_stale(),
            ChunkState::HasGpuData => self.mesh_is_stale() || self.uploaded_version() != self.mesh_version,
        }
    }

    pub(crate) fn mesh_is_stale(&self) -> bool {
        self.mesh_version != Some(self.version)
    }
}
