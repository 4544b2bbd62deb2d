//! Sparse chunk storage with per-state indices

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use super::chunk::{Chunk, ChunkCoord, ChunkState, GpuMesh, InFlight};
use super::mesh::{ChunkMesher, MeshData, MeshInput};
use crate::core::types::{UVec2, Vec2};
use crate::core::{Error, Result};
use crate::jobs::TaskHandle;
use crate::math::Aabb;

/// Per-chunk snapshot for debug tooling
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChunkDebugInfo {
    pub coord: ChunkCoord,
    pub state: ChunkState,
    pub calculated_state: ChunkState,
    pub busy: bool,
    pub target: Option<ChunkState>,
    pub data_version: u32,
    pub mesh_version: Option<u32>,
    pub uploaded_version: Option<u32>,
}

/// All chunks of one world, keyed by coordinate.
///
/// Chunks are created lazily and never removed; only their tier changes.
/// State transitions go through the grid so the per-state indices stay exact.
pub struct ChunkGrid<T> {
    chunks: HashMap<ChunkCoord, Chunk<T>>,
    by_state: [HashSet<ChunkCoord>; 3],
    chunk_size: UVec2,
    tile_size: Vec2,
}

impl<T> ChunkGrid<T> {
    /// Fails unless both tile dimensions are finite and positive
    pub fn new(chunk_size: UVec2, tile_size: Vec2) -> Result<Self> {
        if !tile_size.is_finite() || tile_size.min_element() <= 0.0 {
            return Err(Error::Config(format!("tile size {tile_size} must be positive")));
        }
        Ok(Self {
            chunks: HashMap::new(),
            by_state: Default::default(),
            chunk_size: chunk_size.max(UVec2::ONE),
            tile_size,
        })
    }

    /// Tiles per chunk along each axis
    pub fn chunk_size(&self) -> UVec2 {
        self.chunk_size
    }

    pub fn tile_size(&self) -> Vec2 {
        self.tile_size
    }

    /// World size of one chunk
    pub fn chunk_world_size(&self) -> Vec2 {
        self.chunk_size.as_vec2() * self.tile_size
    }

    pub fn tiles_per_chunk(&self) -> usize {
        (self.chunk_size.x * self.chunk_size.y) as usize
    }

    /// Chunk containing a world position
    pub fn chunk_at(&self, world_pos: Vec2) -> ChunkCoord {
        ChunkCoord::from_world_pos(world_pos, self.chunk_world_size())
    }

    pub fn get_chunk(&self, coord: ChunkCoord) -> Option<&Chunk<T>> {
        self.chunks.get(&coord)
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        self.chunks.contains_key(&coord)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChunkCoord, &Chunk<T>)> {
        self.chunks.iter()
    }

    /// Coordinates of every chunk currently in `state`
    pub fn coords_in_state(&self, state: ChunkState) -> impl Iterator<Item = ChunkCoord> + '_ {
        self.by_state[state.index()].iter().copied()
    }

    pub fn count_in_state(&self, state: ChunkState) -> usize {
        self.by_state[state.index()].len()
    }

    /// Chunks whose GPU buffers can be drawn this frame
    pub fn renderable(&self) -> impl Iterator<Item = &Chunk<T>> {
        self.by_state[ChunkState::HasGpuData.index()]
            .iter()
            .filter_map(|coord| self.chunks.get(coord))
    }

    /// Add a chunk at `DataOnly`, or replace the tiles of an existing one
    pub fn insert_chunk(&mut self, coord: ChunkCoord, tiles: Vec<T>) -> Result<()> {
        if self.chunks.contains_key(&coord) {
            return self.set_tiles(coord, tiles);
        }
        self.check_len(coord, tiles.len())?;

        let world = self.chunk_world_size();
        let origin = coord.world_origin(world);
        let bounds = Aabb::from_origin_size(origin, world);
        self.chunks.insert(coord, Chunk::new(coord, Arc::from(tiles), bounds));
        self.by_state[ChunkState::DataOnly.index()].insert(coord);
        Ok(())
    }

    /// Replace a chunk's raw data. Resident meshes become stale and are
    /// rebuilt by the stream manager while the chunk stays in range.
    pub fn set_tiles(&mut self, coord: ChunkCoord, tiles: Vec<T>) -> Result<()> {
        self.check_len(coord, tiles.len())?;
        let chunk = self
            .chunks
            .get_mut(&coord)
            .ok_or_else(|| Error::generation(coord, "chunk does not exist"))?;
        chunk.replace_tiles(Arc::from(tiles));
        log::trace!("Chunk {} data now at version {}", coord, chunk.version());
        Ok(())
    }

    fn check_len(&self, coord: ChunkCoord, len: usize) -> Result<()> {
        let expected = self.tiles_per_chunk();
        if len != expected {
            return Err(Error::generation(
                coord,
                format!("expected {expected} tiles, got {len}"),
            ));
        }
        Ok(())
    }

    /// Snapshot of a chunk's data for a mesher
    pub(crate) fn mesh_input(&self, coord: ChunkCoord) -> Option<MeshInput<T>> {
        let chunk = self.chunks.get(&coord)?;
        Some(MeshInput {
            coord,
            version: chunk.version(),
            chunk_size: self.chunk_size,
            tile_size: self.tile_size,
            origin: coord.world_origin(self.chunk_world_size()),
            tiles: chunk.tiles_shared(),
        })
    }

    fn set_state(&mut self, coord: ChunkCoord, state: ChunkState) {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return;
        };
        if chunk.state == state {
            return;
        }
        self.by_state[chunk.state.index()].remove(&coord);
        self.by_state[state.index()].insert(coord);
        log::trace!("Chunk {}: {:?} -> {:?}", coord, chunk.state, state);
        chunk.state = state;
    }

    pub(crate) fn begin_task(&mut self, coord: ChunkCoord, task: InFlight) {
        if let Some(chunk) = self.chunks.get_mut(&coord) {
            debug_assert!(chunk.task.is_none(), "chunk {coord} already has a task");
            chunk.task = Some(task);
        }
    }

    /// The in-flight task of `coord`, if its ticket matches
    pub(crate) fn task_for(&self, coord: ChunkCoord, ticket: u64) -> Option<&InFlight> {
        self.chunks
            .get(&coord)?
            .task
            .as_ref()
            .filter(|task| task.ticket == ticket)
    }

    pub(crate) fn attach_gpu_phase(&mut self, coord: ChunkCoord, ticket: u64, handle: TaskHandle) {
        if let Some(task) = self
            .chunks
            .get_mut(&coord)
            .and_then(|chunk| chunk.task.as_mut())
            .filter(|task| task.ticket == ticket)
        {
            task.gpu = Some(handle);
        }
    }

    /// Clear the task of `coord` if it still carries `ticket`
    pub(crate) fn end_task(&mut self, coord: ChunkCoord, ticket: u64) -> bool {
        match self.chunks.get_mut(&coord) {
            Some(chunk) if chunk.task.as_ref().is_some_and(|t| t.ticket == ticket) => {
                chunk.task = None;
                true
            }
            _ => false,
        }
    }

    /// Install a freshly built mesh; a `DataOnly` chunk becomes `HasMesh`
    pub(crate) fn commit_mesh(&mut self, coord: ChunkCoord, mesh: MeshData, version: u32) {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return;
        };
        chunk.mesh = Some(mesh);
        chunk.mesh_version = Some(version);
        if chunk.state == ChunkState::DataOnly {
            self.set_state(coord, ChunkState::HasMesh);
        }
    }

    /// Take the GPU buffers of a chunk for re-upload or release.
    /// A `HasGpuData` chunk drops to `HasMesh`.
    pub(crate) fn take_gpu(&mut self, coord: ChunkCoord) -> Option<GpuMesh> {
        let gpu = self.chunks.get_mut(&coord)?.gpu.take();
        if self.chunks.get(&coord).is_some_and(|c| c.state == ChunkState::HasGpuData) {
            self.set_state(coord, ChunkState::HasMesh);
        }
        gpu
    }

    /// Install uploaded buffers; the chunk becomes `HasGpuData`
    pub(crate) fn commit_gpu(&mut self, coord: ChunkCoord, gpu: GpuMesh) {
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return;
        };
        chunk.gpu = Some(gpu);
        self.set_state(coord, ChunkState::HasGpuData);
    }

    /// Drop resources above `target`, returning GPU buffers the caller must
    /// hand back to the pool
    pub(crate) fn demote(&mut self, coord: ChunkCoord, target: ChunkState) -> Option<GpuMesh> {
        let chunk = self.chunks.get_mut(&coord)?;
        if target >= chunk.state {
            return None;
        }

        let gpu = chunk.gpu.take();
        if target == ChunkState::DataOnly {
            chunk.mesh = None;
            chunk.mesh_version = None;
        }
        self.set_state(coord, target);
        gpu
    }

    pub fn debug_chunks(&self) -> Vec<ChunkDebugInfo> {
        let mut infos: Vec<_> = self
            .chunks
            .values()
            .map(|chunk| ChunkDebugInfo {
                coord: chunk.coord(),
                state: chunk.state(),
                calculated_state: chunk.calculated_state(),
                busy: chunk.is_busy(),
                target: chunk.task().map(|task| task.target),
                data_version: chunk.version(),
                mesh_version: chunk.mesh_version(),
                uploaded_version: chunk.uploaded_version(),
            })
            .collect();
        infos.sort_by_key(|info| info.coord);
        infos
    }

    /// Idle chunks whose recorded state disagrees with their resources
    pub fn desynced_chunks(&self) -> Vec<ChunkCoord> {
        let mut coords: Vec<_> = self
            .chunks
            .values()
            .filter(|chunk| !chunk.is_busy() && chunk.state() != chunk.calculated_state())
            .map(|chunk| chunk.coord())
            .collect();
        coords.sort();
        coords
    }
}

/// A world made of chunks that the stream manager can drive.
///
/// Implementors own the chunk grid and know how to produce raw data for a
/// chunk seen for the first time and how to mesh it.
pub trait StreamableGrid {
    type Tile: Send + Sync + 'static;

    fn chunks(&self) -> &ChunkGrid<Self::Tile>;

    fn chunks_mut(&mut self) -> &mut ChunkGrid<Self::Tile>;

    /// Mesher shared with worker threads
    fn mesher(&self) -> Arc<dyn ChunkMesher<Self::Tile>>;

    /// Produce the raw tiles of a chunk that does not exist yet
    fn generate_chunk_data(&mut self, coord: ChunkCoord) -> Result<Vec<Self::Tile>>;

    fn get_chunk(&self, coord: ChunkCoord) -> Option<&Chunk<Self::Tile>> {
        self.chunks().get_chunk(coord)
    }

    fn chunk_size(&self) -> UVec2 {
        self.chunks().chunk_size()
    }

    fn tile_size(&self) -> Vec2 {
        self.chunks().tile_size()
    }

    /// Generate and insert a new chunk at `DataOnly`
    fn streaming_generate_chunk(&mut self, coord: ChunkCoord) -> Result<()> {
        let tiles = self.generate_chunk_data(coord)?;
        self.chunks_mut().insert_chunk(coord, tiles)?;
        log::trace!("Generated chunk {}", coord);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuBufferPool, HostBackend, VertexFormat};

    fn grid() -> ChunkGrid<u8> {
        ChunkGrid::new(UVec2::new(2, 2), Vec2::splat(4.0)).unwrap()
    }

    #[test]
    fn test_rejects_degenerate_tile_size() {
        for tile_size in [Vec2::ZERO, Vec2::new(1.0, -1.0), Vec2::new(f32::NAN, 1.0), Vec2::splat(f32::INFINITY)] {
            let result = ChunkGrid::<u8>::new(UVec2::splat(4), tile_size);
            assert!(matches!(result, Err(Error::Config(_))), "{tile_size}");
        }
    }

    #[test]
    fn test_insert_indexes_data_only() {
        let mut grid = grid();
        grid.insert_chunk(ChunkCoord::new(1, -1), vec![0; 4]).unwrap();

        let chunk = grid.get_chunk(ChunkCoord::new(1, -1)).unwrap();
        assert_eq!(chunk.state(), ChunkState::DataOnly);
        assert_eq!(chunk.bounds().min, Vec2::new(8.0, -8.0));
        assert_eq!(grid.count_in_state(ChunkState::DataOnly), 1);
    }

    #[test]
    fn test_insert_rejects_wrong_tile_count() {
        let mut grid = grid();
        let err = grid.insert_chunk(ChunkCoord::new(0, 0), vec![0; 3]).unwrap_err();
        assert!(matches!(err, Error::Generation { .. }));
        assert!(grid.is_empty());
    }

    #[test]
    fn test_chunk_at_uses_world_size() {
        let grid = grid();
        assert_eq!(grid.chunk_world_size(), Vec2::splat(8.0));
        assert_eq!(grid.chunk_at(Vec2::new(7.9, -0.1)), ChunkCoord::new(0, -1));
    }

    #[test]
    fn test_commit_and_demote_keep_indices() {
        let mut grid = grid();
        let coord = ChunkCoord::new(0, 0);
        grid.insert_chunk(coord, vec![0; 4]).unwrap();

        grid.commit_mesh(coord, MeshData::empty(VertexFormat::PosUvColor), 0);
        assert_eq!(grid.get_chunk(coord).unwrap().state(), ChunkState::HasMesh);
        assert_eq!(grid.coords_in_state(ChunkState::HasMesh).collect::<Vec<_>>(), vec![coord]);
        assert_eq!(grid.count_in_state(ChunkState::DataOnly), 0);

        assert!(grid.demote(coord, ChunkState::DataOnly).is_none());
        let chunk = grid.get_chunk(coord).unwrap();
        assert_eq!(chunk.state(), ChunkState::DataOnly);
        assert!(chunk.mesh().is_none());
        assert_eq!(grid.count_in_state(ChunkState::DataOnly), 1);
        assert_eq!(grid.count_in_state(ChunkState::HasMesh), 0);
    }

    #[test]
    fn test_set_tiles_marks_mesh_stale() {
        let mut grid = grid();
        let coord = ChunkCoord::new(0, 0);
        grid.insert_chunk(coord, vec![0; 4]).unwrap();
        grid.commit_mesh(coord, MeshData::empty(VertexFormat::PosUvColor), 0);
        assert!(!grid.get_chunk(coord).unwrap().is_stale());

        grid.set_tiles(coord, vec![1; 4]).unwrap();
        let chunk = grid.get_chunk(coord).unwrap();
        assert!(chunk.is_stale());
        assert_eq!(chunk.state(), ChunkState::HasMesh);
    }

    #[test]
    fn test_end_task_requires_matching_ticket() {
        let mut grid = grid();
        let coord = ChunkCoord::new(0, 0);
        grid.insert_chunk(coord, vec![0; 4]).unwrap();
        grid.begin_task(
            coord,
            InFlight {
                ticket: 7,
                target: ChunkState::HasMesh,
                cpu: None,
                gpu: None,
            },
        );

        assert!(grid.task_for(coord, 6).is_none());
        assert!(!grid.end_task(coord, 6));
        assert!(grid.get_chunk(coord).unwrap().is_busy());
        assert!(grid.end_task(coord, 7));
        assert!(!grid.get_chunk(coord).unwrap().is_busy());
    }

    #[test]
    fn test_desync_detection() {
        let mut grid = grid();
        let coord = ChunkCoord::new(0, 0);
        grid.insert_chunk(coord, vec![0; 4]).unwrap();
        assert!(grid.desynced_chunks().is_empty());

        grid.chunks.get_mut(&coord).unwrap().state = ChunkState::HasMesh;
        assert_eq!(grid.desynced_chunks(), vec![coord]);
    }

    #[test]
    fn test_desync_detects_buffers_without_mesh() {
        let mut grid = grid();
        let coord = ChunkCoord::new(0, 0);
        grid.insert_chunk(coord, vec![0; 4]).unwrap();

        let mut pool = GpuBufferPool::new(Box::new(HostBackend::new()));
        let leaked = GpuMesh {
            vertices: pool.allocate_buffer(VertexFormat::PosUvColor).unwrap(),
            indices: pool.rent_index_buffer(None).unwrap(),
            index_count: 0,
            version: 0,
        };
        grid.chunks.get_mut(&coord).unwrap().gpu = Some(leaked);

        let chunk = grid.get_chunk(coord).unwrap();
        assert_eq!(chunk.state(), ChunkState::DataOnly);
        assert_eq!(chunk.calculated_state(), ChunkState::HasGpuData);
        assert_eq!(grid.desynced_chunks(), vec![coord]);
    }

    #[test]
    fn test_debug_chunks_sorted() {
        let mut grid = grid();
        grid.insert_chunk(ChunkCoord::new(1, 0), vec![0; 4]).unwrap();
        grid.insert_chunk(ChunkCoord::new(-1, 0), vec![0; 4]).unwrap();

        let infos = grid.debug_chunks();
        assert_eq!(infos[0].coord, ChunkCoord::new(-1, 0));
        assert_eq!(infos[1].coord, ChunkCoord::new(1, 0));
        assert!(!infos[0].busy);
    }
}
