//! The two phases of a chunk promotion
//!
//! A promotion that needs a new mesh starts with a [`CpuPhase`] on a job
//! worker. Its result travels back over a channel and the stream manager
//! starts a [`GpuPhase`] on the render thread, which commits the mesh and,
//! when the target tier asks for it, uploads the buffers. Promotions that
//! only need an upload skip straight to the GPU phase.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::chunk::{ChunkCoord, ChunkState, GpuMesh};
use super::grid::ChunkGrid;
use super::manager::StreamingStats;
use super::mesh::{ChunkMesher, MeshData, MeshInput};
use crate::core::{Error, Result};
use crate::gpu::GpuBufferPool;
use crate::jobs::{Coroutine, CoroutineHost, Detached, YieldReason};

/// Result of a finished CPU phase, sent to the render thread
#[derive(Debug)]
pub(crate) struct CpuPhaseDone {
    pub coord: ChunkCoord,
    pub ticket: u64,
    pub version: u32,
    pub result: Result<MeshData>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CpuStep {
    Start,
    Build,
    Publish,
}

/// Builds a chunk mesh on a job worker
pub(crate) struct CpuPhase<T> {
    input: MeshInput<T>,
    mesher: Arc<dyn ChunkMesher<T>>,
    ticket: u64,
    done_tx: mpsc::UnboundedSender<CpuPhaseDone>,
    step: CpuStep,
    built: Option<Result<MeshData>>,
}

impl<T> CpuPhase<T> {
    pub fn new(
        input: MeshInput<T>,
        mesher: Arc<dyn ChunkMesher<T>>,
        ticket: u64,
        done_tx: mpsc::UnboundedSender<CpuPhaseDone>,
    ) -> Self {
        Self {
            input,
            mesher,
            ticket,
            done_tx,
            step: CpuStep::Start,
            built: None,
        }
    }
}

impl<T: Send + Sync + 'static> Coroutine for CpuPhase<T> {
    fn advance(&mut self, _cx: &mut <Detached as CoroutineHost>::Context<'_>) -> YieldReason {
        match self.step {
            // Give a stop request issued right after scheduling a chance to
            // land before any work is done
            CpuStep::Start => {
                self.step = CpuStep::Build;
                YieldReason::Continue
            }
            CpuStep::Build => {
                self.built = Some(self.mesher.build_mesh(&self.input));
                self.step = CpuStep::Publish;
                YieldReason::Continue
            }
            CpuStep::Publish => {
                let result = self.built.take().unwrap_or_else(|| {
                    Err(Error::generation(self.input.coord, "mesh was not built"))
                });
                let done = CpuPhaseDone {
                    coord: self.input.coord,
                    ticket: self.ticket,
                    version: self.input.version,
                    result,
                };
                if self.done_tx.send(done).is_err() {
                    log::debug!(
                        "Mesh for chunk {} dropped, stream manager is gone",
                        self.input.coord
                    );
                }
                YieldReason::Finished
            }
        }
    }

    fn on_stop(&mut self, _cx: &mut <Detached as CoroutineHost>::Context<'_>) {
        self.built = None;
        log::trace!("Mesh build for chunk {} stopped", self.input.coord);
    }
}

/// Render-thread host for GPU phases
pub(crate) struct GpuHost<T>(PhantomData<fn() -> T>);

impl<T: 'static> CoroutineHost for GpuHost<T> {
    type Context<'a> = GpuPhaseContext<'a, T>;
}

/// State lent to GPU phases for one manager update
pub(crate) struct GpuPhaseContext<'a, T> {
    pub grid: &'a mut ChunkGrid<T>,
    pub pool: &'a mut GpuBufferPool,
    pub stats: &'a mut StreamingStats,
    /// Uploads still allowed this frame
    pub uploads_left: usize,
    /// Set when the GPU ran out of memory; the manager returns it
    pub fatal: Option<Error>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GpuStep {
    Commit,
    Upload,
}

/// Commits a built mesh and uploads it on the render thread
pub(crate) struct GpuPhase<T> {
    coord: ChunkCoord,
    ticket: u64,
    target: ChunkState,
    mesh: Option<(MeshData, u32)>,
    step: GpuStep,
    _tile: PhantomData<fn() -> T>,
}

impl<T> GpuPhase<T> {
    /// Continue a promotion whose CPU phase produced `mesh` from data `version`
    pub fn commit(
        coord: ChunkCoord,
        ticket: u64,
        target: ChunkState,
        mesh: MeshData,
        version: u32,
    ) -> Self {
        Self {
            coord,
            ticket,
            target,
            mesh: Some((mesh, version)),
            step: GpuStep::Commit,
            _tile: PhantomData,
        }
    }

    /// Upload the mesh a chunk already holds
    pub fn upload_only(coord: ChunkCoord, ticket: u64, target: ChunkState) -> Self {
        Self {
            coord,
            ticket,
            target,
            mesh: None,
            step: GpuStep::Upload,
            _tile: PhantomData,
        }
    }

    fn finish(&self, cx: &mut GpuPhaseContext<'_, T>) -> YieldReason {
        cx.grid.end_task(self.coord, self.ticket);
        YieldReason::Finished
    }

    fn upload(&self, cx: &mut GpuPhaseContext<'_, T>) -> YieldReason {
        if cx.uploads_left == 0 {
            return YieldReason::Continue;
        }

        let existing = cx.grid.take_gpu(self.coord);
        let Some(mesh) = cx.grid.get_chunk(self.coord).and_then(|chunk| chunk.mesh()) else {
            log::warn!("Chunk {} lost its mesh before upload", self.coord);
            if let Some(gpu) = existing {
                release_gpu(cx.pool, gpu);
            }
            return self.finish(cx);
        };
        let version = cx
            .grid
            .get_chunk(self.coord)
            .and_then(|chunk| chunk.mesh_version())
            .unwrap_or_default();

        match upload_mesh(cx.pool, existing, mesh, version) {
            Ok(gpu) => {
                cx.grid.commit_gpu(self.coord, gpu);
                cx.uploads_left -= 1;
                cx.stats.uploads += 1;
            }
            Err(e) if e.is_fatal() => {
                log::error!("Upload of chunk {} failed: {}", self.coord, e);
                cx.fatal.get_or_insert(e);
            }
            Err(e) => {
                log::warn!("Upload of chunk {} failed: {}", self.coord, e);
                cx.stats.failures += 1;
            }
        }
        self.finish(cx)
    }
}

impl<T: 'static> Coroutine<GpuHost<T>> for GpuPhase<T> {
    fn advance(&mut self, cx: &mut <GpuHost<T> as CoroutineHost>::Context<'_>) -> YieldReason {
        if cx.grid.task_for(self.coord, self.ticket).is_none() {
            log::trace!("GPU phase for chunk {} is stale", self.coord);
            return YieldReason::Finished;
        }

        match self.step {
            GpuStep::Commit => {
                if let Some((mesh, version)) = self.mesh.take() {
                    cx.grid.commit_mesh(self.coord, mesh, version);
                }
                if self.target <= ChunkState::HasMesh {
                    return self.finish(cx);
                }
                // One tier per tick
                self.step = GpuStep::Upload;
                YieldReason::Continue
            }
            GpuStep::Upload => self.upload(cx),
        }
    }

    fn on_stop(&mut self, cx: &mut <GpuHost<T> as CoroutineHost>::Context<'_>) {
        self.mesh = None;
        cx.grid.end_task(self.coord, self.ticket);
        log::trace!("GPU phase for chunk {} stopped", self.coord);
    }
}

/// Write `mesh` into `existing` buffers or freshly pooled ones.
///
/// On failure every buffer involved is back in the pool.
pub(crate) fn upload_mesh(
    pool: &mut GpuBufferPool,
    existing: Option<GpuMesh>,
    mesh: &MeshData,
    version: u32,
) -> Result<GpuMesh> {
    let mut gpu = match existing {
        Some(gpu) if gpu.vertices.vertex_format() == Some(mesh.format()) => gpu,
        Some(gpu) => {
            pool.free_buffer(gpu.vertices);
            let vertices = match pool.allocate_buffer(mesh.format()) {
                Ok(buffer) => buffer,
                Err(e) => {
                    pool.free_buffer(gpu.indices);
                    return Err(e);
                }
            };
            GpuMesh {
                vertices,
                ..gpu
            }
        }
        None => {
            let vertices = pool.allocate_buffer(mesh.format())?;
            let indices = match pool.rent_index_buffer(Some(mesh.index_count())) {
                Ok(buffer) => buffer,
                Err(e) => {
                    pool.free_buffer(vertices);
                    return Err(e);
                }
            };
            GpuMesh {
                vertices,
                indices,
                index_count: 0,
                version,
            }
        }
    };

    let written = pool
        .upload(&mut gpu.vertices, mesh.vertex_bytes())
        .and_then(|()| pool.upload(&mut gpu.indices, bytemuck::cast_slice(mesh.indices())));
    if let Err(e) = written {
        release_gpu(pool, gpu);
        return Err(e);
    }

    gpu.index_count = mesh.index_count();
    gpu.version = version;
    Ok(gpu)
}

/// Hand both buffers of a chunk back to the pool
pub(crate) fn release_gpu(pool: &mut GpuBufferPool, gpu: GpuMesh) {
    pool.free_buffer(gpu.vertices);
    pool.free_buffer(gpu.indices);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{UVec2, Vec2};
    use crate::gpu::{HostBackend, VertexFormat};
    use crate::jobs::CoroutineManager;
    use std::time::Duration;

    struct EmptyMesher;

    impl ChunkMesher<u8> for EmptyMesher {
        fn build_mesh(&self, _input: &MeshInput<u8>) -> Result<MeshData> {
            Ok(MeshData::empty(VertexFormat::PosUvColor))
        }
    }

    fn input(coord: ChunkCoord) -> MeshInput<u8> {
        MeshInput {
            coord,
            version: 3,
            chunk_size: UVec2::new(1, 1),
            tile_size: Vec2::ONE,
            origin: Vec2::ZERO,
            tiles: Arc::from(vec![0u8]),
        }
    }

    #[test]
    fn test_cpu_phase_yields_before_building() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager: CoroutineManager = CoroutineManager::new();
        let coord = ChunkCoord::new(2, 3);
        let handle = manager.start(CpuPhase::new(input(coord), Arc::new(EmptyMesher), 9, tx));

        manager.update(Duration::ZERO, &mut ());
        assert!(rx.try_recv().is_err());
        manager.update(Duration::ZERO, &mut ());
        manager.update(Duration::ZERO, &mut ());

        let done = rx.try_recv().unwrap();
        assert_eq!(done.coord, coord);
        assert_eq!(done.ticket, 9);
        assert_eq!(done.version, 3);
        assert!(done.result.is_ok());
        assert!(handle.is_finished());
    }

    #[test]
    fn test_stopped_cpu_phase_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut manager: CoroutineManager = CoroutineManager::new();
        let handle = manager.start(CpuPhase::new(
            input(ChunkCoord::new(0, 0)),
            Arc::new(EmptyMesher),
            1,
            tx,
        ));

        manager.update(Duration::ZERO, &mut ());
        handle.request_stop();
        for _ in 0..3 {
            manager.update(Duration::ZERO, &mut ());
        }

        assert!(rx.try_recv().is_err());
        assert!(handle.is_finished());
    }

    #[test]
    fn test_upload_mesh_returns_buffers_on_failure() {
        let mut pool = GpuBufferPool::new(Box::new(HostBackend::with_max_buffers(1)));
        let mesh = MeshData::empty(VertexFormat::PosUvColor);

        let err = upload_mesh(&mut pool, None, &mesh, 0).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().pending, 1);
    }

    #[test]
    fn test_upload_mesh_reuses_existing_buffers() {
        let mut pool = GpuBufferPool::new(Box::new(HostBackend::new()));
        let mesh = MeshData::empty(VertexFormat::PosUvColor);

        let first = upload_mesh(&mut pool, None, &mesh, 0).unwrap();
        let ids = (first.vertices.id(), first.indices.id());
        let second = upload_mesh(&mut pool, Some(first), &mesh, 1).unwrap();

        assert_eq!((second.vertices.id(), second.indices.id()), ids);
        assert_eq!(second.version, 1);
        assert_eq!(pool.stats().created, 2);
    }
}
