//! Distance-driven chunk streaming
//!
//! Every frame the manager turns actor positions into a desired tier per
//! chunk, promotes chunks below it through the job system, demotes chunks
//! above it synchronously and evicts everything no actor touched.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use super::chunk::{ChunkCoord, ChunkState, InFlight};
use super::config::{DemotionPolicy, StreamingConfig};
use super::grid::{ChunkDebugInfo, ChunkGrid, StreamableGrid};
use super::promotion::{release_gpu, CpuPhase, CpuPhaseDone, GpuHost, GpuPhase, GpuPhaseContext};
use crate::core::types::Vec2;
use crate::core::Result;
use crate::gpu::GpuBufferPool;
use crate::jobs::{AsyncJobManager, CoroutineManager, RenderThread, TaskOutcome};

/// Identifies a registered streaming actor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActorId(u64);

/// Counters for the last [`ChunkStreamManager::update`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamingStats {
    pub frame: u64,
    /// Chunks within simulation range of some actor
    pub touched: usize,
    pub promotions: usize,
    /// Promotions rebuilding a resident tier after its data changed
    pub refreshes: usize,
    pub demotions: usize,
    /// Untouched chunks dropped to `DataOnly`
    pub evictions: usize,
    pub uploads: usize,
    pub cancelled: usize,
    pub failures: usize,
    /// Chunks with a promotion still running after the update
    pub in_flight: usize,
}

impl StreamingStats {
    fn has_activity(&self) -> bool {
        self.promotions + self.demotions + self.evictions + self.uploads + self.cancelled + self.failures
            > 0
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ActorDebugInfo {
    pub id: ActorId,
    pub position: Vec2,
    pub chunk: ChunkCoord,
}

/// Streaming view for debug tooling
#[derive(Clone, Debug, Serialize)]
pub struct StreamDebugInfo {
    pub frame: u64,
    pub render_range: u32,
    pub simulation_range: u32,
    pub actors: Vec<ActorDebugInfo>,
    pub stats: StreamingStats,
    pub chunks: Vec<ChunkDebugInfo>,
}

/// Drives the residency tier of every chunk of one world.
///
/// Lives on the render thread. Worker-side mesh builds report back over a
/// channel; commits, uploads and demotions happen inside [`update`](Self::update).
pub struct ChunkStreamManager<T: Send + Sync + 'static> {
    config: StreamingConfig,
    actors: BTreeMap<ActorId, Vec2>,
    next_actor: u64,
    /// Desired tier of every chunk touched by the last update
    desired: HashMap<ChunkCoord, ChunkState>,
    /// Frame each chunk was last touched
    last_touched: HashMap<ChunkCoord, u64>,
    in_flight: HashSet<ChunkCoord>,
    render_tasks: CoroutineManager<GpuHost<T>>,
    done_tx: mpsc::UnboundedSender<CpuPhaseDone>,
    done_rx: mpsc::UnboundedReceiver<CpuPhaseDone>,
    /// Builds published before their worker marked them finished
    deferred: Vec<CpuPhaseDone>,
    next_ticket: u64,
    frame: u64,
    stats: StreamingStats,
    render_thread: RenderThread,
}

impl<T: Send + Sync + 'static> ChunkStreamManager<T> {
    /// Create a manager owned by the calling (render) thread
    pub fn new(config: StreamingConfig) -> Result<Self> {
        config.validate()?;
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        log::info!(
            "ChunkStreamManager: render range {}, simulation range {}, {:?} demotion",
            config.render_range,
            config.simulation_range,
            config.demotion
        );

        Ok(Self {
            config,
            actors: BTreeMap::new(),
            next_actor: 0,
            desired: HashMap::new(),
            last_touched: HashMap::new(),
            in_flight: HashSet::new(),
            render_tasks: CoroutineManager::new(),
            done_tx,
            done_rx,
            deferred: Vec::new(),
            next_ticket: 0,
            frame: 0,
            stats: StreamingStats::default(),
            render_thread: RenderThread::current(),
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn stats(&self) -> StreamingStats {
        self.stats
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn register_actor(&mut self, position: Vec2) -> ActorId {
        let id = ActorId(self.next_actor);
        self.next_actor += 1;
        self.actors.insert(id, position);
        log::debug!("Registered streaming actor {:?} at {}", id, position);
        id
    }

    pub fn unregister_actor(&mut self, id: ActorId) -> bool {
        self.actors.remove(&id).is_some()
    }

    pub fn set_actor_position(&mut self, id: ActorId, position: Vec2) -> bool {
        match self.actors.get_mut(&id) {
            Some(slot) => {
                *slot = position;
                true
            }
            None => false,
        }
    }

    pub fn actor_position(&self, id: ActorId) -> Option<Vec2> {
        self.actors.get(&id).copied()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Tier the last update asked for; `None` for untouched chunks
    pub fn desired_state(&self, coord: ChunkCoord) -> Option<ChunkState> {
        self.desired.get(&coord).copied()
    }

    /// No promotion running and no untouched chunk waiting for eviction
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
            && self.render_tasks.is_empty()
            && self.last_touched.len() == self.desired.len()
    }

    /// Advance streaming by one frame.
    ///
    /// Only an exhausted GPU is returned as an error; generation and mesh
    /// failures are logged and retried while the chunk stays in range.
    pub fn update<G>(
        &mut self,
        dt: Duration,
        world: &mut G,
        pool: &mut GpuBufferPool,
        jobs: &AsyncJobManager,
    ) -> Result<()>
    where
        G: StreamableGrid<Tile = T>,
    {
        self.render_thread.assert_current("ChunkStreamManager::update");
        self.frame += 1;
        self.stats = StreamingStats {
            frame: self.frame,
            ..Default::default()
        };

        self.receive_meshes(world.chunks_mut());
        self.sweep_finished(world.chunks_mut());

        self.compute_desired(world.chunks().chunk_world_size());
        let mut touched: Vec<(ChunkCoord, ChunkState)> =
            self.desired.iter().map(|(&coord, &state)| (coord, state)).collect();
        // Highest tiers first, then by coordinate for a stable visiting order
        touched.sort_unstable_by_key(|&(coord, state)| (Reverse(state), coord));
        self.stats.touched = touched.len();

        for (coord, desired) in touched {
            self.last_touched.insert(coord, self.frame);
            if !world.chunks().contains(coord) {
                if let Err(e) = world.streaming_generate_chunk(coord) {
                    log::warn!("Failed to generate chunk {}: {}", coord, e);
                    self.stats.failures += 1;
                    continue;
                }
            }
            self.set_chunk_state(world, pool, jobs, coord, desired);
        }

        self.demote_untouched_chunks(world.chunks_mut(), pool);

        let mut cx = GpuPhaseContext {
            grid: world.chunks_mut(),
            pool,
            stats: &mut self.stats,
            uploads_left: self.config.max_uploads_per_frame,
            fatal: None,
        };
        self.render_tasks.update(dt, &mut cx);
        if let Some(e) = cx.fatal.take() {
            return Err(e);
        }

        let grid = world.chunks();
        self.in_flight
            .retain(|coord| grid.get_chunk(*coord).is_some_and(|chunk| chunk.is_busy()));
        self.stats.in_flight = self.in_flight.len();

        if self.stats.has_activity() {
            log::debug!("Streaming frame {}: {:?}", self.frame, self.stats);
        }
        Ok(())
    }

    /// Move one chunk toward `desired`.
    ///
    /// A chunk with a promotion in flight is left alone, except that a
    /// promotion aiming above `desired` is asked to stop. Demotion happens
    /// immediately and returns buffers to the pool; promotion is scheduled.
    pub fn set_chunk_state<G>(
        &mut self,
        world: &mut G,
        pool: &mut GpuBufferPool,
        jobs: &AsyncJobManager,
        coord: ChunkCoord,
        desired: ChunkState,
    ) where
        G: StreamableGrid<Tile = T>,
    {
        let Some(chunk) = world.chunks().get_chunk(coord) else {
            log::trace!("set_chunk_state on missing chunk {}", coord);
            return;
        };

        if let Some(task) = chunk.task() {
            if desired < task.target && task.request_stop() {
                log::trace!(
                    "Chunk {}: cancelling promotion to {:?}, now wanted at {:?}",
                    coord,
                    task.target,
                    desired
                );
                self.stats.cancelled += 1;
            }
            return;
        }

        let current = chunk.state();
        let stale = chunk.is_stale();
        if desired > current {
            self.start_promotion(world, jobs, coord, desired);
        } else if desired < current {
            let target = match self.config.demotion {
                DemotionPolicy::Direct => desired,
                DemotionPolicy::StepDown => current.demoted().unwrap_or(desired).max(desired),
            };
            if let Some(gpu) = world.chunks_mut().demote(coord, target) {
                release_gpu(pool, gpu);
            }
            self.stats.demotions += 1;
        } else if stale {
            self.start_promotion(world, jobs, coord, current);
            self.stats.refreshes += 1;
        }
    }

    fn start_promotion<G>(
        &mut self,
        world: &mut G,
        jobs: &AsyncJobManager,
        coord: ChunkCoord,
        target: ChunkState,
    ) where
        G: StreamableGrid<Tile = T>,
    {
        let grid = world.chunks();
        let Some(chunk) = grid.get_chunk(coord) else {
            return;
        };

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let needs_mesh = chunk.state() == ChunkState::DataOnly || chunk.mesh_is_stale();
        let task = if needs_mesh {
            let Some(input) = grid.mesh_input(coord) else {
                return;
            };
            let phase = CpuPhase::new(input, world.mesher(), ticket, self.done_tx.clone());
            InFlight {
                ticket,
                target,
                cpu: Some(jobs.add(phase)),
                gpu: None,
            }
        } else {
            let handle = self
                .render_tasks
                .start(GpuPhase::upload_only(coord, ticket, target));
            InFlight {
                ticket,
                target,
                cpu: None,
                gpu: Some(handle),
            }
        };

        log::trace!("Chunk {}: promoting to {:?} (ticket {})", coord, target, ticket);
        world.chunks_mut().begin_task(coord, task);
        self.in_flight.insert(coord);
        self.stats.promotions += 1;
    }

    /// Drop every chunk nobody touched within the grace period to `DataOnly`.
    ///
    /// Busy chunks are asked to stop and revisited on a later frame.
    pub fn demote_untouched_chunks(&mut self, grid: &mut ChunkGrid<T>, pool: &mut GpuBufferPool) {
        let grace = u64::from(self.config.untouched_grace_frames);
        let frame = self.frame;
        let expired: Vec<ChunkCoord> = self
            .last_touched
            .iter()
            .filter(|&(coord, &seen)| {
                !self.desired.contains_key(coord) && frame.saturating_sub(seen) > grace
            })
            .map(|(&coord, _)| coord)
            .collect();

        for coord in expired {
            let Some(chunk) = grid.get_chunk(coord) else {
                self.last_touched.remove(&coord);
                continue;
            };

            if let Some(task) = chunk.task() {
                if task.request_stop() {
                    self.stats.cancelled += 1;
                }
                continue;
            }

            let current = chunk.state();
            if current > ChunkState::DataOnly {
                let target = match self.config.demotion {
                    DemotionPolicy::Direct => ChunkState::DataOnly,
                    DemotionPolicy::StepDown => current.demoted().unwrap_or(ChunkState::DataOnly),
                };
                if let Some(gpu) = grid.demote(coord, target) {
                    release_gpu(pool, gpu);
                }
                self.stats.evictions += 1;
                if target > ChunkState::DataOnly {
                    continue;
                }
            }
            self.last_touched.remove(&coord);
        }
    }

    fn compute_desired(&mut self, chunk_world_size: Vec2) {
        self.desired.clear();
        let render = self.config.render_range;
        let sim = self.config.simulation_range as i32;

        for &position in self.actors.values() {
            let center = ChunkCoord::from_world_pos(position, chunk_world_size);
            for dy in -sim..=sim {
                for dx in -sim..=sim {
                    let distance = dx.unsigned_abs().max(dy.unsigned_abs());
                    let tier = if distance <= render {
                        ChunkState::HasGpuData
                    } else {
                        ChunkState::HasMesh
                    };
                    self.desired
                        .entry(center.offset(dx, dy))
                        .and_modify(|state| *state = (*state).max(tier))
                        .or_insert(tier);
                }
            }
        }
    }

    /// Turn finished mesh builds into GPU phases.
    ///
    /// A build is published just before its worker records the outcome;
    /// such results wait for the next frame so a GPU phase never runs
    /// alongside the CPU phase of the same chunk.
    fn receive_meshes(&mut self, grid: &mut ChunkGrid<T>) {
        let mut received = std::mem::take(&mut self.deferred);
        while let Ok(done) = self.done_rx.try_recv() {
            received.push(done);
        }

        for done in received {
            let Some(task) = grid.task_for(done.coord, done.ticket) else {
                log::trace!("Discarding stale mesh for chunk {}", done.coord);
                continue;
            };
            if task.cpu.as_ref().is_some_and(|cpu| !cpu.is_finished()) {
                self.deferred.push(done);
                continue;
            }
            let target = task.target;
            if task.is_stop_requested() {
                grid.end_task(done.coord, done.ticket);
                continue;
            }

            match done.result {
                Ok(mesh) => {
                    let phase = GpuPhase::commit(done.coord, done.ticket, target, mesh, done.version);
                    let handle = self.render_tasks.start(phase);
                    grid.attach_gpu_phase(done.coord, done.ticket, handle);
                }
                Err(e) => {
                    log::warn!("Mesh build for chunk {} failed: {}", done.coord, e);
                    grid.end_task(done.coord, done.ticket);
                    self.stats.failures += 1;
                }
            }
        }
    }

    /// Clear tasks whose phases ended without handing the chunk on
    fn sweep_finished(&mut self, grid: &mut ChunkGrid<T>) {
        let mut ended = Vec::new();
        for &coord in &self.in_flight {
            let Some(task) = grid.get_chunk(coord).and_then(|chunk| chunk.task()) else {
                continue;
            };
            let finished = match (&task.cpu, &task.gpu) {
                (_, Some(gpu)) => gpu.is_finished(),
                // A completed build has its result queued on the channel
                (Some(cpu), None) => cpu.is_finished() && cpu.outcome() != TaskOutcome::Completed,
                (None, None) => true,
            };
            if finished {
                let faulted = task
                    .cpu
                    .iter()
                    .chain(task.gpu.iter())
                    .any(|handle| handle.outcome() == TaskOutcome::Faulted);
                ended.push((coord, task.ticket, faulted));
            }
        }

        for (coord, ticket, faulted) in ended {
            if grid.end_task(coord, ticket) {
                log::debug!("Chunk {}: promotion ended early, chunk is free again", coord);
                if faulted {
                    self.stats.failures += 1;
                }
            }
        }
    }

    /// Stop every promotion and drop all chunks to `DataOnly`, returning
    /// their buffers to the pool
    pub fn release_all(&mut self, grid: &mut ChunkGrid<T>, pool: &mut GpuBufferPool) {
        self.render_thread.assert_current("ChunkStreamManager::release_all");

        let mut cx = GpuPhaseContext {
            grid: &mut *grid,
            pool: &mut *pool,
            stats: &mut self.stats,
            uploads_left: 0,
            fatal: None,
        };
        self.render_tasks.stop_all(&mut cx);
        self.deferred.clear();

        for coord in self.in_flight.drain() {
            let ticket = grid.get_chunk(coord).and_then(|chunk| chunk.task()).map(|task| {
                task.request_stop();
                task.ticket
            });
            if let Some(ticket) = ticket {
                grid.end_task(coord, ticket);
            }
        }

        let resident: Vec<ChunkCoord> = [ChunkState::HasMesh, ChunkState::HasGpuData]
            .into_iter()
            .flat_map(|state| grid.coords_in_state(state))
            .collect();
        for &coord in &resident {
            if let Some(gpu) = grid.demote(coord, ChunkState::DataOnly) {
                release_gpu(pool, gpu);
            }
        }

        self.desired.clear();
        self.last_touched.clear();
        log::info!("ChunkStreamManager: released {} resident chunks", resident.len());
    }

    pub fn debug_info(&self, grid: &ChunkGrid<T>) -> StreamDebugInfo {
        let world = grid.chunk_world_size();
        StreamDebugInfo {
            frame: self.frame,
            render_range: self.config.render_range,
            simulation_range: self.config.simulation_range,
            actors: self
                .actors
                .iter()
                .map(|(&id, &position)| ActorDebugInfo {
                    id,
                    position,
                    chunk: ChunkCoord::from_world_pos(position, world),
                })
                .collect(),
            stats: self.stats,
            chunks: grid.debug_chunks(),
        }
    }

    /// Debug snapshot as pretty JSON
    pub fn debug_json(&self, grid: &ChunkGrid<T>) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.debug_info(grid))?)
    }
}
