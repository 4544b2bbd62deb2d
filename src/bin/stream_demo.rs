//! Headless streaming demo: actors wander over a generated world while the
//! stream manager promotes and evicts chunks around them.
//!
//! Usage: cargo run --release --bin stream_demo -- [OPTIONS]
//!
//! Options:
//!   --world <KIND>     terrain | tiles (default: terrain)
//!   --frames <N>       Frames to simulate (default: 600)
//!   --actors <N>       Wandering actors (default: 2)
//!   --seed <SEED>      World seed (default: 12345)
//!   --speed <UNITS>    Actor speed in world units per second (default: 40.0)
//!   --config <PATH>    Streaming config JSON (default: built-in defaults)
//!   --budget-mb <MB>   Host GPU budget (default: unlimited)
//!   --dump <PATH>      Write the final debug snapshot as JSON

use std::path::PathBuf;
use std::time::Duration;

use chunkstream::core::types::Vec2;
use chunkstream::core::{FrameTimer, Result};
use chunkstream::gpu::{GpuBufferPool, HostBackend};
use chunkstream::jobs::AsyncJobManager;
use chunkstream::streaming::{ChunkState, ChunkStreamManager, StreamableGrid, StreamingConfig};
use chunkstream::terrain::{TerrainGrid, TerrainParams, TileMapGrid};

/// Simulated frame length
const FRAME: Duration = Duration::from_millis(16);

struct DemoArgs {
    frames: u64,
    actors: usize,
    seed: u32,
    speed: f32,
    config: StreamingConfig,
    budget_mb: Option<u64>,
    dump: Option<PathBuf>,
}

fn main() {
    chunkstream::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let world = parse_str_arg(&args, "--world").unwrap_or_else(|| "terrain".to_string());

    let result = parse_args(&args).and_then(|demo| match world.as_str() {
        "tiles" => run(TileMapGrid::new(demo.seed, 16, 1.0, 8)?, &demo),
        _ => {
            let params = TerrainParams {
                seed: demo.seed,
                ..Default::default()
            };
            run(TerrainGrid::new(params, 16, 2.0)?, &demo)
        }
    });

    if let Err(e) = result {
        log::error!("stream_demo failed: {}", e);
        std::process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<DemoArgs> {
    let config = match parse_str_arg(args, "--config") {
        Some(path) => StreamingConfig::load(&PathBuf::from(path))?,
        None => StreamingConfig::default(),
    };

    Ok(DemoArgs {
        frames: parse_u64_arg(args, "--frames").unwrap_or(600),
        actors: parse_u64_arg(args, "--actors").unwrap_or(2) as usize,
        seed: parse_u64_arg(args, "--seed").unwrap_or(12345) as u32,
        speed: parse_f32_arg(args, "--speed").unwrap_or(40.0),
        config,
        budget_mb: parse_u64_arg(args, "--budget-mb"),
        dump: parse_str_arg(args, "--dump").map(PathBuf::from),
    })
}

fn run<G: StreamableGrid>(mut world: G, demo: &DemoArgs) -> Result<()> {
    let jobs = match demo.config.worker_threads {
        Some(count) => AsyncJobManager::with_workers(count)?,
        None => AsyncJobManager::new()?,
    };
    let backend = match demo.budget_mb {
        Some(mb) => HostBackend::with_budget(mb * 1024 * 1024),
        None => HostBackend::new(),
    };
    let mut pool = GpuBufferPool::new(Box::new(backend));
    let mut manager: ChunkStreamManager<G::Tile> = ChunkStreamManager::new(demo.config.clone())?;

    // Actors start spread around the origin and walk outward on a spiral
    let actors: Vec<_> = (0..demo.actors)
        .map(|i| {
            let angle = i as f32 / demo.actors.max(1) as f32 * std::f32::consts::TAU;
            manager.register_actor(Vec2::from_angle(angle) * 32.0)
        })
        .collect();

    let mut timer = FrameTimer::new();
    for frame in 0..demo.frames {
        let t = frame as f32 * FRAME.as_secs_f32();
        for (i, &actor) in actors.iter().enumerate() {
            let phase = i as f32 * 1.7;
            let radius = 32.0 + demo.speed * t * 0.25;
            let position = Vec2::from_angle(t * 0.2 + phase) * radius;
            manager.set_actor_position(actor, position);
        }

        manager.update(FRAME, &mut world, &mut pool, &jobs)?;
        pool.process_freed();
        timer.tick();

        if frame % 60 == 0 {
            let grid = world.chunks();
            log::info!(
                "frame {:>5}: {} chunks ({} gpu, {} mesh), {} in flight, pool {:?}",
                frame,
                grid.len(),
                grid.count_in_state(ChunkState::HasGpuData),
                grid.count_in_state(ChunkState::HasMesh),
                manager.stats().in_flight,
                pool.stats()
            );
        }
    }

    let desynced = world.chunks().desynced_chunks();
    if !desynced.is_empty() {
        log::warn!("{} chunks out of sync: {:?}", desynced.len(), desynced);
    }
    if let Some(path) = &demo.dump {
        std::fs::write(path, manager.debug_json(world.chunks())?)?;
        log::info!("Wrote debug snapshot to {}", path.display());
    }

    log::info!(
        "Simulated {} frames, worst frame {:.2}ms, {} bytes of buffers",
        timer.frame_count(),
        timer.worst_delta().as_secs_f64() * 1000.0,
        pool.allocated_bytes()
    );

    manager.release_all(world.chunks_mut(), &mut pool);
    pool.process_freed();
    pool.destroy_all();
    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
