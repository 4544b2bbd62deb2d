use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion, black_box};

use chunkstream::core::types::{UVec2, Vec2};
use chunkstream::gpu::{GpuBufferPool, HostBackend, VertexFormat};
use chunkstream::jobs::AsyncJobManager;
use chunkstream::streaming::{
    ChunkCoord, ChunkStreamManager, MeshInput, StreamableGrid, StreamingConfig,
};
use chunkstream::terrain::{TerrainGrid, TerrainParams, TileMapGrid};

fn mesh_input<T>(coord: ChunkCoord, size: u32, tile_size: f32, tiles: Vec<T>) -> MeshInput<T> {
    let tile_size = Vec2::splat(tile_size);
    MeshInput {
        coord,
        version: 0,
        chunk_size: UVec2::splat(size),
        tile_size,
        origin: coord.world_origin(tile_size * size as f32),
        tiles: Arc::from(tiles),
    }
}

fn bench_heightmap_mesh_32(c: &mut Criterion) {
    let mut grid = TerrainGrid::new(TerrainParams::default(), 32, 1.0).unwrap();
    let coord = ChunkCoord::new(3, -2);
    let tiles = grid.generate_chunk_data(coord).unwrap();
    let input = mesh_input(coord, 32, 1.0, tiles);
    let mesher = grid.mesher();

    c.bench_function("heightmap_mesh_32", |b| {
        b.iter(|| mesher.build_mesh(black_box(&input)).unwrap());
    });
}

fn bench_heightmap_generate_32(c: &mut Criterion) {
    let mut grid = TerrainGrid::new(TerrainParams::default(), 32, 1.0).unwrap();

    c.bench_function("heightmap_generate_32", |b| {
        let mut x = 0;
        b.iter(|| {
            x += 1;
            grid.generate_chunk_data(black_box(ChunkCoord::new(x, 0))).unwrap()
        });
    });
}

fn bench_tilemap_mesh_32(c: &mut Criterion) {
    let mut grid = TileMapGrid::new(7, 32, 1.0, 8).unwrap();
    let coord = ChunkCoord::new(0, 0);
    let tiles = grid.generate_chunk_data(coord).unwrap();
    let input = mesh_input(coord, 32, 1.0, tiles);
    let mesher = grid.mesher();

    c.bench_function("tilemap_mesh_32", |b| {
        b.iter(|| mesher.build_mesh(black_box(&input)).unwrap());
    });
}

fn bench_pool_rent_free_cycle(c: &mut Criterion) {
    let mut pool = GpuBufferPool::new(Box::new(HostBackend::new()));

    c.bench_function("pool_rent_free_cycle", |b| {
        b.iter(|| {
            let vertices = pool.allocate_buffer(VertexFormat::PosUvNormalColor).unwrap();
            let indices = pool.rent_index_buffer(black_box(Some(6 * 32 * 32))).unwrap();
            pool.free_buffer(vertices);
            pool.free_buffer(indices);
            pool.process_freed();
        });
    });
}

fn bench_stream_update_steady(c: &mut Criterion) {
    let config = StreamingConfig {
        render_range: 2,
        simulation_range: 5,
        ..Default::default()
    };
    let mut world = TerrainGrid::new(TerrainParams::default(), 16, 1.0).unwrap();
    let mut pool = GpuBufferPool::new(Box::new(HostBackend::new()));
    let jobs = AsyncJobManager::with_workers(2).unwrap();
    let mut manager = ChunkStreamManager::new(config).unwrap();
    manager.register_actor(Vec2::new(8.0, 8.0));

    // Warm up until every chunk in range is resident
    for _ in 0..2000 {
        manager
            .update(Duration::from_millis(16), &mut world, &mut pool, &jobs)
            .unwrap();
        pool.process_freed();
        if manager.is_idle() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    c.bench_function("stream_update_steady_121_chunks", |b| {
        b.iter(|| {
            manager
                .update(black_box(Duration::from_millis(16)), &mut world, &mut pool, &jobs)
                .unwrap();
            pool.process_freed();
        });
    });
}

criterion_group!(
    benches,
    bench_heightmap_mesh_32,
    bench_heightmap_generate_32,
    bench_tilemap_mesh_32,
    bench_pool_rent_free_cycle,
    bench_stream_update_steady,
);
criterion_main!(benches);
