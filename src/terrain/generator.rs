//! Noise-based height generation

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use crate::core::types::{Vec2, Vec3};

/// Parameters controlling terrain generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainParams {
    pub seed: u32,
    pub scale: f32,        // Horizontal scale (larger = smoother)
    pub height_scale: f32, // Vertical scale (max height)
    pub octaves: u32,      // FBM octaves (detail levels)
    pub persistence: f32,  // FBM persistence (0.5 typical)
    pub lacunarity: f32,   // FBM lacunarity (2.0 typical)
    pub sea_level: f32,    // Height below which is "water"
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            scale: 100.0,
            height_scale: 64.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            sea_level: 20.0,
        }
    }
}

/// Procedural height source using fractal Brownian motion (FBM).
///
/// Pure function of world position, so chunks sampled independently on
/// different threads agree on their shared edges.
pub struct TerrainGenerator {
    params: TerrainParams,
    noise: Fbm<Perlin>,
}

impl TerrainGenerator {
    pub fn new(params: TerrainParams) -> Self {
        let noise = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence as f64)
            .set_lacunarity(params.lacunarity as f64);

        Self { params, noise }
    }

    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    /// Terrain height at a world position on the ground plane
    pub fn height_at(&self, pos: Vec2) -> f32 {
        let nx = (pos.x / self.params.scale) as f64;
        let ny = (pos.y / self.params.scale) as f64;

        // Noise is roughly [-1, 1]; map to [0, height_scale]
        let normalized = ((self.noise.get([nx, ny]) + 1.0) / 2.0).clamp(0.0, 1.0);
        (normalized * self.params.height_scale as f64) as f32
    }

    /// Surface normal from central differences over `step`
    pub fn normal_at(&self, pos: Vec2, step: f32) -> Vec3 {
        let dx = self.height_at(pos + Vec2::new(step, 0.0)) - self.height_at(pos - Vec2::new(step, 0.0));
        let dy = self.height_at(pos + Vec2::new(0.0, step)) - self.height_at(pos - Vec2::new(0.0, step));
        Vec3::new(-dx, 2.0 * step, -dy).try_normalize().unwrap_or(Vec3::Y)
    }

    /// Heights of a `size` x `size` block of tile corners, row-major,
    /// starting at `origin`
    pub fn sample_block(&self, origin: Vec2, size: u32, tile_size: Vec2) -> Vec<f32> {
        let mut heights = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                heights.push(self.height_at(origin + Vec2::new(x as f32, y as f32) * tile_size));
            }
        }
        heights
    }

    /// Rough min/max height over a region, from its corners and center
    pub fn height_bounds(&self, min: Vec2, max: Vec2) -> (f32, f32) {
        let heights = [
            self.height_at(min),
            self.height_at(Vec2::new(max.x, min.y)),
            self.height_at(Vec2::new(min.x, max.y)),
            self.height_at(max),
            self.height_at((min + max) * 0.5),
        ];

        let min_h = heights.iter().copied().fold(f32::INFINITY, f32::min);
        let max_h = heights.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (min_h, max_h)
    }
}
