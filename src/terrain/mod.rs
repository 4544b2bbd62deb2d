//! Streamable worlds built on the chunk grid
//!
//! - TerrainGrid: FBM heightfield, lit surface meshes
//! - TileMapGrid: noise-filled tile map, atlas-textured quads

pub mod generator;
pub use generator::{TerrainGenerator, TerrainParams};

pub mod heightmap;
pub use heightmap::{HeightmapMesher, TerrainGrid, TerrainVertex};

pub mod tilemap;
pub use tilemap::{TileId, TileMapGrid, TileMapMesher, TileVertex, EMPTY_TILE};
