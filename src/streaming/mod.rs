//! Distance-driven chunk streaming
//!
//! Chunks move along the ladder `DataOnly < HasMesh < HasGpuData`.
//! Promotion runs as a worker mesh build followed by a render-thread
//! commit and upload; demotion is synchronous and returns GPU buffers to
//! the pool.

pub mod chunk;
pub mod grid;
pub mod mesh;
pub mod config;
mod promotion;
pub mod manager;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{Chunk, ChunkCoord, ChunkState, GpuMesh, InFlight};
pub use grid::{ChunkDebugInfo, ChunkGrid, StreamableGrid};
pub use mesh::{ChunkMesher, MeshData, MeshInput, Vertex};
pub use config::{DemotionPolicy, StreamingConfig};
pub use manager::{
    ActorDebugInfo, ActorId, ChunkStreamManager, StreamDebugInfo, StreamingStats,
};
