//! GPU buffer management for streamed chunks
//!
//! - GpuBackend: raw device operations (wgpu, or host memory when headless)
//! - GpuBuffer: a pooled vertex or index buffer owned by one chunk at a time
//! - GpuBufferPool: free lists with one-frame deferred reuse

pub mod backend;
pub mod buffer;
pub mod pool;

pub use backend::{GpuBackend, HostBackend, WgpuBackend};
pub use buffer::{BufferId, BufferKind, BufferResource, GpuBuffer, Index, VertexFormat, INDEX_STRIDE};
pub use pool::{GpuBufferPool, PoolStats, INDEX_WASTE_FACTOR};
