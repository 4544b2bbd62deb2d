//! Chunkstream - distance-driven chunk streaming
//!
//! Chunks climb a residency ladder (raw data, CPU mesh, GPU buffers) as
//! actors approach and fall back as they leave. Mesh builds run on a
//! cooperative job system; GPU buffers come from a pool with one-frame
//! deferred reuse.

pub mod core;
pub mod math;
pub mod jobs;
pub mod gpu;
pub mod streaming;
pub mod terrain;
