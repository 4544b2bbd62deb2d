//! Error types for the chunk streaming engine

use thiserror::Error;

use crate::streaming::ChunkCoord;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// The GPU backend could not provide memory for a new buffer.
    /// Rendering cannot continue without it, callers treat this as fatal.
    #[error("GPU memory exhausted: {0}")]
    GpuExhausted(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Chunk generation failed at {coord}: {reason}")]
    Generation { coord: ChunkCoord, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job system error: {0}")]
    Jobs(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a generation failure at `coord`
    pub fn generation(coord: ChunkCoord, reason: impl Into<String>) -> Self {
        Self::Generation { coord, reason: reason.into() }
    }

    /// Whether this error must stop the frame loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::GpuExhausted(_))
    }
}
