//! Cooperative job system
//!
//! - Coroutine: resumable step function with explicit yield reasons
//! - CoroutineManager: per-thread scheduler advancing a set of coroutines
//! - AsyncJobManager: fixed worker pool, one manager per worker thread
//! - RenderThread: affinity guard for calls that must stay on the render thread

pub mod coroutine;
pub mod manager;
pub mod async_jobs;
pub mod render_thread;

pub use coroutine::{
    Coroutine, CoroutineHost, Detached, FromFn, TaskHandle, TaskOutcome, YieldReason, from_fn,
};
pub use manager::CoroutineManager;
pub use async_jobs::{AsyncJobManager, default_worker_count, MAX_WORKERS};
pub use render_thread::RenderThread;
