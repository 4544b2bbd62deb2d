//! Frame timing utilities

use std::time::{Duration, Instant};

/// Tracks the time between ticks of a loop.
///
/// Used by the render loop and by every job worker to feed elapsed time
/// into their coroutine managers.
pub struct FrameTimer {
    last_frame: Instant,
    delta: Duration,
    frame_count: u64,
    /// Longest delta seen since creation
    worst_delta: Duration,
}

impl FrameTimer {
    /// Create a new frame timer
    pub fn new() -> Self {
        Self {
            last_frame: Instant::now(),
            delta: Duration::ZERO,
            frame_count: 0,
            worst_delta: Duration::ZERO,
        }
    }

    /// Call once per frame to update timing. Returns the new delta.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        self.delta = now - self.last_frame;
        self.last_frame = now;
        self.frame_count += 1;
        self.worst_delta = self.worst_delta.max(self.delta);
        self.delta
    }

    /// Get delta time in seconds
    pub fn delta_secs(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// Get delta time as Duration
    pub fn delta(&self) -> Duration {
        self.delta
    }

    /// Get total frame count
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Longest frame so far
    pub fn worst_delta(&self) -> Duration {
        self.worst_delta
    }

    /// Time since the last tick, without advancing
    pub fn since_last_tick(&self) -> Duration {
        self.last_frame.elapsed()
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}
