//! Render-thread affinity guard
//!
//! GPU buffer creation and upload must happen on the thread that owns the
//! graphics context. Calling them from anywhere else corrupts driver state,
//! so violations abort with a panic instead of being reported as errors.

use std::thread::{self, ThreadId};

/// Identity of the thread allowed to issue GPU calls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderThread {
    id: ThreadId,
}

impl RenderThread {
    /// Bind to the calling thread
    pub fn current() -> Self {
        Self { id: thread::current().id() }
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }

    /// Panic unless called on the bound thread
    #[track_caller]
    pub fn assert_current(&self, operation: &str) {
        if !self.is_current() {
            let caller = thread::current();
            log::error!(
                "{} called off the render thread (from {:?} / {:?})",
                operation,
                caller.name(),
                caller.id()
            );
            panic!("thread affinity violation: {operation} must run on the render thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_thread_passes() {
        let render = RenderThread::current();
        assert!(render.is_current());
        render.assert_current("upload");
    }

    #[test]
    fn test_other_thread_panics() {
        let render = RenderThread::current();
        let result = thread::spawn(move || render.assert_current("upload")).join();
        assert!(result.is_err());
    }
}
