//! Resumable units of work with explicit yield reasons.
//!
//! A coroutine is a state machine that is advanced one step at a time by a
//! [`CoroutineManager`](super::CoroutineManager). Each step returns a
//! [`YieldReason`] telling the manager when to resume it. Suspension only
//! happens at these step boundaries, never inside a step.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// What a coroutine step asks of its scheduler
#[derive(Clone, Debug)]
pub enum YieldReason {
    /// Resume on the next tick
    Continue,
    /// Resume once at least this much scheduler time has elapsed
    WaitTime(Duration),
    /// Resume once another task has finished
    WaitFor(TaskHandle),
    /// The coroutine has completed its work
    Finished,
    /// The coroutine observed a stop request and exited early
    Cancelled,
}

impl YieldReason {
    /// Wait for `ms` milliseconds of scheduler time
    pub fn wait_ms(ms: u64) -> Self {
        Self::WaitTime(Duration::from_millis(ms))
    }
}

/// Final (or current) state of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskOutcome {
    Running = 0,
    Completed = 1,
    Cancelled = 2,
    /// A step panicked; the task was dropped
    Faulted = 3,
}

impl TaskOutcome {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Completed,
            2 => Self::Cancelled,
            3 => Self::Faulted,
            _ => Self::Running,
        }
    }
}

/// Wakes the thread that advances a task, so a stop request is seen
/// without waiting out the task's current sleep
pub(crate) trait TaskWaker: Send + Sync {
    fn wake(&self);
}

struct TaskState {
    id: u64,
    worker: Option<usize>,
    stop: AtomicBool,
    outcome: AtomicU8,
    waker: Option<Weak<dyn TaskWaker>>,
}

/// Shared handle to a scheduled coroutine.
///
/// Cloning is cheap; all clones observe the same task.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    pub(crate) fn new(worker: Option<usize>) -> Self {
        Self::build(worker, None)
    }

    /// Handle whose stop requests also wake its owning thread
    pub(crate) fn with_waker(worker: Option<usize>, waker: Weak<dyn TaskWaker>) -> Self {
        Self::build(worker, Some(waker))
    }

    fn build(worker: Option<usize>, waker: Option<Weak<dyn TaskWaker>>) -> Self {
        Self {
            state: Arc::new(TaskState {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                worker,
                stop: AtomicBool::new(false),
                outcome: AtomicU8::new(TaskOutcome::Running as u8),
                waker,
            }),
        }
    }

    /// Unique id of this task
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Index of the worker thread the task was assigned to,
    /// `None` for tasks run by a thread-local manager
    pub fn worker(&self) -> Option<usize> {
        self.state.worker
    }

    /// Whether the task has stopped running, for any reason
    pub fn is_finished(&self) -> bool {
        self.outcome() != TaskOutcome::Running
    }

    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome::from_u8(self.state.outcome.load(Ordering::Acquire))
    }

    /// Ask the task to stop. Observed at its next yield boundary.
    pub fn request_stop(&self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(waker) = self.state.waker.as_ref().and_then(Weak::upgrade) {
            waker.wake();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.stop.load(Ordering::Acquire)
    }

    /// Record the final outcome. The first recorded outcome wins.
    pub(crate) fn finish(&self, outcome: TaskOutcome) {
        let _ = self.state.outcome.compare_exchange(
            TaskOutcome::Running as u8,
            outcome as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("worker", &self.worker())
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Describes the context a family of coroutines is advanced with.
///
/// Worker threads advance coroutines with no context ([`Detached`]); the
/// render thread lends out borrowed state for the duration of one update.
pub trait CoroutineHost: 'static {
    type Context<'a>;
}

/// Host for coroutines that need no external state
pub struct Detached;

impl CoroutineHost for Detached {
    type Context<'a> = ();
}

/// A resumable unit of work.
///
/// Implementations that name a concrete host should spell the context as
/// `<Host as CoroutineHost>::Context<'_>` in their signatures.
pub trait Coroutine<H: CoroutineHost = Detached>: Send {
    /// Run one step
    fn advance(&mut self, cx: &mut H::Context<'_>) -> YieldReason;

    /// Called instead of `advance` once a stop was requested.
    /// Must release anything the coroutine acquired so far.
    fn on_stop(&mut self, _cx: &mut H::Context<'_>) {}
}

/// Coroutine backed by a closure, see [`from_fn`]
pub struct FromFn<F>(F);

/// Build a detached coroutine from a step closure
pub fn from_fn<F>(step: F) -> FromFn<F>
where
    F: FnMut() -> YieldReason + Send,
{
    FromFn(step)
}

impl<F> Coroutine<Detached> for FromFn<F>
where
    F: FnMut() -> YieldReason + Send,
{
    fn advance(&mut self, _cx: &mut <Detached as CoroutineHost>::Context<'_>) -> YieldReason {
        (self.0)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_first_outcome_wins() {
        let handle = TaskHandle::new(None);
        assert!(!handle.is_finished());
        handle.finish(TaskOutcome::Completed);
        handle.finish(TaskOutcome::Faulted);
        assert_eq!(handle.outcome(), TaskOutcome::Completed);
    }

    #[test]
    fn test_handle_clones_share_state() {
        let handle = TaskHandle::new(Some(3));
        let other = handle.clone();
        other.request_stop();
        assert!(handle.is_stop_requested());
        assert_eq!(handle.id(), other.id());
        assert_eq!(handle.worker(), Some(3));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TaskHandle::new(None);
        let b = TaskHandle::new(None);
        assert_ne!(a.id(), b.id());
    }
}
