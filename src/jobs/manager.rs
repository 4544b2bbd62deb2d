//! Per-thread cooperative scheduler

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use super::coroutine::{Coroutine, CoroutineHost, Detached, TaskHandle, TaskOutcome, YieldReason};

/// How often a routine blocked on another task is re-polled when its
/// owner would otherwise sleep
pub const WAIT_FOR_POLL_INTERVAL: Duration = Duration::from_millis(1);

enum Resume {
    Now,
    At(Duration),
    After(TaskHandle),
}

struct RunningRoutine<H: CoroutineHost> {
    body: Box<dyn Coroutine<H>>,
    handle: TaskHandle,
    resume: Resume,
}

/// Advances a set of coroutines, one step per routine per update.
///
/// A manager is owned by exactly one thread. Started routines do not run
/// until the next [`update`](Self::update).
pub struct CoroutineManager<H: CoroutineHost = Detached> {
    routines: Vec<RunningRoutine<H>>,
    /// Scheduler clock, advanced by the `dt` passed to `update`
    elapsed: Duration,
    /// Worker index stamped on handles created by this manager
    worker: Option<usize>,
}

impl<H: CoroutineHost> CoroutineManager<H> {
    /// Create a manager for the calling thread
    pub fn new() -> Self {
        Self {
            routines: Vec::new(),
            elapsed: Duration::ZERO,
            worker: None,
        }
    }

    /// Create a manager owned by job worker `index`
    pub fn for_worker(index: usize) -> Self {
        Self {
            worker: Some(index),
            ..Self::new()
        }
    }

    /// Schedule a coroutine. It is first advanced on the next update.
    pub fn start<C>(&mut self, body: C) -> TaskHandle
    where
        C: Coroutine<H> + 'static,
    {
        let handle = TaskHandle::new(self.worker);
        self.adopt(Box::new(body), handle.clone());
        handle
    }

    /// Schedule an already boxed coroutine under an existing handle
    pub(crate) fn adopt(&mut self, body: Box<dyn Coroutine<H>>, handle: TaskHandle) {
        self.routines.push(RunningRoutine {
            body,
            handle,
            resume: Resume::Now,
        });
    }

    /// Advance every routine by one step.
    ///
    /// Returns the number of routines still running afterwards.
    pub fn update(&mut self, dt: Duration, cx: &mut H::Context<'_>) -> usize {
        self.elapsed += dt;
        let now = self.elapsed;
        self.routines.retain_mut(|routine| !Self::step(routine, now, cx));
        self.routines.len()
    }

    /// Returns true when the routine is done and should be dropped
    fn step(routine: &mut RunningRoutine<H>, now: Duration, cx: &mut H::Context<'_>) -> bool {
        if routine.handle.is_stop_requested() {
            let stopped = panic::catch_unwind(AssertUnwindSafe(|| routine.body.on_stop(cx)));
            if let Err(payload) = stopped {
                log::error!(
                    "Task {} faulted while stopping: {}",
                    routine.handle.id(),
                    panic_message(payload.as_ref())
                );
            }
            routine.handle.finish(TaskOutcome::Cancelled);
            return true;
        }

        match &routine.resume {
            Resume::At(at) if *at > now => return false,
            Resume::After(other) if !other.is_finished() => return false,
            _ => {}
        }
        routine.resume = Resume::Now;

        match panic::catch_unwind(AssertUnwindSafe(|| routine.body.advance(cx))) {
            Ok(YieldReason::Continue) => false,
            Ok(YieldReason::WaitTime(duration)) => {
                routine.resume = Resume::At(now + duration);
                false
            }
            Ok(YieldReason::WaitFor(other)) => {
                routine.resume = Resume::After(other);
                false
            }
            Ok(YieldReason::Finished) => {
                routine.handle.finish(TaskOutcome::Completed);
                true
            }
            Ok(YieldReason::Cancelled) => {
                routine.handle.finish(TaskOutcome::Cancelled);
                true
            }
            Err(payload) => {
                log::error!(
                    "Task {} faulted: {}",
                    routine.handle.id(),
                    panic_message(payload.as_ref())
                );
                routine.handle.finish(TaskOutcome::Faulted);
                true
            }
        }
    }

    /// Stop every routine now, letting each release what it holds
    pub fn stop_all(&mut self, cx: &mut H::Context<'_>) {
        for routine in &self.routines {
            routine.handle.request_stop();
        }
        self.routines.retain_mut(|routine| !Self::step(routine, Duration::ZERO, cx));
    }

    /// How long the owner may sleep before some routine can make progress.
    /// Zero if a routine is runnable right now.
    pub fn next_resume(&self) -> Duration {
        self.routines
            .iter()
            .map(|routine| {
                if routine.handle.is_stop_requested() {
                    return Duration::ZERO;
                }
                match &routine.resume {
                    Resume::Now => Duration::ZERO,
                    Resume::At(at) => at.saturating_sub(self.elapsed),
                    Resume::After(other) if other.is_finished() => Duration::ZERO,
                    Resume::After(_) => WAIT_FOR_POLL_INTERVAL,
                }
            })
            .min()
            .unwrap_or(Duration::MAX)
    }

    /// Number of running routines
    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    /// Scheduler time accumulated so far
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl<H: CoroutineHost> Default for CoroutineManager<H> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
