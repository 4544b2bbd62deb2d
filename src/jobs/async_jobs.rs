//! Fixed worker pool, one coroutine manager per worker thread

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;

use super::coroutine::{Coroutine, TaskHandle, TaskOutcome, TaskWaker};
use super::manager::CoroutineManager;
use crate::core::{Error, FrameTimer, Result};

/// Upper bound on worker threads
pub const MAX_WORKERS: usize = 8;

/// Worker count for a machine with `cpu_count` logical cores.
///
/// One core is left for the render thread.
pub fn default_worker_count(cpu_count: usize) -> usize {
    cpu_count.saturating_sub(1).clamp(1, MAX_WORKERS)
}

struct WorkerQueue {
    incoming: Vec<(Box<dyn Coroutine>, TaskHandle)>,
    shutdown: bool,
}

struct WorkerShared {
    index: usize,
    queue: Mutex<WorkerQueue>,
    wake: Condvar,
    /// Routines owned by the worker's manager, refreshed after every update
    running: AtomicUsize,
}

impl WorkerShared {
    fn lock(&self) -> MutexGuard<'_, WorkerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskWaker for WorkerShared {
    fn wake(&self) {
        // Taking the lock orders the wakeup after the worker's last look at
        // its routines, so the notification cannot be lost
        drop(self.lock());
        self.wake.notify_one();
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

/// Runs coroutines off the render thread.
///
/// Each worker thread owns one [`CoroutineManager`]. New tasks are assigned
/// round-robin and stay on their worker until they finish (no stealing).
pub struct AsyncJobManager {
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
}

impl AsyncJobManager {
    /// Spawn `clamp(cpu_count - 1, 1, 8)` workers
    pub fn new() -> Result<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_workers(default_worker_count(cpus))
    }

    /// Spawn exactly `count` workers (at least one)
    pub fn with_workers(count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let shared = Arc::new(WorkerShared {
                index,
                queue: Mutex::new(WorkerQueue {
                    incoming: Vec::new(),
                    shutdown: false,
                }),
                wake: Condvar::new(),
                running: AtomicUsize::new(0),
            });

            let thread_shared = shared.clone();
            let thread = std::thread::Builder::new()
                .name(format!("chunkstream-worker-{index}"))
                .spawn(move || worker_loop(thread_shared))
                .map_err(|e| Error::Jobs(format!("failed to spawn worker {index}: {e}")))?;

            workers.push(Worker {
                shared,
                thread: Some(thread),
            });
        }

        log::info!("AsyncJobManager: started {} worker threads", count);

        Ok(Self {
            workers,
            next_worker: AtomicUsize::new(0),
        })
    }

    /// Queue a task on the next worker in round-robin order
    pub fn add<C>(&self, task: C) -> TaskHandle
    where
        C: Coroutine + 'static,
    {
        self.add_boxed(Box::new(task))
    }

    pub fn add_boxed(&self, task: Box<dyn Coroutine>) -> TaskHandle {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];
        let waker: Weak<dyn TaskWaker> = Arc::downgrade(&worker.shared) as Weak<WorkerShared>;
        let handle = TaskHandle::with_waker(Some(index), waker);

        let mut queue = worker.shared.lock();
        if queue.shutdown {
            log::warn!("AsyncJobManager: task {} added after shutdown", handle.id());
            handle.finish(TaskOutcome::Cancelled);
            return handle;
        }
        queue.incoming.push((task, handle.clone()));
        drop(queue);
        worker.shared.wake.notify_one();

        handle
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Tasks queued or running on each worker
    pub fn worker_loads(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|worker| {
                let queued = worker.shared.lock().incoming.len();
                queued + worker.shared.running.load(Ordering::Acquire)
            })
            .collect()
    }

    /// Total tasks not yet finished
    pub fn pending_count(&self) -> usize {
        self.worker_loads().iter().sum()
    }

    /// Stop every task and join the worker threads.
    ///
    /// Running tasks are stopped cooperatively, so a task stuck inside a
    /// step delays shutdown until that step returns.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            let mut queue = worker.shared.lock();
            queue.shutdown = true;
            drop(queue);
            worker.shared.wake.notify_all();
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    log::error!("Worker {} panicked during shutdown", worker.shared.index);
                }
            }
        }
    }
}

impl Drop for AsyncJobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<WorkerShared>) {
    let mut manager: CoroutineManager = CoroutineManager::for_worker(shared.index);
    let mut timer = FrameTimer::new();

    loop {
        {
            let mut queue = shared.lock();
            while queue.incoming.is_empty() && !queue.shutdown {
                if manager.is_empty() {
                    queue = shared.wake.wait(queue).unwrap_or_else(PoisonError::into_inner);
                    continue;
                }

                let sleep = manager.next_resume();
                if !sleep.is_zero() {
                    queue = shared
                        .wake
                        .wait_timeout(queue, sleep)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                break;
            }

            if queue.shutdown {
                for (_, handle) in queue.incoming.drain(..) {
                    handle.finish(TaskOutcome::Cancelled);
                }
                drop(queue);
                manager.stop_all(&mut ());
                shared.running.store(0, Ordering::Release);
                log::debug!("Worker {} stopped", shared.index);
                return;
            }

            for (task, handle) in queue.incoming.drain(..) {
                manager.adopt(task, handle);
            }
            shared.running.store(manager.len(), Ordering::Release);
        }

        let running = manager.update(timer.tick(), &mut ());
        shared.running.store(running, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::coroutine::{from_fn, YieldReason};
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    fn wait_until(handle: &TaskHandle, timeout: Duration) -> bool {
        let start = Instant::now();
        while !handle.is_finished() {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_default_worker_count_clamps() {
        assert_eq!(default_worker_count(1), 1);
        assert_eq!(default_worker_count(2), 1);
        assert_eq!(default_worker_count(4), 3);
        assert_eq!(default_worker_count(9), 8);
        assert_eq!(default_worker_count(64), 8);
    }

    #[test]
    fn test_round_robin_assignment() {
        let jobs = AsyncJobManager::with_workers(2).unwrap();

        let first = jobs.add(from_fn(|| YieldReason::Finished));
        let second = jobs.add(from_fn(|| YieldReason::Finished));
        let third = jobs.add(from_fn(|| YieldReason::Finished));

        assert_eq!(first.worker(), Some(0));
        assert_eq!(second.worker(), Some(1));
        assert_eq!(third.worker(), Some(0));
    }

    #[test]
    fn test_task_runs_to_completion() {
        let jobs = AsyncJobManager::with_workers(2).unwrap();
        let steps = Arc::new(AtomicU32::new(0));
        let counter = steps.clone();

        let handle = jobs.add(from_fn(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 4 {
                YieldReason::Continue
            } else {
                YieldReason::Finished
            }
        }));

        assert!(wait_until(&handle, Duration::from_secs(5)));
        assert_eq!(handle.outcome(), TaskOutcome::Completed);
        assert_eq!(steps.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_wait_time_on_worker() {
        let jobs = AsyncJobManager::with_workers(1).unwrap();
        let mut waited = false;
        let start = Instant::now();

        let handle = jobs.add(from_fn(move || {
            if waited {
                return YieldReason::Finished;
            }
            waited = true;
            YieldReason::wait_ms(30)
        }));

        assert!(wait_until(&handle, Duration::from_secs(5)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancel_exits_within_one_step() {
        let jobs = AsyncJobManager::with_workers(1).unwrap();
        let steps = Arc::new(AtomicU32::new(0));
        let counter = steps.clone();

        let handle = jobs.add(from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            YieldReason::wait_ms(5)
        }));

        while steps.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.request_stop();
        let seen = steps.load(Ordering::SeqCst);

        assert!(wait_until(&handle, Duration::from_secs(5)));
        assert_eq!(handle.outcome(), TaskOutcome::Cancelled);
        assert!(steps.load(Ordering::SeqCst) <= seen + 1);
    }

    #[test]
    fn test_stop_wakes_sleeping_worker() {
        let jobs = AsyncJobManager::with_workers(1).unwrap();
        let steps = Arc::new(AtomicU32::new(0));
        let counter = steps.clone();

        let handle = jobs.add(from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            YieldReason::wait_ms(60_000)
        }));

        while steps.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.request_stop();

        assert!(wait_until(&handle, Duration::from_secs(5)));
        assert_eq!(handle.outcome(), TaskOutcome::Cancelled);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fault_does_not_kill_worker() {
        let jobs = AsyncJobManager::with_workers(1).unwrap();

        let faulty = jobs.add(from_fn(|| panic!("bad tile data")));
        assert!(wait_until(&faulty, Duration::from_secs(5)));
        assert_eq!(faulty.outcome(), TaskOutcome::Faulted);

        let healthy = jobs.add(from_fn(|| YieldReason::Finished));
        assert!(wait_until(&healthy, Duration::from_secs(5)));
        assert_eq!(healthy.outcome(), TaskOutcome::Completed);
    }

    #[test]
    fn test_shutdown_cancels_running_tasks() {
        let mut jobs = AsyncJobManager::with_workers(2).unwrap();
        let handle = jobs.add(from_fn(|| YieldReason::wait_ms(10_000)));

        std::thread::sleep(Duration::from_millis(20));
        jobs.shutdown();

        assert_eq!(handle.outcome(), TaskOutcome::Cancelled);

        let late = jobs.add(from_fn(|| YieldReason::Finished));
        assert_eq!(late.outcome(), TaskOutcome::Cancelled);
    }
}
