//! Bounded worker pool with adaptive sizing and staged join
//!
//! The pool dispatches opaque work items to long-lived worker threads. Its
//! size stays within `[core_pool_size, maximum_pool_size]`: core workers are
//! started as work arrives, extra workers only when the queue is full.
//!
//! `join()` lets a single producer run multi-stage pipelines: it pauses the
//! queue, waits until every admitted item was processed and every worker
//! retired (running its handler's `shutdown` hook), then restarts the same
//! number of workers and resumes the queue.
//!
//! # State machine
//!
//! ```text
//! Running ──shutdown()──────► Shutdown ──last worker exits──► Terminated
//!    │                                                            ▲
//!    └──shutdown_now()──────► Stop ─────last worker exits─────────┘
//! ```

use crate::config::{PoolConfig, PoolSizeAdaptation};
use crate::error::{PoolError, PoolResult, WorkerError};
use crate::pool::queue::{QueueStats, WorkQueue};
use crate::pool::worker::{WorkHandler, WorkerFactory, WorkerShared};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Consecutive creation failures after which the pool shrinks aggressively
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Lifecycle state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    /// Accepting and processing work
    Running,

    /// No new work accepted, remaining items are processed
    Shutdown,

    /// Forced stop, undispatched items were handed back
    Stop,

    /// All workers exited
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Running => "running",
            RunState::Shutdown => "shut down",
            RunState::Stop => "stopped",
            RunState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Which bound the pool was growing toward when creation failed
#[derive(Debug, Clone, Copy)]
enum Bound {
    Core,
    Maximum,
}

struct PoolState<T> {
    run_state: RunState,
    workers: HashMap<usize, Arc<WorkerShared<T>>>,
    handles: Vec<JoinHandle<()>>,
    core_pool_size: usize,
    maximum_pool_size: usize,
    largest_pool_size: usize,
    next_id: usize,
    consecutive_failures: u32,
}

impl<T> PoolState<T> {
    fn pool_size(&self) -> usize {
        self.workers.len()
    }
}

struct PoolInner<T, F> {
    factory: F,
    queue: WorkQueue<T>,
    state: Mutex<PoolState<T>>,
    termination: Condvar,
    adaptation: PoolSizeAdaptation,
    completed: AtomicU64,
}

/// Bounded pool of worker threads fed by a single producer
pub struct WorkerPool<T, F>
where
    T: Send + 'static,
    F: WorkerFactory<T>,
{
    inner: Arc<PoolInner<T, F>>,
}

impl<T, F> WorkerPool<T, F>
where
    T: Send + 'static,
    F: WorkerFactory<T>,
{
    /// Create a new pool; no worker is started until work arrives or
    /// `prestart_core_workers` is called
    pub fn new(config: &PoolConfig, factory: F) -> PoolResult<Self> {
        if config.maximum_pool_size == 0 || config.core_pool_size > config.maximum_pool_size {
            return Err(PoolError::InvalidBounds {
                core: config.core_pool_size,
                max: config.maximum_pool_size,
            });
        }

        let inner = PoolInner {
            factory,
            queue: WorkQueue::new(config.queue_size),
            state: Mutex::new(PoolState {
                run_state: RunState::Running,
                workers: HashMap::new(),
                handles: Vec::new(),
                core_pool_size: config.core_pool_size,
                maximum_pool_size: config.maximum_pool_size,
                largest_pool_size: 0,
                next_id: 0,
                consecutive_failures: 0,
            }),
            termination: Condvar::new(),
            adaptation: config.adaptation,
            completed: AtomicU64::new(0),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Submit an item
    ///
    /// Starts a core worker for it while below `core_pool_size`, otherwise
    /// queues it. When the queue is full the pool grows up to
    /// `maximum_pool_size`; beyond that the call blocks until space frees up.
    pub fn add_work(&self, item: T) -> PoolResult<()> {
        let inner = &self.inner;
        let mut item = item;
        let mut last_failure = None;

        {
            let mut state = inner.state.lock();
            if state.run_state != RunState::Running {
                return Err(PoolError::Rejected {
                    state: state.run_state,
                });
            }

            if state.pool_size() < state.core_pool_size {
                match inner.add_worker(&mut state, Some(item)) {
                    Ok(()) => return Ok(()),
                    Err((e, back)) => {
                        inner.on_creation_failure(&mut state, Bound::Core, &e);
                        last_failure = Some(e);
                        item = back.ok_or(PoolError::Rejected {
                            state: state.run_state,
                        })?;
                    }
                }
            }
        }

        if !inner.queue.is_blocked() {
            match inner.queue.offer(item) {
                Ok(()) => return inner.ensure_queued_work_handled(),
                Err(back) => item = back,
            }
        }

        {
            let mut state = inner.state.lock();
            if state.run_state == RunState::Running
                && !inner.queue.is_blocked()
                && state.pool_size() < state.maximum_pool_size
            {
                match inner.add_worker(&mut state, Some(item)) {
                    Ok(()) => return Ok(()),
                    Err((e, back)) => {
                        inner.on_creation_failure(&mut state, Bound::Maximum, &e);
                        last_failure = Some(e);
                        item = back.ok_or(PoolError::Rejected {
                            state: state.run_state,
                        })?;
                    }
                }
            }

            if state.pool_size() == 0 {
                if let Some(e) = last_failure {
                    return Err(PoolError::NoWorkers(e));
                }
            }
        }

        inner.queue.put(item).map_err(|_| PoolError::Rejected {
            state: self.run_state(),
        })
    }

    /// Submit an item, then block until the queue is fully drained
    pub fn add_work_and_wait(&self, item: T) -> PoolResult<()> {
        self.add_work(item)?;
        self.inner.queue.wait_until_empty();
        Ok(())
    }

    /// Start one idle core worker if the pool is below `core_pool_size`
    pub fn prestart_core_worker(&self) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.run_state != RunState::Running || state.pool_size() >= state.core_pool_size {
            return false;
        }

        match inner.add_worker(&mut state, None) {
            Ok(()) => true,
            Err((e, _)) => {
                inner.on_creation_failure(&mut state, Bound::Core, &e);
                false
            }
        }
    }

    /// Start idle workers up to `core_pool_size`, returning how many started
    pub fn prestart_core_workers(&self) -> usize {
        let mut started = 0;
        while self.prestart_core_worker() {
            started += 1;
        }
        started
    }

    /// Wait until every admitted item was processed, then restart the workers
    ///
    /// New enqueues are paused for the duration of the call. Every worker
    /// retires (its handler's `shutdown` hook runs) before the same number of
    /// fresh workers is started.
    pub fn join(&self) {
        let inner = &self.inner;
        inner.queue.block_and_flush();

        let (restart, handles) = {
            let mut state = inner.state.lock();
            let restart = state.pool_size();

            for worker in state.workers.values() {
                worker.interrupt();
            }
            inner.queue.wake_takers();

            while state.pool_size() > 0 {
                inner.termination.wait(&mut state);
            }

            (restart, std::mem::take(&mut state.handles))
        };

        join_handles(handles);

        {
            let mut state = inner.state.lock();
            if state.run_state == RunState::Running {
                for _ in 0..restart {
                    if let Err((e, _)) = inner.add_worker(&mut state, None) {
                        inner.on_creation_failure(&mut state, Bound::Core, &e);
                        break;
                    }
                }
            }
            debug!(workers = state.pool_size(), "Pool joined");
        }

        inner.queue.unblock();
    }

    /// Stop accepting work; queued items are still processed
    ///
    /// Only idle workers are interrupted, busy ones finish their item.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.run_state == RunState::Running {
            state.run_state = RunState::Shutdown;
        }
        inner.queue.close();

        for worker in state.workers.values() {
            worker.interrupt_if_idle();
        }
        inner.queue.wake_takers();

        if state.pool_size() == 0 {
            if inner.queue.is_empty() {
                inner.terminate(&mut state);
            } else if let Err((e, _)) = inner.add_worker(&mut state, None) {
                error!(error = %e, "No worker left to drain the queue");
                inner.terminate(&mut state);
            }
        }

        info!(state = %state.run_state, "Pool shut down");
    }

    /// Shut down and block until every worker thread has exited
    pub fn shutdown_and_wait(&self) {
        self.shutdown();
        self.await_termination();
    }

    /// Interrupt all workers and return the items never dispatched
    ///
    /// Workers finish the item they are processing, if any.
    pub fn shutdown_now(&self) -> Vec<T> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.run_state < RunState::Stop {
            state.run_state = RunState::Stop;
        }
        inner.queue.close();
        let undispatched = inner.queue.drain();

        for worker in state.workers.values() {
            worker.interrupt();
        }
        inner.queue.wake_takers();

        if state.pool_size() == 0 {
            inner.terminate(&mut state);
        }

        info!(undispatched = undispatched.len(), "Pool stopped");
        undispatched
    }

    /// Block until the pool reached `Terminated` and reap worker threads
    pub fn await_termination(&self) {
        let handles = {
            let mut state = self.inner.state.lock();
            while state.run_state != RunState::Terminated {
                self.inner.termination.wait(&mut state);
            }
            std::mem::take(&mut state.handles)
        };
        join_handles(handles);
    }

    /// Current number of workers
    pub fn pool_size(&self) -> usize {
        self.inner.state.lock().pool_size()
    }

    /// Current core pool size (may shrink under resource pressure)
    pub fn core_pool_size(&self) -> usize {
        self.inner.state.lock().core_pool_size
    }

    /// Current maximum pool size (may shrink under resource pressure)
    pub fn maximum_pool_size(&self) -> usize {
        self.inner.state.lock().maximum_pool_size
    }

    /// Largest number of workers alive at the same time
    pub fn largest_pool_size(&self) -> usize {
        self.inner.state.lock().largest_pool_size
    }

    /// Number of workers currently processing an item
    pub fn active_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .workers
            .values()
            .filter(|w| w.is_active())
            .count()
    }

    /// Total items processed by all workers
    pub fn completed_work_count(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Number of queued, undispatched items
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Work queue statistics
    pub fn queue_stats(&self) -> &QueueStats {
        self.inner.queue.stats()
    }

    /// Current lifecycle state
    pub fn run_state(&self) -> RunState {
        self.inner.state.lock().run_state
    }

    /// Check if every worker has exited after a shutdown
    pub fn is_terminated(&self) -> bool {
        self.run_state() == RunState::Terminated
    }
}

impl<T, F> Drop for WorkerPool<T, F>
where
    T: Send + 'static,
    F: WorkerFactory<T>,
{
    fn drop(&mut self) {
        if self.run_state() == RunState::Running {
            self.shutdown();
        }
    }
}

impl<T, F> PoolInner<T, F>
where
    T: Send + 'static,
    F: WorkerFactory<T>,
{
    /// Create and start one worker; on failure the first task is handed back
    fn add_worker(
        self: &Arc<Self>,
        state: &mut PoolState<T>,
        first_task: Option<T>,
    ) -> Result<(), (WorkerError, Option<T>)> {
        let id = state.next_id;
        state.next_id += 1;

        let handler = match self.factory.create_worker(id) {
            Ok(handler) => handler,
            Err(e) => return Err((e, first_task)),
        };

        let shared = Arc::new(WorkerShared::new(id, first_task));
        let pool = Arc::clone(self);
        let worker = Arc::clone(&shared);

        let spawned = thread::Builder::new()
            .name(format!("pool-worker-{}", id))
            .spawn(move || run_worker(pool, worker, handler));

        match spawned {
            Ok(handle) => {
                state.workers.insert(id, shared);
                state.handles.push(handle);
                state.largest_pool_size = state.largest_pool_size.max(state.pool_size());
                state.consecutive_failures = 0;
                debug!(worker = id, pool_size = state.pool_size(), "Worker started");
                Ok(())
            }
            Err(e) => Err((
                WorkerError::SpawnFailed {
                    id,
                    reason: e.to_string(),
                },
                shared.take_first_task(),
            )),
        }
    }

    /// Shrink the pool bounds after a failed worker creation
    fn on_creation_failure(&self, state: &mut PoolState<T>, bound: Bound, cause: &WorkerError) {
        state.consecutive_failures += 1;

        let policy = if state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            PoolSizeAdaptation::Aggressive
        } else {
            self.adaptation
        };

        let pool_size = state.pool_size();
        match policy {
            PoolSizeAdaptation::None => {}
            PoolSizeAdaptation::Stepwise => match bound {
                Bound::Core => {
                    state.core_pool_size = state.core_pool_size.saturating_sub(1).max(1);
                }
                Bound::Maximum => {
                    state.maximum_pool_size = state
                        .maximum_pool_size
                        .saturating_sub(1)
                        .max(state.core_pool_size)
                        .max(1);
                }
            },
            PoolSizeAdaptation::Aggressive => {
                let size = if pool_size >= state.core_pool_size {
                    pool_size.max(1)
                } else {
                    1
                };
                state.core_pool_size = size;
                state.maximum_pool_size = size;
            }
        }

        warn!(
            error = %cause,
            policy = ?policy,
            failures = state.consecutive_failures,
            pool_size,
            core = state.core_pool_size,
            max = state.maximum_pool_size,
            "Worker creation failed, adapting pool size"
        );

        self.retire_excess(state);
    }

    /// Interrupt idle workers until the pool fits its maximum again
    fn retire_excess(&self, state: &PoolState<T>) {
        let mut excess = state.pool_size().saturating_sub(state.maximum_pool_size);
        if excess == 0 {
            return;
        }

        for worker in state.workers.values() {
            if excess == 0 {
                break;
            }
            if !worker.is_interrupted() && worker.interrupt_if_idle() {
                debug!(worker = worker.id(), "Retiring worker");
                excess -= 1;
            }
        }
        self.queue.wake_takers();
    }

    /// Make sure a queued item has a worker to run it
    fn ensure_queued_work_handled(self: &Arc<Self>) -> PoolResult<()> {
        let mut state = self.state.lock();

        if state.run_state == RunState::Running && state.pool_size() == 0 {
            if let Err((e, _)) = self.add_worker(&mut state, None) {
                self.on_creation_failure(&mut state, Bound::Core, &e);
                if state.pool_size() == 0 {
                    return Err(PoolError::NoWorkers(e));
                }
            }
        }
        Ok(())
    }

    fn terminate(&self, state: &mut PoolState<T>) {
        state.run_state = RunState::Terminated;
        self.termination.notify_all();
    }

    /// Bookkeeping when a worker thread exits, normally or by panic
    fn worker_done(self: &Arc<Self>, id: usize, completed: u64, panicked: bool) {
        let mut state = self.state.lock();
        state.workers.remove(&id);

        if panicked {
            let e = WorkerError::Panicked {
                id,
                message: "work handler panicked".into(),
            };
            error!(worker = id, error = %e, "Worker died");

            if state.run_state == RunState::Running
                && state.pool_size() < state.core_pool_size
                && !self.queue.is_empty()
            {
                if let Err((e, _)) = self.add_worker(&mut state, None) {
                    self.on_creation_failure(&mut state, Bound::Core, &e);
                }
            }
        } else {
            debug!(worker = id, completed, "Worker exited");
        }

        if state.pool_size() == 0 && state.run_state >= RunState::Shutdown {
            if state.run_state == RunState::Shutdown && !self.queue.is_empty() {
                if let Err((e, _)) = self.add_worker(&mut state, None) {
                    error!(error = %e, "No worker left to drain the queue");
                    self.terminate(&mut state);
                }
            } else {
                self.terminate(&mut state);
            }
        }

        self.termination.notify_all();
    }
}

/// Releases the pool's bookkeeping even when the handler panics
struct ExitGuard<T, F>
where
    T: Send + 'static,
    F: WorkerFactory<T>,
{
    pool: Arc<PoolInner<T, F>>,
    worker: Arc<WorkerShared<T>>,
}

impl<T, F> Drop for ExitGuard<T, F>
where
    T: Send + 'static,
    F: WorkerFactory<T>,
{
    fn drop(&mut self) {
        self.pool
            .worker_done(self.worker.id(), self.worker.completed(), thread::panicking());
    }
}

/// Main worker loop
fn run_worker<T, F>(
    pool: Arc<PoolInner<T, F>>,
    worker: Arc<WorkerShared<T>>,
    mut handler: <F as WorkerFactory<T>>::Handler,
) where
    T: Send + 'static,
    F: WorkerFactory<T>,
{
    let guard = ExitGuard {
        pool: Arc::clone(&pool),
        worker: Arc::clone(&worker),
    };

    let mut first_task = worker.take_first_task();
    loop {
        let item = match first_task.take() {
            Some(item) => item,
            None => match pool.queue.take(worker.interrupt_flag()) {
                Some(item) => item,
                None => break,
            },
        };

        let _running = worker.run_lock().lock();
        handler.do_work(item);
        worker.record_completed();
        pool.completed.fetch_add(1, Ordering::Relaxed);
    }

    handler.shutdown();
    drop(guard);
}

fn join_handles(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            warn!("Worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_factory(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn(usize) -> Result<Box<dyn FnMut(usize) + Send>, WorkerError> + Send + Sync + 'static
    {
        move |_id| {
            let counter = Arc::clone(&counter);
            Ok(Box::new(move |_item: usize| {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnMut(usize) + Send>)
        }
    }

    fn failing_factory(
        id: usize,
    ) -> Result<Box<dyn FnMut(usize) + Send>, WorkerError> {
        Err(WorkerError::CreateFailed {
            id,
            reason: "out of connections".into(),
        })
    }

    #[test]
    fn test_add_work_then_join() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(&PoolConfig::new(2, 4, 8), counting_factory(Arc::clone(&counter)))
            .unwrap();

        for i in 0..100 {
            pool.add_work(i).unwrap();
        }
        pool.join();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.queue_len(), 0);
        assert_eq!(pool.completed_work_count(), 100);
        assert!(pool.pool_size() >= 1 && pool.pool_size() <= 4);

        pool.shutdown_and_wait();
        assert!(pool.is_terminated());
    }

    #[test]
    fn test_prestart_core_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool: WorkerPool<usize, _> =
            WorkerPool::new(&PoolConfig::new(3, 6, 8), counting_factory(counter)).unwrap();

        assert_eq!(pool.prestart_core_workers(), 3);
        assert_eq!(pool.pool_size(), 3);
        assert!(!pool.prestart_core_worker());

        pool.shutdown_and_wait();
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(&PoolConfig::new(1, 1, 4), counting_factory(counter)).unwrap();

        pool.shutdown_and_wait();
        assert!(matches!(
            pool.add_work(1),
            Err(PoolError::Rejected {
                state: RunState::Terminated
            })
        ));
    }

    #[test]
    fn test_shutdown_now_returns_undispatched() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();

        let factory = {
            let gate = Arc::clone(&gate);
            move |_id: usize| {
                let gate = Arc::clone(&gate);
                Ok::<_, WorkerError>(move |_item: usize| {
                    let _pass = gate.lock();
                })
            }
        };

        let pool = WorkerPool::new(&PoolConfig::new(1, 1, 16), factory).unwrap();
        for i in 0..10 {
            pool.add_work(i).unwrap();
        }

        // The single worker is stuck on the first item
        let remaining = pool.shutdown_now();
        assert_eq!(remaining, (1..10).collect::<Vec<_>>());
        assert_eq!(pool.run_state(), RunState::Stop);

        drop(held);
        pool.await_termination();
        assert!(pool.is_terminated());
        assert_eq!(pool.completed_work_count(), 1);
    }

    #[test]
    fn test_stepwise_then_forced_aggressive() {
        let pool: WorkerPool<usize, _> =
            WorkerPool::new(&PoolConfig::new(4, 8, 4), failing_factory).unwrap();

        assert!(!pool.prestart_core_worker());
        assert_eq!(pool.core_pool_size(), 3);
        assert!(!pool.prestart_core_worker());
        assert_eq!(pool.core_pool_size(), 2);

        // Third consecutive failure collapses the bounds
        assert!(!pool.prestart_core_worker());
        assert_eq!(pool.core_pool_size(), 1);
        assert_eq!(pool.maximum_pool_size(), 1);
    }

    #[test]
    fn test_stepwise_growth_failure_lowers_maximum() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let counter = Arc::new(AtomicUsize::new(0));

        // Only the first worker beyond core fails to start
        let factory = {
            let gate = Arc::clone(&gate);
            let counter = Arc::clone(&counter);
            move |id: usize| {
                if id == 2 {
                    return Err(WorkerError::CreateFailed {
                        id,
                        reason: "out of connections".into(),
                    });
                }
                let gate = Arc::clone(&gate);
                let counter = Arc::clone(&counter);
                Ok(move |_item: usize| {
                    let _pass = gate.lock();
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }
        };

        let config = PoolConfig::new(2, 4, 2).with_adaptation(PoolSizeAdaptation::Stepwise);
        let pool = WorkerPool::new(&config, factory).unwrap();

        // Two core workers busy, queue full
        for i in 0..4 {
            pool.add_work(i).unwrap();
        }
        assert_eq!(pool.pool_size(), 2);

        thread::scope(|s| {
            let overflow = s.spawn(|| pool.add_work(4));

            let start = std::time::Instant::now();
            while pool.maximum_pool_size() == 4 && start.elapsed() < Duration::from_secs(5) {
                thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(pool.maximum_pool_size(), 3);
            assert_eq!(pool.core_pool_size(), 2);

            drop(held);
            overflow.join().unwrap().unwrap();
        });

        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.completed_work_count(), 5);
        assert_eq!(pool.largest_pool_size(), 2);
        assert_eq!(pool.maximum_pool_size(), 3);

        pool.shutdown_and_wait();
    }

    #[test]
    fn test_no_adaptation_keeps_bounds() {
        let config = PoolConfig::new(2, 2, 4).with_adaptation(PoolSizeAdaptation::None);
        let pool: WorkerPool<usize, _> = WorkerPool::new(&config, failing_factory).unwrap();

        assert!(!pool.prestart_core_worker());
        assert!(!pool.prestart_core_worker());
        assert_eq!(pool.core_pool_size(), 2);
        assert_eq!(pool.maximum_pool_size(), 2);
    }

    #[test]
    fn test_add_work_without_any_worker_fails() {
        let pool = WorkerPool::new(&PoolConfig::new(1, 1, 4), failing_factory).unwrap();
        assert!(matches!(pool.add_work(1), Err(PoolError::NoWorkers(_))));
    }

    #[test]
    fn test_aggressive_collapses_to_current_size() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = {
            let created = Arc::clone(&created);
            move |id: usize| {
                if created.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(|_item: usize| {})
                } else {
                    Err(WorkerError::CreateFailed {
                        id,
                        reason: "exhausted".into(),
                    })
                }
            }
        };

        let config = PoolConfig::new(4, 6, 4).with_adaptation(PoolSizeAdaptation::Aggressive);
        let pool: WorkerPool<usize, _> = WorkerPool::new(&config, factory).unwrap();

        assert_eq!(pool.prestart_core_workers(), 2);
        // Two workers alive, below core: collapse to a single worker
        assert_eq!(pool.core_pool_size(), 1);
        assert_eq!(pool.maximum_pool_size(), 1);

        pool.shutdown_and_wait();
    }

    #[test]
    fn test_join_restarts_workers() {
        let shutdowns = Arc::new(AtomicUsize::new(0));

        struct Flushing(Arc<AtomicUsize>);
        impl WorkHandler<u32> for Flushing {
            fn do_work(&mut self, _item: u32) {}
            fn shutdown(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let factory = {
            let shutdowns = Arc::clone(&shutdowns);
            move |_id: usize| Ok::<_, WorkerError>(Flushing(Arc::clone(&shutdowns)))
        };

        let pool = WorkerPool::new(&PoolConfig::new(2, 2, 4), factory).unwrap();
        pool.prestart_core_workers();
        pool.add_work(1).unwrap();

        pool.join();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
        assert_eq!(pool.pool_size(), 2);

        pool.add_work(2).unwrap();
        pool.shutdown_and_wait();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_panicking_handler_is_replaced() {
        let counter = Arc::new(AtomicUsize::new(0));
        let factory = {
            let counter = Arc::clone(&counter);
            move |_id: usize| {
                let counter = Arc::clone(&counter);
                Ok::<_, WorkerError>(move |item: usize| {
                    if item == 0 {
                        panic!("bad item");
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }
        };

        let pool = WorkerPool::new(&PoolConfig::new(1, 1, 16), factory).unwrap();
        for i in 0..10 {
            pool.add_work(i).unwrap();
        }

        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 9);
        pool.shutdown_and_wait();
    }

    #[test]
    fn test_add_work_and_wait_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(&PoolConfig::new(2, 2, 64), counting_factory(Arc::clone(&counter)))
            .unwrap();

        for i in 0..50 {
            pool.add_work(i).unwrap();
        }
        pool.add_work_and_wait(50).unwrap();
        assert_eq!(pool.queue_len(), 0);

        pool.shutdown_and_wait();
        assert_eq!(counter.load(Ordering::SeqCst), 51);
    }

    #[test]
    fn test_grows_beyond_core_only_when_full() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();

        let factory = {
            let gate = Arc::clone(&gate);
            move |_id: usize| {
                let gate = Arc::clone(&gate);
                Ok::<_, WorkerError>(move |_item: usize| {
                    let _pass = gate.lock();
                })
            }
        };

        let pool = WorkerPool::new(&PoolConfig::new(1, 3, 2), factory).unwrap();
        pool.add_work(0).unwrap(); // core worker, blocked on the gate
        thread::sleep(Duration::from_millis(20));
        pool.add_work(1).unwrap();
        pool.add_work(2).unwrap();
        assert_eq!(pool.pool_size(), 1);

        pool.add_work(3).unwrap(); // queue full: grow
        assert_eq!(pool.pool_size(), 2);

        drop(held);
        pool.join();
        assert!(pool.largest_pool_size() <= 3);
        pool.shutdown_and_wait();
    }
}
