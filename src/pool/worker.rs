//! Worker side of the pool
//!
//! A worker is a long-lived thread bound to exactly one pool. It pulls items
//! from the shared queue and hands each one to its [`WorkHandler`]. The
//! handler is created by a [`WorkerFactory`] and may hold per-worker state
//! (a database connection, batched statements); its `shutdown` hook runs when
//! the worker retires, which is how batches get flushed at `join()`.
//!
//! Each worker owns a run lock held for the duration of every `do_work`
//! call. `interrupt_if_idle` only succeeds when that lock is free, so an
//! in-flight item is never cut short.

use crate::error::WorkerError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Processes work items for one worker thread
pub trait WorkHandler<T>: Send + 'static {
    /// Process a single item
    ///
    /// Failures are the handler's own business (log, skip, continue); the
    /// pool never inspects them.
    fn do_work(&mut self, item: T);

    /// Called once when the worker retires (join, shutdown)
    fn shutdown(&mut self) {}
}

impl<T, F> WorkHandler<T> for F
where
    F: FnMut(T) + Send + 'static,
{
    fn do_work(&mut self, item: T) {
        self(item)
    }
}

/// Produces handlers for new workers
///
/// Returning an error instead of panicking lets the pool shrink adaptively
/// under resource pressure.
pub trait WorkerFactory<T>: Send + Sync + 'static {
    /// Handler type produced by this factory
    type Handler: WorkHandler<T>;

    /// Create the handler for worker `id`
    fn create_worker(&self, id: usize) -> Result<Self::Handler, WorkerError>;
}

impl<T, H, F> WorkerFactory<T> for F
where
    F: Fn(usize) -> Result<H, WorkerError> + Send + Sync + 'static,
    H: WorkHandler<T>,
{
    type Handler = H;

    fn create_worker(&self, id: usize) -> Result<H, WorkerError> {
        self(id)
    }
}

/// State shared between a worker thread and its pool
pub(crate) struct WorkerShared<T> {
    id: usize,

    /// Held while the worker is inside `do_work`
    run_lock: Mutex<()>,

    /// Set to make the worker exit once no item is available
    interrupted: AtomicBool,

    /// Item handed over at creation, bypassing the queue
    first_task: Mutex<Option<T>>,

    /// Items completed by this worker
    completed: AtomicU64,
}

impl<T> WorkerShared<T> {
    pub(crate) fn new(id: usize, first_task: Option<T>) -> Self {
        Self {
            id,
            run_lock: Mutex::new(()),
            interrupted: AtomicBool::new(false),
            first_task: Mutex::new(first_task),
            completed: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn run_lock(&self) -> &Mutex<()> {
        &self.run_lock
    }

    pub(crate) fn interrupt_flag(&self) -> &AtomicBool {
        &self.interrupted
    }

    pub(crate) fn take_first_task(&self) -> Option<T> {
        self.first_task.lock().take()
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Flag the worker unconditionally
    ///
    /// The caller must wake the queue's takers afterwards.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Flag the worker only if it is not processing an item
    pub(crate) fn interrupt_if_idle(&self) -> bool {
        match self.run_lock.try_lock() {
            Some(_idle) => {
                self.interrupted.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Check if the worker is currently inside `do_work`
    pub(crate) fn is_active(&self) -> bool {
        self.run_lock.is_locked()
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_if_idle_skips_busy_worker() {
        let shared: WorkerShared<u32> = WorkerShared::new(0, None);

        let guard = shared.run_lock().lock();
        assert!(shared.is_active());
        assert!(!shared.interrupt_if_idle());
        assert!(!shared.is_interrupted());
        drop(guard);

        assert!(shared.interrupt_if_idle());
        assert!(shared.is_interrupted());
    }

    #[test]
    fn test_first_task_taken_once() {
        let shared = WorkerShared::new(3, Some("item"));
        assert_eq!(shared.id(), 3);
        assert_eq!(shared.take_first_task(), Some("item"));
        assert_eq!(shared.take_first_task(), None);
    }

    #[test]
    fn test_closure_handler() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;

        let total = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&total);
        let mut handler = move |item: u32| {
            sink.fetch_add(item, Ordering::SeqCst);
        };

        WorkHandler::do_work(&mut handler, 5);
        WorkHandler::do_work(&mut handler, 7);
        assert_eq!(total.load(Ordering::SeqCst), 12);
    }
}
