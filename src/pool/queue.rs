//! Bounded work queue shared by the producer and the pool's workers
//!
//! The queue is the only synchronization point between the single producer
//! and the worker threads. It is a FIFO ring guarded by one mutex with four
//! wait conditions:
//!
//! - `not_empty`: takers wait for items
//! - `not_full`: producers wait for space
//! - `empty`: waiters for a fully drained queue (`wait_until_empty`)
//! - `flushed`: producers parked while the queue is blocked for a flush
//!
//! Blocking (`block_and_flush`) pauses new enqueues without closing the
//! queue, which lets the pool run multi-stage pipelines without a full
//! shutdown. Closing (`close`) rejects new items but still hands out the
//! remaining ones.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics for the work queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total items enqueued
    pub enqueued: AtomicU64,

    /// Total items dequeued
    pub dequeued: AtomicU64,

    /// Number of times an offer found the queue full
    pub full_events: AtomicU64,
}

impl QueueStats {
    /// Get queue throughput (dequeued items)
    pub fn throughput(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    /// Get the number of enqueued items
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Get the number of times the queue was found full
    pub fn full_count(&self) -> u64 {
        self.full_events.load(Ordering::Relaxed)
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    blocked: bool,
    closed: bool,
}

/// Bounded FIFO queue with pause-and-flush support
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    empty: Condvar,
    flushed: Condvar,
    capacity: usize,
    stats: QueueStats,
}

impl<T> WorkQueue<T> {
    /// Create a new work queue with the specified capacity (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                blocked: false,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            empty: Condvar::new(),
            flushed: Condvar::new(),
            capacity,
            stats: QueueStats::default(),
        }
    }

    /// Enqueue an item, blocking while the queue is full or blocked
    ///
    /// Returns the item back if the queue is closed.
    pub fn put(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(item);
            }
            if state.blocked {
                self.flushed.wait(&mut state);
                continue;
            }
            if state.items.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut state);
        }

        self.push(&mut state, item);
        Ok(())
    }

    /// Try to enqueue an item without blocking
    ///
    /// Returns the item back if the queue is full, blocked or closed.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();

        if state.closed || state.blocked {
            return Err(item);
        }
        if state.items.len() >= self.capacity {
            self.stats.full_events.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }

        self.push(&mut state, item);
        Ok(())
    }

    /// Enqueue with timeout
    ///
    /// Returns the item back if no space became available in time or the
    /// queue was closed.
    pub fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(item);
            }
            if !state.blocked && state.items.len() < self.capacity {
                break;
            }

            let condvar = if state.blocked {
                &self.flushed
            } else {
                &self.not_full
            };
            if condvar.wait_until(&mut state, deadline).timed_out() {
                if !state.closed && !state.blocked && state.items.len() < self.capacity {
                    break;
                }
                self.stats.full_events.fetch_add(1, Ordering::Relaxed);
                return Err(item);
            }
        }

        self.push(&mut state, item);
        Ok(())
    }

    /// Dequeue an item, blocking while the queue is empty
    ///
    /// Remaining items are always handed out first. Once the queue is empty,
    /// returns `None` if the queue is closed or `cancel` is set.
    pub fn take(&self, cancel: &AtomicBool) -> Option<T> {
        let mut state = self.state.lock();

        loop {
            if let Some(item) = self.pop(&mut state) {
                return Some(item);
            }
            if state.closed || cancel.load(Ordering::SeqCst) {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Try to dequeue an item without blocking
    pub fn poll(&self) -> Option<T> {
        let mut state = self.state.lock();
        self.pop(&mut state)
    }

    /// Dequeue with timeout
    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if let Some(item) = self.pop(&mut state) {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return self.pop(&mut state);
            }
        }
    }

    /// Pause new enqueues and wait until every queued item was taken
    pub fn block_and_flush(&self) {
        let mut state = self.state.lock();
        state.blocked = true;

        while !state.items.is_empty() {
            self.empty.wait(&mut state);
        }
    }

    /// Resume enqueues after `block_and_flush`
    pub fn unblock(&self) {
        let mut state = self.state.lock();
        state.blocked = false;
        self.flushed.notify_all();
    }

    /// Block until the queue is empty (enqueues are not paused)
    pub fn wait_until_empty(&self) {
        let mut state = self.state.lock();

        while !state.items.is_empty() {
            self.empty.wait(&mut state);
        }
    }

    /// Close the queue: further enqueues are rejected, remaining items
    /// are still handed out
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.blocked = false;

        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.flushed.notify_all();
    }

    /// Remove and return every queued item
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let items: Vec<T> = state.items.drain(..).collect();

        self.stats
            .dequeued
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        self.not_full.notify_all();
        self.empty.notify_all();
        items
    }

    /// Wake every taker so it can re-check its cancel flag
    pub fn wake_takers(&self) {
        let _state = self.state.lock();
        self.not_empty.notify_all();
    }

    /// Get current queue length
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Get queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of items that can be enqueued without blocking
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    /// Check if enqueues are currently paused
    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    /// Check if the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Get queue statistics
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    fn push(&self, state: &mut QueueState<T>, item: T) {
        state.items.push_back(item);
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
    }

    fn pop(&self, state: &mut QueueState<T>) -> Option<T> {
        let item = state.items.pop_front()?;

        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        self.not_full.notify_one();
        if state.items.is_empty() {
            self.empty.notify_all();
        }
        Some(item)
    }
}
