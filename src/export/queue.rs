//! Fixed-capacity FIFO with blocking push/pop and an explicit close.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// A bounded multi-producer multi-consumer queue.
///
/// - `push` blocks while the queue is full and open; it hands the item back
///   once the queue is closed.
/// - `pop` blocks while the queue is empty and open; it returns `None` only
///   when the queue is closed *and* drained.
/// - `close` is idempotent and wakes every blocked thread.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Every critical section leaves the state consistent, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `item`, waiting for space. Returns the item if the queue is closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let guard = self.lock();
        let mut state = self
            .not_full
            .wait_while(guard, |s| !s.closed && s.items.len() >= self.capacity)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting for one. `None` once closed and empty.
    pub fn pop(&self) -> Option<T> {
        let guard = self.lock();
        let mut state = self
            .not_empty
            .wait_while(guard, |s| !s.closed && s.items.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let item = state.items.pop_front()?;
        drop(state);
        self.not_full.notify_one();
        Some(item)
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
