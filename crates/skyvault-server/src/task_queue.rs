//! Bounded circular task queue
//!
//! One mutex guards the ring, one counting signal wakes consumers. The
//! producer never blocks: a push onto a full queue hands the task back.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Fixed-capacity ring buffer
struct Ring<T> {
    slots: Vec<Option<T>>,
    front: usize,
    rear: usize,
    count: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            front: 0,
            rear: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, item: T) -> Result<(), T> {
        if self.count == self.capacity() {
            return Err(item);
        }
        self.slots[self.rear] = Some(item);
        self.rear = (self.rear + 1) % self.capacity();
        self.count += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.slots[self.front].take();
        self.front = (self.front + 1) % self.capacity();
        self.count -= 1;
        item
    }
}

/// Counting wake-up signal
struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }
}

/// Multi-consumer bounded queue shared by the event loop and the workers
pub struct TaskQueue<T> {
    ring: Mutex<Ring<T>>,
    available: Semaphore,
    running: AtomicBool,
}

impl<T> TaskQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero; configuration validation rejects that first.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "task queue capacity must be non-zero");
        Self {
            ring: Mutex::new(Ring::new(capacity)),
            available: Semaphore::new(),
            running: AtomicBool::new(true),
        }
    }

    /// Enqueue without blocking.
    ///
    /// # Returns
    ///
    /// The task back as `Err` when the queue is full or shut down.
    pub fn try_push(&self, task: T) -> Result<(), T> {
        if !self.running.load(Ordering::Acquire) {
            return Err(task);
        }
        self.ring.lock().push(task)?;
        self.available.post();
        Ok(())
    }

    /// Block until a task is available.
    ///
    /// Returns `None` once the queue has been shut down.
    pub fn pop(&self) -> Option<T> {
        loop {
            self.available.wait();
            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = self.ring.lock().pop() {
                return Some(task);
            }
        }
    }

    /// Stop accepting work and release `waiters` blocked consumers
    pub fn shutdown(&self, waiters: usize) {
        self.running.store(false, Ordering::Release);
        for _ in 0..waiters {
            self.available.post();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    #[cfg(test)]
    fn indices(&self) -> (usize, usize, usize) {
        let ring = self.ring.lock();
        (ring.front, ring.rear, ring.count)
    }
}
