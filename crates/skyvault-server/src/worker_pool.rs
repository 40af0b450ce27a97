// Worker thread pool
//
// A fixed set of OS threads pulls tasks from the shared TaskQueue and runs
// each one to completion. Tasks never block on socket I/O: they persist
// progress and return, so a small pool serves many connections.

use crate::error::{Error, Result};
use crate::task_queue::TaskQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info};

/// Worker thread statistics
#[derive(Debug)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub tasks_processed: AtomicU64,
    pub total_processing_time_us: AtomicU64,
    pub errors: AtomicU64,
}

impl WorkerStats {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            tasks_processed: AtomicU64::new(0),
            total_processing_time_us: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

/// Worker thread pool handle
pub struct WorkerPool<T> {
    queue: Arc<TaskQueue<T>>,
    handles: Vec<JoinHandle<()>>,
    stats: Vec<Arc<WorkerStats>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `worker_count` threads, each running `handler` for every task it dequeues
    pub fn start<F>(worker_count: usize, queue: Arc<TaskQueue<T>>, handler: F) -> Result<Self>
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        info!(
            event = "worker_pool_starting",
            worker_count,
            queue_capacity = queue.capacity(),
            "Starting worker pool"
        );

        let handler = Arc::new(handler);
        let mut pool = Self {
            queue: queue.clone(),
            handles: Vec::with_capacity(worker_count),
            stats: Vec::with_capacity(worker_count),
        };

        for worker_id in 0..worker_count {
            let stats = Arc::new(WorkerStats::new(worker_id));
            let queue = queue.clone();
            let handler = handler.clone();
            let thread_stats = stats.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("skyvault-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, queue, thread_stats, handler.as_ref()));

            match spawned {
                Ok(handle) => {
                    pool.handles.push(handle);
                    pool.stats.push(stats);
                }
                Err(e) => {
                    // Release the threads that did start before reporting
                    pool.shutdown();
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> &[Arc<WorkerStats>] {
        &self.stats
    }

    /// Stop the queue, wake every worker and join them
    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl<T> WorkerPool<T> {
    fn stop(&mut self) {
        self.queue.shutdown(self.handles.len());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(event = "worker_panicked", "Worker thread panicked");
            }
        }
        print_stats(&self.stats);
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop();
        }
    }
}

fn worker_loop<T, F>(worker_id: usize, queue: Arc<TaskQueue<T>>, stats: Arc<WorkerStats>, handler: &F)
where
    F: Fn(T) -> Result<()>,
{
    debug!(worker_id, "Worker starting");

    while let Some(task) = queue.pop() {
        let start = Instant::now();

        if let Err(e) = handler(task) {
            error!(worker_id, error = %e, "Error processing task");
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }

        let elapsed = start.elapsed().as_micros() as u64;
        stats.tasks_processed.fetch_add(1, Ordering::Relaxed);
        stats
            .total_processing_time_us
            .fetch_add(elapsed, Ordering::Relaxed);
    }

    debug!(worker_id, "Worker shutting down");
}

fn print_stats(worker_stats: &[Arc<WorkerStats>]) {
    for stats in worker_stats {
        let processed = stats.tasks_processed.load(Ordering::Relaxed);
        let total_time = stats.total_processing_time_us.load(Ordering::Relaxed);
        let avg_time = if processed > 0 {
            total_time / processed
        } else {
            0
        };

        info!(
            "Worker {}: processed={}, avg_time={}us, errors={}",
            stats.worker_id,
            processed,
            avg_time,
            stats.errors.load(Ordering::Relaxed),
        );
    }
}
