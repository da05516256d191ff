//! Serial vs bounded-pool execution of per-record index tasks.
//!
//! The simple strategy runs a task on the calling thread and returns its
//! entries completed. The parallel strategy dispatches to a bounded worker
//! pool and returns a pending channel; it is selected only for bulk
//! direct-mode writes at or above the configured minimum batch size;
//! below that the pool overhead costs more than it buys.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use tracing::debug;

use crate::config::ParallelismConfig;
use crate::result::{ResultEntry, TaskResult};

/// A unit of per-record index work producing its named results.
pub type IndexTask = Box<dyn FnOnce() -> Vec<ResultEntry> + Send + 'static>;

/// Executes index tasks, serially or on a pool.
pub trait IndexingStrategy: Send + Sync {
    fn execute(&self, task: IndexTask) -> TaskResult;

    /// Stop accepting tasks and wait for in-flight ones. Idempotent.
    fn close(&self);
}

/// Runs every task synchronously on the caller's thread. Stateless.
pub struct SimpleStrategy;

impl IndexingStrategy for SimpleStrategy {
    fn execute(&self, task: IndexTask) -> TaskResult {
        TaskResult::Done(task())
    }

    fn close(&self) {}
}

/// Dispatches tasks to a bounded worker pool.
///
/// Submission applies backpressure: once `max_queue` tasks are waiting, the
/// submitting thread blocks until a worker drains one.
pub struct ParallelStrategy {
    pool: WorkerPool,
}

impl ParallelStrategy {
    pub fn new(config: &ParallelismConfig, name: &str) -> Self {
        Self {
            pool: WorkerPool::new(config.threads, config.max_queue, name),
        }
    }
}

impl IndexingStrategy for ParallelStrategy {
    fn execute(&self, task: IndexTask) -> TaskResult {
        let (tx, rx) = channel::bounded(1);
        self.pool.submit(Box::new(move || {
            let entries = task();
            let _ = tx.send(entries);
        }));
        TaskResult::Pending(rx)
    }

    fn close(&self) {
        self.pool.close();
    }
}

impl Drop for ParallelStrategy {
    fn drop(&mut self) {
        self.pool.close();
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size thread pool over a bounded job queue.
struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(threads: usize, max_queue: usize, name: &str) -> Self {
        let (tx, rx) = channel::bounded::<Job>(max_queue);
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawning index worker threads");
            handles.push(handle);
        }
        Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        }
    }

    fn submit(&self, job: Job) {
        let sender = self.tx.lock().clone();
        match sender {
            Some(tx) => {
                // Blocks when the queue is full.
                if tx.send(job).is_err() {
                    debug!("worker pool queue closed; running task inline");
                }
            }
            // Closed pool: run inline rather than lose the work.
            None => job(),
        }
    }

    fn close(&self) {
        let sender = self.tx.lock().take();
        drop(sender);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}
