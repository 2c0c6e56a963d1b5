// Worker pool
//
// Fixed set of recording threads. Tasks get a handle back; the driving
// thread joins every handle of a tick before it builds the graphics batch.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};

pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// `threads == 0` uses the available parallelism.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("cadence-worker-{}", i))
            .build()
            .context("Failed to build worker thread pool")?;
        log::info!("Worker pool started with {} threads", threads);
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn spawn<T, F>(&self, label: impl Into<String>, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = mpsc::sync_channel(1);
        let task_label = label.clone();
        self.pool.spawn(move || {
            let start = Instant::now();
            let result = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(result) => result,
                Err(_) => Err(anyhow!("worker task '{}' panicked", task_label)),
            };
            log::trace!("{} recorded in {:?}", task_label, start.elapsed());
            // Receiver dropped means nobody cares about the result
            let _ = tx.send(result);
        });
        TaskHandle { label, rx }
    }
}

/// Pending result of one worker task.
pub struct TaskHandle<T> {
    label: String,
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finished.
    pub fn join(self) -> Result<T> {
        let label = self.label;
        self.rx
            .recv()
            .map_err(|_| anyhow!("worker task '{}' vanished", label))?
            .with_context(|| format!("worker task '{}' failed", label))
    }
}

/// Handles of one tick, joined as a barrier.
pub struct TaskSet<T> {
    handles: Vec<TaskHandle<T>>,
}

impl<T> Default for TaskSet<T> {
    fn default() -> Self {
        Self {
            handles: Vec::new(),
        }
    }
}

impl<T> TaskSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: TaskHandle<T>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Joins every handle, even after a failure, so no task outlives the
    /// call. Results come back in dispatch order; the first error wins.
    pub fn join_all(self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.handles.len());
        let mut first_error = None;
        for handle in self.handles {
            match handle.join() {
                Ok(value) => results.push(value),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        log::error!("{:#}", e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}
