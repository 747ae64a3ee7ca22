//! Fixed-size worker pool: one FIFO job queue, one mutex, one condvar.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        })
    }
}

/// Error from [`ThreadPool::map`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is shut down")]
    ShutDown,
    #[error("job {0} produced no result")]
    Lost(usize),
}

/// Worker threads draining a shared job queue. Dropping the pool lets queued jobs
/// finish, then joins every worker.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// `threads` is clamped to at least one.
    pub fn new(threads: usize) -> Self {
        let shared = Shared::new();
        let workers = (0..threads.max(1))
            .map(|id| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("dronesight-worker-{id}"))
                    .spawn(move || worker_loop(&shared))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!(error = %e, "failed to spawn worker");
                    None
                }
            })
            .collect();
        Self { shared, workers }
    }

    /// Threads minus one of the host's parallelism, at least one.
    pub fn default_size() -> usize {
        thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job. Returns false if the pool is shutting down or has no workers.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.is_empty() {
            return false;
        }
        let mut q = self.shared.queue.lock();
        if q.shutdown {
            return false;
        }
        q.jobs.push_back(Box::new(job));
        drop(q);
        self.shared.available.notify_one();
        true
    }

    /// Run `f` over every item on the pool and collect results in input order.
    /// Each job sends its result with its index; results land in pre-sized slots.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let n = items.len();
        let f = Arc::new(f);
        let (tx, rx) = mpsc::channel::<(usize, R)>();
        for (i, item) in items.into_iter().enumerate() {
            let f = f.clone();
            let tx = tx.clone();
            let queued = self.execute(move || {
                let _ = tx.send((i, f(item)));
            });
            if !queued {
                return Err(PoolError::ShutDown);
            }
        }
        drop(tx);
        let mut slots: Vec<Option<R>> = (0..n).map(|_| None).collect();
        // ends once every job has run (or panicked) and dropped its sender
        for (i, r) in rx {
            slots[i] = Some(r);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.ok_or(PoolError::Lost(i)))
            .collect()
    }

    /// Pool whose workers all failed to spawn.
    #[cfg(test)]
    pub(crate) fn without_workers() -> Self {
        Self {
            shared: Shared::new(),
            workers: Vec::new(),
        }
    }

    /// Stop accepting jobs and wake idle workers. Queued jobs still run.
    pub fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(Self::default_size())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut q = shared.queue.lock();
            loop {
                if let Some(job) = q.jobs.pop_front() {
                    break job;
                }
                if q.shutdown {
                    return;
                }
                shared.available.wait(&mut q);
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("pool job panicked");
        }
    }
}
