use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Fixed-size pool of OS threads shared by every parallel stage.
pub struct WorkerPool {
    pool: ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("scrape-worker-{}", i))
            .build()
            .context("Failed to start worker pool")?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` on every item. Results keep the input order; completion order is arbitrary.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        self.pool.install(|| items.into_par_iter().map(f).collect())
    }
}

/// Split `items` into at most `n` contiguous chunks whose sizes differ by at most one.
pub fn partition<T>(items: &[T], n: usize) -> Vec<&[T]> {
    let n = n.max(1).min(items.len());
    if n == 0 {
        return Vec::new();
    }
    let base = items.len() / n;
    let extra = items.len() % n;

    let mut chunks = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        chunks.push(&items[start..start + len]);
        start += len;
    }
    chunks
}
