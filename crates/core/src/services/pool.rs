//! Bounded worker pool for per-block work.
//!
//! Submission waits for a free permit, so at most `size` units run at
//! once. A panicking unit is caught and reported as an error for its
//! block number; it never takes the pool down.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, trace};

use crate::error::{IndexerError, IndexerResult};

pub struct WorkerPool {
    name: &'static str,
    size: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Refuse further submissions. Running units finish normally.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Run `work` for every block number and wait for the whole batch.
    ///
    /// Results come back in completion order, one per submitted number.
    pub async fn run_batch<I, F, Fut, T>(&self, numbers: I, work: F) -> Vec<(u64, IndexerResult<T>)>
    where
        I: IntoIterator<Item = u64>,
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IndexerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let work = Arc::new(work);
        let mut tasks = JoinSet::new();
        let mut results = Vec::new();

        for number in numbers {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    results.push((
                        number,
                        Err(IndexerError::Internal(format!("{} pool is closed", self.name))),
                    ));
                    continue;
                }
            };

            let work = work.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = AssertUnwindSafe(work(number)).catch_unwind().await;
                let result = outcome.unwrap_or_else(|_| {
                    Err(IndexerError::Internal(format!(
                        "worker panicked on block {number}"
                    )))
                });
                (number, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => error!(pool = self.name, error = %e, "❌ Worker task lost"),
            }
        }

        trace!(pool = self.name, units = results.len(), "Batch complete");
        results
    }
}

/// Highest number `h` such that every block in `start..=h` succeeded.
pub fn contiguous_high<T>(start: u64, results: &[(u64, IndexerResult<T>)]) -> Option<u64> {
    let mut ok: Vec<u64> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(n, _)| *n)
        .collect();
    ok.sort_unstable();

    let mut high = None;
    let mut expected = start;
    for n in ok {
        if n < expected {
            continue;
        }
        if n != expected {
            break;
        }
        high = Some(n);
        expected = n + 1;
    }
    high
}
