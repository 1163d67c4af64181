//! Bounded worker pool for container create/teardown fan-out.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs every job with at most `size` in flight and waits for all of them.
    /// Results come back in completion order; a panicked job is logged and dropped.
    pub async fn run_all<F, T>(&self, jobs: Vec<F>) -> Vec<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut set = JoinSet::new();
        for job in jobs {
            let permits = Arc::clone(&self.permits);
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                job.await
            });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(value) => results.push(value),
                Err(e) => error!(event = "WORKER_TASK_FAILED", error = %e, "Worker task panicked or was cancelled"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_job() {
        let pool = WorkerPool::new(3);
        let jobs: Vec<_> = (0..10u32).map(|i| async move { i * 2 }).collect();
        let mut results = pool.run_all(jobs).await;
        results.sort();
        assert_eq!(results, (0..10u32).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn never_exceeds_pool_size() {
        let pool = WorkerPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..8)
            .map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();

        pool.run_all(jobs).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn zero_size_is_clamped() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
