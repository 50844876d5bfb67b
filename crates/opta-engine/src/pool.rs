//! Bounded worker pool for mid-turn tool invocations.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("cancelled while waiting for a worker")]
    Cancelled,
    #[error("worker pool closed")]
    Closed,
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// N workers; submissions beyond N wait for a free permit. A waiting
/// submission is abandoned when its cancellation token fires.
pub struct WorkerPool {
    workers: usize,
    semaphore: Arc<Semaphore>,
    busy: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
            busy: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            busy: self.busy.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    /// Run `job` on a worker once one is free.
    pub async fn run<F, T>(&self, cancel: &CancellationToken, job: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = {
            let _waiting = CountGuard::enter(&self.queued);
            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.map_err(|_| PoolError::Closed)?
                }
            }
        };

        let busy = CountGuard::enter(&self.busy);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _busy = busy;
            job.await
        });

        handle.await.map_err(|e| {
            warn!(error = %e, "tool worker failed");
            PoolError::Panicked(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn runs_jobs_and_returns_output() {
        let pool = WorkerPool::new(2);
        let out = pool.run(&CancellationToken::new(), async { 21 * 2 }).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(pool.stats(), PoolStats { workers: 2, busy: 0, queued: 0 });
    }

    #[tokio::test]
    async fn saturation_queues_excess_work() {
        let pool = Arc::new(WorkerPool::new(1));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.run(&CancellationToken::new(), async move {
                    let _ = release_rx.await;
                    "first"
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run(&CancellationToken::new(), async { "second" }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.stats(), PoolStats { workers: 1, busy: 1, queued: 1 });

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(second.await.unwrap().unwrap(), "second");
        assert_eq!(pool.stats().busy, 0);
        assert_eq!(pool.stats().queued, 0);
    }

    #[tokio::test]
    async fn cancel_abandons_queued_job() {
        let pool = Arc::new(WorkerPool::new(1));
        let (_hold_tx, hold_rx) = oneshot::channel::<()>();
        let blocker = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.run(&CancellationToken::new(), async move {
                    let _ = hold_rx.await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        let waiting = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run(&cancel, async { 1 }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(waiting.await.unwrap(), Err(PoolError::Cancelled)));
        assert_eq!(pool.stats().queued, 0);
        blocker.abort();
    }

    #[tokio::test]
    async fn panicking_job_is_reported() {
        let pool = WorkerPool::new(1);
        let result = pool
            .run(&CancellationToken::new(), async {
                panic!("boom");
            })
            .await;
        assert!(matches!(result, Err(PoolError::Panicked(_))));
        assert_eq!(pool.stats().busy, 0);
    }
}
