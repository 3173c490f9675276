//! Bounded worker pool for mutating operations
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │            Ledger (async callers, any task)          │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ acquire permit (async backpressure)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │        crossbeam::channel (bounded, capacity Q)      │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!          ┌────────────┼────────────┐
//!          ▼            ▼            ▼
//!     ledger-worker-0  ...  ledger-worker-{N-1}
//!       (blocking store I/O, per-account locks)
//!                       │
//!                       │ oneshot::Sender<Result<T>>
//!                       ▼
//!                  awaiting caller
//! ```
//!
//! A caller may drop its future at any point. Once a job has been queued it
//! runs to completion; its result is simply discarded.

use crate::{Error, Result};
use crossbeam::channel::{self, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    permits: Arc<Semaphore>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `size` workers fed by a queue of `queue_capacity` jobs
    pub fn new(size: usize, queue_capacity: usize) -> Result<Self> {
        if size == 0 || queue_capacity == 0 {
            return Err(Error::Config(
                "Worker pool needs at least one worker and one queue slot".to_string(),
            ));
        }

        let (sender, receiver) = channel::bounded::<Job>(queue_capacity);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("ledger-worker-{}", index))
                .spawn(move || {
                    for job in receiver.iter() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!(worker = index, "Ledger job panicked");
                        }
                    }
                    tracing::debug!(worker = index, "Worker stopped");
                })?;
            workers.push(handle);
        }

        tracing::info!(size, queue_capacity, "Worker pool started");

        Ok(Self {
            sender: Some(sender),
            permits: Arc::new(Semaphore::new(queue_capacity)),
            workers,
        })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run `job` on a worker and await its result
    pub async fn submit<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::Concurrency("Worker pool shut down".to_string()))?;

        let permit: OwnedSemaphorePermit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Concurrency("Worker pool closed".to_string()))?;

        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let result = job();
            drop(permit);
            let _ = tx.send(result);
        });

        // Never blocks: queued jobs are bounded by the permits
        sender
            .try_send(wrapped)
            .map_err(|_| Error::Concurrency("Worker queue unavailable".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Worker dropped the response".to_string()))?
    }

    /// Stop accepting jobs, drain the queue and join the workers
    pub fn shutdown(&mut self) {
        self.permits.close();
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked during shutdown");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_returns_result() {
        let pool = WorkerPool::new(2, 8).unwrap();
        let value = pool.submit(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_submit_propagates_error() {
        let pool = WorkerPool::new(1, 8).unwrap();
        let result: Result<()> = pool
            .submit(|| Err(Error::ValidationFailed("bad".to_string())))
            .await;
        assert!(matches!(result, Err(Error::ValidationFailed(_))));
    }

    #[tokio::test]
    async fn test_jobs_run_on_named_workers() {
        let pool = WorkerPool::new(3, 8).unwrap();
        let name = pool
            .submit(|| Ok(std::thread::current().name().map(str::to_string)))
            .await
            .unwrap();
        assert!(name.unwrap().starts_with("ledger-worker-"));
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn test_more_jobs_than_capacity() {
        let pool = Arc::new(WorkerPool::new(2, 2).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            tasks.push(tokio::spawn(async move {
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn test_abandoned_job_still_completes() {
        let pool = WorkerPool::new(1, 4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&done);
        let pending = pool.submit(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        // Poll once so the job is queued, then abandon it
        let _ = tokio::time::timeout(Duration::from_millis(1), pending).await;

        // A later job on the single worker runs after the abandoned one
        pool.submit(|| Ok(())).await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_reports_concurrency_error() {
        let pool = WorkerPool::new(1, 4).unwrap();
        let result: Result<()> = pool.submit(|| panic!("boom")).await;
        assert!(matches!(result, Err(Error::Concurrency(_))));

        // The worker survives the panic
        assert_eq!(pool.submit(|| Ok(7)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let mut pool = WorkerPool::new(1, 4).unwrap();
        pool.shutdown();
        let result: Result<()> = pool.submit(|| Ok(())).await;
        assert!(matches!(result, Err(Error::Concurrency(_))));
    }

    #[test]
    fn test_zero_sized_pool_rejected() {
        assert!(WorkerPool::new(0, 4).is_err());
        assert!(WorkerPool::new(2, 0).is_err());
    }
}
