//! C7: the worker pool.
//!
//! A fixed number of workers draw jobs from an unbounded submission
//! channel. A worker that has processed a configured number of jobs
//! retires and is replaced by a fresh one; `0` disables recycling. A
//! job's own error handling (see [`crate::task`]) is responsible for
//! logging failures via the statistics store before re-raising; the pool
//! only has to make sure that re-raised error never escapes to crash a
//! worker loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::prelude::*;

/// One unit of work submitted to the pool.
pub type Job = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct Inner {
    receiver: AsyncMutex<mpsc::UnboundedReceiver<Job>>,
    requests_per_worker: usize,
    processed: AtomicU64,
    in_flight: AtomicI64,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

/// A bounded pool of concurrent workers.
pub struct WorkerPool {
    sender: StdMutex<Option<mpsc::UnboundedSender<Job>>>,
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Spawn `workers` worker loops, each recycled after
    /// `requests_per_worker` jobs (`0` = never).
    pub fn start(workers: usize, requests_per_worker: usize) -> WorkerPool {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            receiver: AsyncMutex::new(receiver),
            requests_per_worker,
            processed: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            handles: StdMutex::new(Vec::new()),
        });

        for _ in 0..workers {
            spawn_worker(inner.clone());
        }

        WorkerPool {
            sender: StdMutex::new(Some(sender)),
            inner,
        }
    }

    /// Submit a job without blocking the caller. Fails only if the pool
    /// has already been told to terminate.
    pub fn submit(&self, job: Job) -> Result<()> {
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(sender) => {
                self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                sender
                    .send(job)
                    .map_err(|_| format_err!("worker pool is no longer accepting jobs"))
            }
            None => Err(format_err!("worker pool is no longer accepting jobs")),
        }
    }

    /// Approximate count of jobs queued plus currently running.
    pub fn length(&self) -> i64 {
        self.inner.in_flight.load(Ordering::SeqCst).max(0)
    }

    /// Monotonically increasing count of jobs this pool has finished
    /// (successfully or not).
    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::SeqCst)
    }

    /// Stop accepting new jobs, give in-flight work up to `timeout` to
    /// finish, then forcibly abort anything still running.
    #[instrument(skip(self), level = "info")]
    pub async fn terminate(&self, timeout: Duration) {
        // Dropping the one and only sender closes the channel: every
        // worker's next `recv()` resolves to `None` once the queue drains.
        let _ = self
            .sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let handles =
            std::mem::take(&mut *self.inner.handles.lock().unwrap_or_else(|p| p.into_inner()));
        let drain = futures_util::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!("worker pool did not drain within timeout; jobs may be orphaned");
        }
    }
}

fn spawn_worker(inner: Arc<Inner>) {
    let handle = tokio::spawn(worker_loop(inner.clone()));
    inner
        .handles
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push(handle);
}

async fn worker_loop(inner: Arc<Inner>) {
    let mut processed_by_this_worker = 0usize;
    loop {
        let job = {
            let mut receiver = inner.receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            return;
        };

        if let Err(e) = job.await {
            tracing::error!(error = %e, "package task failed");
        }
        inner.processed.fetch_add(1, Ordering::SeqCst);
        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        processed_by_this_worker += 1;

        if inner.requests_per_worker != 0 && processed_by_this_worker >= inner.requests_per_worker
        {
            spawn_worker(inner);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_submitted_jobs() {
        let pool = WorkerPool::start(2, 0);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            pool.submit(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        pool.terminate(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.processed(), 5);
    }

    #[tokio::test]
    async fn failing_job_does_not_crash_pool() {
        let pool = WorkerPool::start(1, 0);
        pool.submit(Box::pin(async move { Err(format_err!("boom")) }))
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            pool.submit(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        pool.terminate(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_recycles_after_configured_count() {
        let pool = WorkerPool::start(1, 2);
        for _ in 0..4 {
            pool.submit(Box::pin(async move { Ok(()) })).unwrap();
        }
        pool.terminate(Duration::from_secs(5)).await;
        assert_eq!(pool.processed(), 4);
    }

    #[tokio::test]
    async fn submit_after_terminate_fails() {
        let pool = WorkerPool::start(1, 0);
        pool.terminate(Duration::from_secs(1)).await;
        assert!(pool.submit(Box::pin(async move { Ok(()) })).is_err());
    }
}
