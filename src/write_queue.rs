//! Async write queue: deferred lower-tier writes.
//!
//! A bounded FIFO of [`WriteWork`] items drained by a single consumer task.
//! When the queue is full the caller gets its work back and performs the
//! write synchronously. Work items run with a child of the worker's
//! cancellation token, separate from the caller's token, so a cancelled
//! caller does not lose a queued write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CacheResult;

type WriteJob = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, CacheResult<()>> + Send>;

/// One deferred write. Carries the job and an optional completion signal.
pub struct WriteWork {
    label: String,
    job: WriteJob,
    done: Option<oneshot::Sender<CacheResult<()>>>,
}

impl WriteWork {
    /// Create a work item. The job receives the cancellation token it must
    /// observe while executing.
    pub fn new<F, Fut>(label: impl Into<String>, job: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = CacheResult<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            job: Box::new(move |token| Box::pin(job(token))),
            done: None,
        }
    }

    /// Execute immediately on the caller's task (the synchronous fallback).
    pub async fn execute_now(self, cancel: CancellationToken) -> CacheResult<()> {
        let Self { job, done, .. } = self;
        let result = job(cancel).await;
        if let Some(tx) = done {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(crate::error::CacheError::Config(e.to_string())),
            });
        }
        result
    }

    async fn run(self, cancel: CancellationToken) {
        let Self { label, job, done } = self;
        let result = job(cancel).await;
        if let Err(e) = &result {
            warn!(work = %label, error = %e, "queued write failed");
        }
        if let Some(tx) = done {
            let _ = tx.send(result);
        }
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    scheduled: AtomicU64,
    rejected: AtomicU64,
    executed: AtomicU64,
}

/// Snapshot of queue activity.
#[derive(Debug, Clone)]
pub struct WriteQueueStats {
    pub scheduled: u64,
    pub rejected: u64,
    pub executed: u64,
}

/// Bounded write queue with a single consumer task per instance.
pub struct AsyncWriteQueue {
    tx: Mutex<Option<mpsc::Sender<WriteWork>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    counters: QueueCounters,
}

impl AsyncWriteQueue {
    /// Create the queue and spawn its consumer. Capacity `0` disables the
    /// queue: every schedule attempt is rejected and writes stay synchronous.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let shutdown = CancellationToken::new();
        if capacity == 0 {
            debug!("async write queue disabled (capacity 0)");
            return Self {
                tx: Mutex::new(None),
                worker: Mutex::new(None),
                shutdown,
                counters: QueueCounters::default(),
            };
        }

        let (tx, rx) = mpsc::channel(capacity);
        let worker = tokio::spawn(Self::worker_loop(rx, shutdown.clone()));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            shutdown,
            counters: QueueCounters::default(),
        }
    }

    async fn worker_loop(mut rx: mpsc::Receiver<WriteWork>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                maybe_work = rx.recv() => match maybe_work {
                    Some(work) => work.run(shutdown.child_token()).await,
                    None => break,
                },
            }
        }
        // Best-effort drain of whatever is already queued.
        let mut drained = 0usize;
        while let Ok(work) = rx.try_recv() {
            work.run(shutdown.child_token()).await;
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "write queue drained on shutdown");
        }
    }

    /// Try to enqueue; on a full or disabled queue the work comes back and
    /// the caller must execute it synchronously.
    pub fn try_schedule(&self, work: WriteWork) -> Result<(), WriteWork> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(work);
        };
        match tx.try_send(work) {
            Ok(()) => {
                self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(work) | mpsc::error::TrySendError::Closed(work)) => {
                debug!(work = %work.label, "write queue full, caller falls back to synchronous write");
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(work)
            }
        }
    }

    /// Enqueue and return a completion signal the caller may await, so queued
    /// paths can still surface their error to the fan-out. Falls back to
    /// executing inline when the queue is full or disabled.
    pub async fn schedule_awaitable(
        &self,
        mut work: WriteWork,
    ) -> oneshot::Receiver<CacheResult<()>> {
        let (tx, rx) = oneshot::channel();
        work.done = Some(tx);
        if let Err(work) = self.try_schedule(work) {
            let _ = work.execute_now(self.shutdown.child_token()).await;
            self.counters.executed.fetch_add(1, Ordering::Relaxed);
        }
        rx
    }

    /// Whether scheduling can succeed at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.tx.lock().is_some()
    }

    #[must_use]
    pub fn stats(&self) -> WriteQueueStats {
        WriteQueueStats {
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
        }
    }

    /// Stop the consumer: signal shutdown, close the channel and await worker
    /// termination for at most `timeout`. Queued items are drained
    /// best-effort before the worker exits.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tx.lock().take();
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("write queue worker did not stop within {timeout:?}");
            }
        }
    }
}
