//! Bounded worker pool executing blocking filesystem jobs on dedicated threads.
//!
//! # Design
//! - A fixed set of named OS threads drains one bounded queue, so at most `workers` jobs run
//!   at once and at most `queue_capacity` wait.
//! - Submission is async: handlers await queue space and race it against their own
//!   cancellation token and an optional deadline.
//! - A panicking job is caught, logged and counted; the worker keeps draining the queue.
//! - `stop` is terminal and idempotent: new submissions are refused, queued jobs still run,
//!   and the call returns once every worker thread has exited.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{FsOpsError, FsOpsResult};

/// Unit of blocking work executed by a [`WorkerPool`].
pub trait Job: Send + 'static {
    /// Short label used in logs.
    fn kind(&self) -> &'static str;

    /// Run to completion, reporting results through channels owned by the job.
    fn execute(self: Box<Self>);
}

/// Sizing and admission settings for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name used for thread names, logs and metrics labels.
    pub name: &'static str,
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum number of queued, not yet running, jobs.
    pub queue_capacity: usize,
    /// Upper bound on how long [`WorkerPool::try_submit`] waits for queue space.
    pub submit_timeout: Option<Duration>,
}

/// Reason a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The caller's cancellation token fired first.
    Cancelled,
    /// The queue stayed full for the whole submit timeout.
    TimedOut,
    /// The pool has been stopped.
    Closed,
}

impl RejectReason {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Closed => "closed",
        }
    }
}

/// A job handed back to the caller because it was never queued.
pub struct Rejected<J> {
    job: J,
    reason: RejectReason,
}

impl<J> Rejected<J> {
    /// Why the submission was refused.
    #[must_use]
    pub const fn reason(&self) -> RejectReason {
        self.reason
    }

    /// Recover the job so its resources can be released.
    #[must_use]
    pub fn into_job(self) -> J {
        self.job
    }
}

impl<J> fmt::Debug for Rejected<J> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Pool name.
    pub name: &'static str,
    /// Number of worker threads.
    pub workers: usize,
    /// Queue capacity.
    pub queue_capacity: usize,
    /// Jobs waiting in the queue.
    pub queued: usize,
    /// Jobs currently executing.
    pub active: usize,
    /// Highest observed number of concurrently executing jobs.
    pub peak_active: usize,
    /// Jobs that returned normally.
    pub completed: u64,
    /// Jobs that panicked.
    pub panicked: u64,
    /// Submissions refused.
    pub rejected: u64,
}

type BoxedJob = Box<dyn Job>;

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    peak_active: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn begin(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn finish(&self, panicked: bool) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if panicked {
            self.panicked.fetch_add(1, Ordering::SeqCst);
        } else {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Fixed-size pool of worker threads fed by a bounded queue.
pub struct WorkerPool {
    name: &'static str,
    worker_count: usize,
    queue_capacity: usize,
    submit_timeout: Option<Duration>,
    sender: Mutex<Option<mpsc::Sender<BoxedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Spawn the worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::InvalidInput`] for a zero worker count or queue capacity and
    /// [`FsOpsError::WorkerSpawn`] when a thread cannot be started.
    pub fn new(config: &PoolConfig) -> FsOpsResult<Self> {
        if config.workers == 0 {
            return Err(FsOpsError::invalid("workers", "zero", config.name));
        }
        if config.queue_capacity == 0 {
            return Err(FsOpsError::invalid("queue_capacity", "zero", config.name));
        }

        let (sender, receiver) = mpsc::channel::<BoxedJob>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let receiver = Arc::clone(&receiver);
            let counters = Arc::clone(&counters);
            let pool = config.name;
            let handle = thread::Builder::new()
                .name(format!("{pool}-worker-{index}"))
                .spawn(move || worker_loop(pool, index, &receiver, &counters))
                .map_err(|source| FsOpsError::WorkerSpawn { pool, source })?;
            workers.push(handle);
        }

        info!(
            pool = config.name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );
        Ok(Self {
            name: config.name,
            worker_count: config.workers,
            queue_capacity: config.queue_capacity,
            submit_timeout: config.submit_timeout,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    /// Pool name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a job, waiting for queue space as long as it takes.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::PoolRejected`] once the pool has been stopped.
    pub async fn submit<J: Job>(&self, job: J) -> FsOpsResult<()> {
        let Some(sender) = self.sender_handle() else {
            return Err(self.refuse(RejectReason::Closed));
        };
        let boxed: BoxedJob = Box::new(job);
        sender
            .send(boxed)
            .await
            .map_err(|_| self.refuse(RejectReason::Closed))
    }

    /// Enqueue a job unless the caller cancels, the submit timeout elapses or the pool stops
    /// first. A refused job is handed back untouched.
    ///
    /// # Errors
    ///
    /// Returns the job together with the [`RejectReason`].
    pub async fn try_submit<J: Job>(
        &self,
        job: J,
        cancel: &CancellationToken,
    ) -> Result<(), Rejected<J>> {
        let reason = if cancel.is_cancelled() {
            RejectReason::Cancelled
        } else if let Some(sender) = self.sender_handle() {
            let deadline = async {
                match self.submit_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                reserved = sender.reserve() => match reserved {
                    Ok(permit) => {
                        permit.send(Box::new(job));
                        return Ok(());
                    }
                    Err(_) => RejectReason::Closed,
                },
                () = cancel.cancelled() => RejectReason::Cancelled,
                () = deadline => RejectReason::TimedOut,
            }
        } else {
            RejectReason::Closed
        };

        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        debug!(pool = self.name, reason = reason.as_str(), "job submission rejected");
        Err(Rejected { job, reason })
    }

    /// Refuse new work, let queued jobs finish and join every worker thread.
    ///
    /// Blocks the calling thread; async callers should use `spawn_blocking`.
    pub fn stop(&self) {
        let Some(sender) = lock(&self.sender).take() else {
            return;
        };
        drop(sender);
        let workers = std::mem::take(&mut *lock(&self.workers));
        info!(pool = self.name, workers = workers.len(), "stopping worker pool");
        for handle in workers {
            if handle.join().is_err() {
                error!(pool = self.name, "worker thread panicked outside a job");
            }
        }
        info!(pool = self.name, "worker pool stopped");
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let queued = self
            .sender_handle()
            .map_or(0, |sender| self.queue_capacity.saturating_sub(sender.capacity()));
        PoolStats {
            name: self.name,
            workers: self.worker_count,
            queue_capacity: self.queue_capacity,
            queued,
            active: self.counters.active.load(Ordering::SeqCst),
            peak_active: self.counters.peak_active.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            panicked: self.counters.panicked.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
        }
    }

    fn sender_handle(&self) -> Option<mpsc::Sender<BoxedJob>> {
        lock(&self.sender).clone()
    }

    fn refuse(&self, reason: RejectReason) -> FsOpsError {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        FsOpsError::PoolRejected {
            pool: self.name,
            reason,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit on their own once the queue closes; detach instead of joining.
        lock(&self.sender).take();
    }
}

fn worker_loop(
    pool: &'static str,
    index: usize,
    receiver: &Mutex<mpsc::Receiver<BoxedJob>>,
    counters: &Counters,
) {
    debug!(pool, worker = index, "worker started");
    loop {
        let next = lock(receiver).blocking_recv();
        let Some(job) = next else {
            break;
        };
        let kind = job.kind();
        counters.begin();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || job.execute()));
        counters.finish(outcome.is_err());
        if let Err(payload) = outcome {
            error!(
                pool,
                worker = index,
                job = kind,
                panic = %panic_message(payload.as_ref()),
                "job panicked"
            );
        }
    }
    debug!(pool, worker = index, "worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
