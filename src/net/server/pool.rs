//! A fixed pool of worker threads servicing connections.
//!
//! The accept loop hands every accepted connection to the pool as a
//! [`Job`]. Jobs wait in a bounded queue until one of the workers is free.
//! Each worker owns a single threaded Tokio runtime and drives exactly one
//! connection on it at a time, reusing the runtime for the next one.
//!
//! Submission never blocks. If the queue is full the job is handed back
//! as rejected and dropped by the caller, which closes its socket.
use core::fmt;

use std::boxed::Box;
use std::error;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::string::String;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::vec::Vec;

use tokio::runtime::{self, Runtime};
use tracing::{debug, error, trace};

use super::metrics::ServerMetrics;

//------------ Job -----------------------------------------------------------

/// A unit of work executed by a worker.
pub trait Job: Send + 'static {
    /// Runs the job to completion on the worker's runtime.
    fn run(self: Box<Self>, rt: &Runtime);
}

impl<F> Job for F
where
    F: FnOnce(&Runtime) + Send + 'static,
{
    fn run(self: Box<Self>, rt: &Runtime) {
        (*self)(rt)
    }
}

//------------ WorkerPool ----------------------------------------------------

/// A fixed number of worker threads fed by a bounded queue.
pub struct WorkerPool {
    /// The sending end of the job queue. `None` after shutdown.
    sender: Mutex<Option<SyncSender<Box<dyn Job>>>>,

    /// The worker threads. Emptied by [`Self::join`].
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Set once the pool is shutting down.
    shutdown: Arc<AtomicBool>,

    num_workers: usize,

    queue_capacity: usize,

    metrics: Arc<ServerMetrics>,
}

impl WorkerPool {
    /// Starts `num_workers` workers sharing a queue of `queue_capacity`.
    ///
    /// With a capacity of zero, a job is only accepted if a worker is
    /// idle at the time of submission.
    pub fn new(
        num_workers: usize,
        queue_capacity: usize,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Self, io::Error> {
        let num_workers = num_workers.max(1);
        let (tx, rx) = mpsc::sync_channel::<Box<dyn Job>>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::with_capacity(num_workers)),
            shutdown,
            num_workers,
            queue_capacity,
            metrics,
        };

        for idx in 0..num_workers {
            // Build the runtime here so that failure reaches the caller.
            let rt = runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let worker = Worker {
                idx,
                rx: rx.clone(),
                shutdown: pool.shutdown.clone(),
                metrics: pool.metrics.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("dotserve-worker-{idx}"))
                .spawn(move || worker.run(rt));
            match handle {
                Ok(handle) => pool.lock_workers().push(handle),
                Err(err) => {
                    pool.shutdown();
                    pool.join();
                    return Err(err);
                }
            }
        }

        debug!(
            "Started {num_workers} workers with a queue of {queue_capacity}"
        );
        Ok(pool)
    }

    /// Returns the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Returns how many jobs may wait for a worker.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Returns whether [`Self::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Queues a job without blocking.
    ///
    /// On error the job has been dropped.
    pub fn submit(&self, job: Box<dyn Job>) -> Result<(), SubmitError> {
        let sender = self.lock_sender();
        let Some(sender) = sender.as_ref() else {
            ServerMetrics::inc(&self.metrics.num_rejected_connections);
            return Err(SubmitError::ShutDown);
        };

        // Count before sending so a fast worker cannot decrement first.
        ServerMetrics::inc(&self.metrics.num_queued_connections);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(err) => {
                ServerMetrics::dec(&self.metrics.num_queued_connections);
                ServerMetrics::inc(&self.metrics.num_rejected_connections);
                match err {
                    TrySendError::Full(_) => Err(SubmitError::QueueFull),
                    TrySendError::Disconnected(_) => {
                        Err(SubmitError::ShutDown)
                    }
                }
            }
        }
    }

    /// Stops accepting jobs.
    ///
    /// Jobs still waiting in the queue are dropped unrun. Jobs already
    /// running are left to finish. Calling this more than once is
    /// harmless.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!("Shutting down worker pool");
        }
        self.lock_sender().take();
    }

    /// Waits for all worker threads to exit.
    ///
    /// Only returns once [`Self::shutdown`] has been called and every
    /// running job has finished.
    pub fn join(&self) {
        let handles = std::mem::take(&mut *self.lock_workers());
        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }

    fn lock_sender(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<SyncSender<Box<dyn Job>>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--- Drop

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//--- Debug

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("shutdown", &self.is_shut_down())
            .finish()
    }
}

//------------ Worker --------------------------------------------------------

struct Worker {
    idx: usize,
    rx: Arc<Mutex<Receiver<Box<dyn Job>>>>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
}

impl Worker {
    fn run(self, rt: Runtime) {
        trace!("Worker {} started", self.idx);
        loop {
            let job = {
                let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
                rx.recv()
            };
            let Ok(job) = job else {
                // All senders are gone and the queue is drained.
                break;
            };
            ServerMetrics::dec(&self.metrics.num_queued_connections);

            if self.shutdown.load(Ordering::Acquire) {
                trace!("Worker {} dropping queued job", self.idx);
                continue;
            }

            let res = panic::catch_unwind(AssertUnwindSafe(|| job.run(&rt)));
            if let Err(payload) = res {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| String::from(*s))
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!("Worker {} job panicked: {reason}", self.idx);
            }
        }
        trace!("Worker {} stopped", self.idx);
    }
}

//------------ SubmitError ---------------------------------------------------

/// A job could not be queued.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitError {
    /// All queue slots are taken.
    QueueFull,

    /// The pool is shutting down.
    ShutDown,
}

//--- Display and Error

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubmitError::QueueFull => write!(f, "job queue is full"),
            SubmitError::ShutDown => write!(f, "worker pool is shut down"),
        }
    }
}

impl error::Error for SubmitError {}

//============ Testing =======================================================
