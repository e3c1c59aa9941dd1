//! Server related metrics.

//------------ ServerMetrics -------------------------------------------------

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Counters shared by the accept loop, the worker pool and connections.
///
/// All counters are updated with relaxed ordering. They are meant for
/// reporting, not for synchronisation.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub(super) num_connections: AtomicUsize,

    pub(super) num_queued_connections: AtomicUsize,

    pub(super) num_rejected_connections: AtomicUsize,

    pub(super) num_received_messages: AtomicUsize,

    pub(super) num_sent_responses: AtomicUsize,

    pub(super) num_faulted_connections: AtomicUsize,
}

impl ServerMetrics {
    /// Constructs initial metrics with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of connections currently being serviced by a worker.
    pub fn num_connections(&self) -> usize {
        self.num_connections.load(Ordering::Relaxed)
    }

    /// The number of accepted connections waiting for a worker.
    pub fn num_queued_connections(&self) -> usize {
        self.num_queued_connections.load(Ordering::Relaxed)
    }

    /// The number of connections closed on accept because the queue was
    /// full or the pool was shutting down.
    pub fn num_rejected_connections(&self) -> usize {
        self.num_rejected_connections.load(Ordering::Relaxed)
    }

    /// The number of complete messages taken off connections.
    pub fn num_received_messages(&self) -> usize {
        self.num_received_messages.load(Ordering::Relaxed)
    }

    /// The number of responses queued for sending.
    pub fn num_sent_responses(&self) -> usize {
        self.num_sent_responses.load(Ordering::Relaxed)
    }

    /// The number of connections torn down because of a fault or timeout.
    pub fn num_faulted_connections(&self) -> usize {
        self.num_faulted_connections.load(Ordering::Relaxed)
    }

    pub(super) fn inc(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn dec(counter: &AtomicUsize) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}
