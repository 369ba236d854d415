//! Process-wide run state
//!
//! One [`SystemState`] is built at startup and shared through an `Arc` with
//! every thread. It holds the cooperative cancellation flags, the live thread
//! counts, the statistics counters and the memory budget.

use crate::memory::MemoryBudget;
use crate::stats::histogram::{LatencyHistogram, LatencySummary};
use crate::stats::Counters;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{error, warn};

/// Which pool a thread belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Worker,
    Io,
}

impl std::fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadKind::Worker => write!(f, "worker"),
            ThreadKind::Io => write!(f, "io"),
        }
    }
}

/// Shared state handed to every component
#[derive(Debug)]
pub struct SystemState {
    /// Checked at loop-top by every thread
    end_all_threads: AtomicBool,
    /// Set at the start of shutdown; read/write queues refuse new requests
    no_new_io: AtomicBool,
    /// External stop requests (SIGUSR1 seen by a probe, Ctrl-C)
    stop_requests: AtomicU64,

    active_threads: AtomicUsize,
    active_workers: AtomicUsize,
    active_io_threads: AtomicUsize,
    peak_threads: AtomicUsize,

    next_request_id: AtomicU64,
    fatal: OnceLock<String>,
    io_latency: Mutex<LatencyHistogram>,

    pub counters: Counters,
    pub memory: Arc<MemoryBudget>,
}

impl SystemState {
    /// Build the state for a run with the given memory ceiling (0 = unlimited)
    pub fn new(memory_ceiling: u64) -> Arc<Self> {
        Arc::new(Self {
            end_all_threads: AtomicBool::new(false),
            no_new_io: AtomicBool::new(false),
            stop_requests: AtomicU64::new(0),
            active_threads: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            active_io_threads: AtomicUsize::new(0),
            peak_threads: AtomicUsize::new(0),
            next_request_id: AtomicU64::new(1),
            fatal: OnceLock::new(),
            io_latency: Mutex::new(LatencyHistogram::new()),
            counters: Counters::default(),
            memory: MemoryBudget::new(memory_ceiling),
        })
    }

    // -- cancellation ------------------------------------------------------

    #[inline]
    pub fn end_all(&self) -> bool {
        self.end_all_threads.load(Ordering::Acquire)
    }

    pub fn set_end_all(&self) {
        self.end_all_threads.store(true, Ordering::Release);
    }

    #[inline]
    pub fn no_new_io(&self) -> bool {
        self.no_new_io.load(Ordering::Acquire)
    }

    pub fn close_io(&self) {
        self.no_new_io.store(true, Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.stop_requests.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stop_requests(&self) -> u64 {
        self.stop_requests.load(Ordering::Acquire)
    }

    /// Stop the whole run because shared state can no longer be trusted
    ///
    /// The first reason is kept for the report; later ones are only logged.
    pub fn escalate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.fatal.set(reason.clone()).is_ok() {
            error!(%reason, "unrecoverable failure, ending all threads");
        } else {
            warn!(%reason, "further unrecoverable failure");
        }
        self.set_end_all();
    }

    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal.get().map(String::as_str)
    }

    // -- thread accounting -------------------------------------------------

    /// Count a thread that is about to be spawned
    ///
    /// Callers hold the pool lock and have already checked the maximum.
    pub fn register(&self, kind: ThreadKind) {
        match kind {
            ThreadKind::Worker => {
                self.active_workers.fetch_add(1, Ordering::AcqRel);
                self.counters.workers_started.incr();
            }
            ThreadKind::Io => {
                self.active_io_threads.fetch_add(1, Ordering::AcqRel);
                self.counters.io_threads_started.incr();
            }
        }
        let now = self.active_threads.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_threads.fetch_max(now, Ordering::AcqRel);
    }

    /// Undo [`register`](Self::register) when a thread ends
    ///
    /// A worker that retired itself through [`try_retire_worker`](Self::try_retire_worker)
    /// has already left the worker count.
    pub fn unregister(&self, kind: ThreadKind, retired: bool) {
        match kind {
            ThreadKind::Worker if !retired => {
                self.active_workers.fetch_sub(1, Ordering::AcqRel);
            }
            ThreadKind::Worker => {}
            ThreadKind::Io => {
                self.active_io_threads.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self.active_threads.fetch_sub(1, Ordering::AcqRel);
    }

    /// Leave the worker count if at least one other worker stays behind
    pub fn try_retire_worker(&self) -> bool {
        let retired = self
            .active_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 1).then(|| n - 1)
            })
            .is_ok();
        if retired {
            self.counters.workers_retired.incr();
        }
        retired
    }

    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    pub fn active_io_threads(&self) -> usize {
        self.active_io_threads.load(Ordering::Acquire)
    }

    pub fn peak_threads(&self) -> usize {
        self.peak_threads.load(Ordering::Acquire)
    }

    pub fn update_peak(&self) {
        self.peak_threads
            .fetch_max(self.active_threads(), Ordering::AcqRel);
    }

    // -- I/O bookkeeping ---------------------------------------------------

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fold an I/O thread's private latency histogram into the shared one
    pub fn merge_io_latency(&self, local: &LatencyHistogram) {
        if local.is_empty() {
            return;
        }
        match self.io_latency.lock() {
            Ok(mut shared) => {
                if let Err(e) = shared.merge(local) {
                    warn!(error = %e, "dropping I/O latency samples");
                }
            }
            Err(_) => self.escalate("I/O latency histogram lock poisoned"),
        }
    }

    pub fn io_latency_summary(&self) -> Option<LatencySummary> {
        match self.io_latency.lock() {
            Ok(hist) => hist.summary(),
            Err(poisoned) => poisoned.into_inner().summary(),
        }
    }
}
