//! Statistics collection
//!
//! Every thread updates the same process-wide counters, so each counter sits
//! on its own cache line. Nothing here resets during a run; the report reads a
//! [`StatsSnapshot`] once all threads have stopped.

pub mod histogram;

use crate::engine::OperationType;
use crate::state::SystemState;
use histogram::LatencySummary;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cache-line aligned atomic counter to prevent false sharing
///
/// ```text
/// [value: 8 bytes][padding: 56 bytes] = 64 bytes total
/// ```
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    /// Add to the counter
    ///
    /// Relaxed ordering: counters are independent and only read for reporting.
    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-direction I/O counters (one set for reads, one for writes)
#[derive(Debug, Default)]
pub struct DirectionCounters {
    /// Bytes handed to the engine
    pub attempted_bytes: AlignedCounter,
    /// Bytes folded in by the submitting worker after reclaiming its request
    pub completed_bytes: AlignedCounter,
    pub failed: AlignedCounter,
    pub timeouts: AlignedCounter,
    pub incomplete: AlignedCounter,
    /// Sum of (requested - transferred) over incomplete transfers
    pub shortfall_bytes: AlignedCounter,
}

/// Every counter the run maintains besides the live thread counts
#[derive(Debug, Default)]
pub struct Counters {
    // Thread lifecycle
    pub workers_started: AlignedCounter,
    pub io_threads_started: AlignedCounter,
    pub workers_retired: AlignedCounter,
    pub spawn_failures: AlignedCounter,

    // Memory
    pub alloc_rejected: AlignedCounter,
    pub alloc_failed: AlignedCounter,
    pub touch_write_bytes: AlignedCounter,
    pub touch_read_bytes: AlignedCounter,
    /// Running sum of touched words; only read so the summing isn't elided
    pub touch_checksum: AlignedCounter,

    // Probe action
    pub probe_attempts: AlignedCounter,
    pub probe_applied: AlignedCounter,
    pub probe_failures: AlignedCounter,
    pub probe_long_waits: AlignedCounter,
    pub probe_short_waits: AlignedCounter,
    pub probe_interrupted: AlignedCounter,
    pub probe_timed_out_nanos: AlignedCounter,
    pub probe_interrupted_nanos: AlignedCounter,

    // I/O dispatch
    pub io_queued: AlignedCounter,
    pub io_rejected: AlignedCounter,
    pub io_tried: AlignedCounter,
    pub io_finished: AlignedCounter,
    pub read: DirectionCounters,
    pub write: DirectionCounters,

    // Nodes still queued when teardown cleared the queues
    pub leftover_read: AlignedCounter,
    pub leftover_write: AlignedCounter,
    pub leftover_done: AlignedCounter,
}

impl Counters {
    /// Counters for one transfer direction
    pub fn direction(&self, op: OperationType) -> &DirectionCounters {
        match op {
            OperationType::Read => &self.read,
            OperationType::Write => &self.write,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadSnapshot {
    pub workers_started: u64,
    pub io_threads_started: u64,
    pub peak: u64,
    pub active_at_end: u64,
    pub io_active_at_end: u64,
    pub workers_retired: u64,
    pub spawn_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub ceiling: u64,
    pub in_use_at_end: u64,
    pub peak: u64,
    pub allocations: u64,
    pub frees: u64,
    pub rejected: u64,
    pub failed: u64,
    pub touch_read_bytes: u64,
    pub touch_write_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeSnapshot {
    pub attempts: u64,
    pub applied: u64,
    pub failures: u64,
    pub long_waits: u64,
    pub short_waits: u64,
    pub interrupted: u64,
    pub timed_out_secs: f64,
    pub interrupted_secs: f64,
    pub stop_signals: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectionSnapshot {
    pub attempted_bytes: u64,
    pub completed_bytes: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub incomplete: u64,
    pub shortfall_bytes: u64,
}

impl From<&DirectionCounters> for DirectionSnapshot {
    fn from(c: &DirectionCounters) -> Self {
        Self {
            attempted_bytes: c.attempted_bytes.get(),
            completed_bytes: c.completed_bytes.get(),
            failed: c.failed.get(),
            timeouts: c.timeouts.get(),
            incomplete: c.incomplete.get(),
            shortfall_bytes: c.shortfall_bytes.get(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IoSnapshot {
    pub queued: u64,
    pub rejected: u64,
    pub tried: u64,
    pub finished: u64,
    pub read: DirectionSnapshot,
    pub write: DirectionSnapshot,
    pub leftover_read: u64,
    pub leftover_write: u64,
    pub leftover_done: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySummary>,
}

/// Read-only copy of every counter, taken at the end of the run
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub elapsed_secs: f64,
    pub threads: ThreadSnapshot,
    pub memory: MemorySnapshot,
    pub probe: ProbeSnapshot,
    pub io: IoSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl StatsSnapshot {
    pub fn capture(state: &SystemState, elapsed: Duration) -> Self {
        let c = &state.counters;
        let memory = &state.memory;

        Self {
            elapsed_secs: elapsed.as_secs_f64(),
            threads: ThreadSnapshot {
                workers_started: c.workers_started.get(),
                io_threads_started: c.io_threads_started.get(),
                peak: state.peak_threads() as u64,
                active_at_end: state.active_threads() as u64,
                io_active_at_end: state.active_io_threads() as u64,
                workers_retired: c.workers_retired.get(),
                spawn_failures: c.spawn_failures.get(),
            },
            memory: MemorySnapshot {
                ceiling: memory.ceiling(),
                in_use_at_end: memory.in_use(),
                peak: memory.peak(),
                allocations: memory.allocations(),
                frees: memory.frees(),
                rejected: c.alloc_rejected.get(),
                failed: c.alloc_failed.get(),
                touch_read_bytes: c.touch_read_bytes.get(),
                touch_write_bytes: c.touch_write_bytes.get(),
            },
            probe: ProbeSnapshot {
                attempts: c.probe_attempts.get(),
                applied: c.probe_applied.get(),
                failures: c.probe_failures.get(),
                long_waits: c.probe_long_waits.get(),
                short_waits: c.probe_short_waits.get(),
                interrupted: c.probe_interrupted.get(),
                timed_out_secs: Duration::from_nanos(c.probe_timed_out_nanos.get()).as_secs_f64(),
                interrupted_secs: Duration::from_nanos(c.probe_interrupted_nanos.get())
                    .as_secs_f64(),
                stop_signals: state.stop_requests(),
            },
            io: IoSnapshot {
                queued: c.io_queued.get(),
                rejected: c.io_rejected.get(),
                tried: c.io_tried.get(),
                finished: c.io_finished.get(),
                read: DirectionSnapshot::from(&c.read),
                write: DirectionSnapshot::from(&c.write),
                leftover_read: c.leftover_read.get(),
                leftover_write: c.leftover_write.get(),
                leftover_done: c.leftover_done.get(),
                latency: state.io_latency_summary(),
            },
            aborted: state.fatal_reason().map(str::to_owned),
        }
    }

    /// Mean number of probe waits per worker thread started
    pub fn probe_waits_per_worker(&self) -> f64 {
        per_worker(self.probe.attempts, self.threads.workers_started)
    }

    /// Mean number of probe reapplications per worker thread started
    pub fn probe_applied_per_worker(&self) -> f64 {
        per_worker(self.probe.applied, self.threads.workers_started)
    }
}

fn per_worker(total: u64, workers: u64) -> f64 {
    if workers == 0 {
        0.0
    } else {
        total as f64 / workers as f64
    }
}
