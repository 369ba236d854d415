//! Worker threads
//!
//! A worker loops until end-all-threads is set, each time rolling an
//! [`Activity`] and carrying it out. It holds at most one memory [`Block`] at
//! a time. During an I/O round trip the block travels inside the request, so
//! the worker has nothing to touch or free until it reclaims the request from
//! the done queue.
//!
//! # Activities
//!
//! - **Allocate / Free**: take or return a block from the memory budget
//! - **TouchWrite / TouchRead**: zero the block, or sum its words
//! - **SelfTerminate**: rarely, leave the pool (short-lived mode only)
//! - **Probe** (two outcomes): wait, then re-apply the idempotent probe action
//! - **IoRoundTrip**: hand the block to an I/O thread and wait for it back
//! - **Idle**: sleep for one to two poll intervals
//!
//! The I/O threads live in [`io`], the probe implementations in [`probe`].

pub mod activity;
pub mod io;
pub mod probe;

use crate::engine::OperationType;
use crate::error::MemoryError;
use crate::memory::{Block, MemoryBudget};
use crate::queue::{Completion, IoQueues, IoRequest};
use crate::state::SystemState;
use activity::Activity;
use probe::{Probe, WaitOutcome};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Odds (1 in N) that a self-terminate roll actually retires the worker
pub const RETIRE_ODDS: u32 = 800;

/// Odds (1 in N) that a probe takes the long wait
pub const LONG_WAIT_ODDS: u32 = 8;

/// Allocation size used when the random size comes out as zero
const FALLBACK_ALLOC: u64 = 4096;

/// Per-worker tunables
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub max_io_size: usize,
    pub poll_interval: Duration,
    pub probe_short_wait: Duration,
    pub probe_long_wait: Duration,
    /// Workers may retire themselves and get replaced
    pub short_lived: bool,
}

/// Why a worker left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// End-all-threads was set
    Stopped,
    /// The worker retired itself
    Retired,
}

/// Result of polling a worker's completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    Shutdown,
}

/// Poll `completion` every `poll` until it fires or end-all-threads is set
pub fn wait_for_completion(completion: &Completion, state: &SystemState, poll: Duration) -> WaitResult {
    loop {
        if completion.try_wait() {
            return WaitResult::Signaled;
        }
        if state.end_all() {
            return WaitResult::Shutdown;
        }
        thread::sleep(poll);
    }
}

/// Size for the next allocation
///
/// Uniform in `0..=max_io_size`, capped by what the budget still has. A zero
/// draw falls back to 4 KiB, or half of the remaining budget (unlimited: of
/// the memory in use) when that is smaller, and never below 8 bytes.
pub fn allocation_size<R: Rng + ?Sized>(rng: &mut R, max_io_size: usize, budget: &MemoryBudget) -> usize {
    let available = budget.available();
    let mut size = rng.gen_range(0..=max_io_size as u64);

    if size == 0 {
        let reference = available.unwrap_or_else(|| budget.in_use());
        size = if reference > FALLBACK_ALLOC {
            FALLBACK_ALLOC
        } else {
            (reference / 2).max(8)
        };
    }
    if let Some(available) = available {
        if available > 0 {
            size = size.min(available);
        }
    }
    size as usize
}

/// One worker thread
pub struct Worker {
    id: u32,
    state: Arc<SystemState>,
    queues: Arc<IoQueues>,
    probe: Arc<dyn Probe>,
    settings: WorkerSettings,
    block: Option<Block>,
    completion: Completion,
    rng: Xoshiro256PlusPlus,
}

impl Worker {
    pub fn new(
        id: u32,
        state: Arc<SystemState>,
        queues: Arc<IoQueues>,
        probe: Arc<dyn Probe>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            state,
            queues,
            probe,
            settings,
            block: None,
            completion: Completion::new(),
            rng: Xoshiro256PlusPlus::from_entropy(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Run activities until stopped or retired
    ///
    /// A held block is freed on the way out; one still travelling with an
    /// unclaimed request is freed when the queues are cleared.
    pub fn run(mut self) -> WorkerExit {
        trace!(thread = self.id, "worker started");

        let exit = loop {
            if self.state.end_all() {
                break WorkerExit::Stopped;
            }
            let activity = Activity::pick(&mut self.rng);
            if self.step(activity).is_break() {
                break WorkerExit::Retired;
            }
        };

        self.block = None;
        trace!(thread = self.id, ?exit, "worker ending");
        exit
    }

    /// Carry out one activity; `Break` means the worker retired
    pub fn step(&mut self, activity: Activity) -> ControlFlow<()> {
        match activity {
            Activity::Allocate => self.allocate(),
            Activity::Free => self.free(),
            Activity::TouchWrite => self.touch_write(),
            Activity::TouchRead => self.touch_read(),
            Activity::SelfTerminate => {
                if self.try_retire() {
                    return ControlFlow::Break(());
                }
            }
            Activity::Probe | Activity::ProbeRepeat => self.probe(),
            Activity::IoRoundTrip => self.io_round_trip(),
            Activity::Idle => self.idle(),
        }
        ControlFlow::Continue(())
    }

    fn allocate(&mut self) {
        if self.block.is_some() {
            return;
        }
        let size = allocation_size(&mut self.rng, self.settings.max_io_size, &self.state.memory);

        match self.state.memory.alloc(size) {
            Ok(block) => self.block = Some(block),
            Err(e @ MemoryError::OutOfBudget { .. }) => {
                self.state.counters.alloc_rejected.incr();
                trace!(thread = self.id, error = %e, "allocation rejected");
            }
            Err(e @ MemoryError::AllocationFailed { .. }) => {
                self.state.counters.alloc_failed.incr();
                debug!(thread = self.id, error = %e, "allocation failed");
            }
        }
    }

    fn free(&mut self) {
        if let Some(block) = self.block.take() {
            self.state.memory.free(block);
        }
    }

    fn touch_write(&mut self) {
        if let Some(block) = self.block.as_mut() {
            let written = block.zero();
            self.state.counters.touch_write_bytes.add(written as u64);
        }
    }

    fn touch_read(&mut self) {
        if let Some(block) = self.block.as_ref() {
            let (sum, read) = block.checksum();
            self.state.counters.touch_read_bytes.add(read as u64);
            self.state.counters.touch_checksum.add(sum);
        }
    }

    fn try_retire(&mut self) -> bool {
        // --long-threads keeps every worker alive until shutdown; only short-lived pools retire
        if !self.settings.short_lived || !self.rng.gen_ratio(1, RETIRE_ODDS) {
            return false;
        }
        let retired = self.state.try_retire_worker();
        if retired {
            debug!(thread = self.id, "worker retiring");
        }
        retired
    }

    fn probe(&mut self) {
        let counters = &self.state.counters;
        counters.probe_attempts.incr();

        let long = self.rng.gen_ratio(1, LONG_WAIT_ODDS);
        let timeout = if long {
            self.settings.probe_long_wait
        } else {
            self.settings.probe_short_wait
        };

        let started = Instant::now();
        let outcome = self.probe.wait(timeout);
        let waited = started.elapsed().as_nanos() as u64;

        match outcome {
            WaitOutcome::TimedOut => {
                counters.probe_timed_out_nanos.add(waited);
                if long {
                    counters.probe_long_waits.incr();
                } else {
                    counters.probe_short_waits.incr();
                }
            }
            WaitOutcome::Interrupted => {
                counters.probe_interrupted.incr();
                counters.probe_interrupted_nanos.add(waited);
            }
            WaitOutcome::StopRequested => {
                counters.probe_interrupted.incr();
                counters.probe_interrupted_nanos.add(waited);
                info!(thread = self.id, "stop requested by SIGUSR1");
                self.state.request_stop();
            }
        }

        match self.probe.apply() {
            Ok(()) => counters.probe_applied.incr(),
            Err(e) => {
                counters.probe_failures.incr();
                debug!(thread = self.id, probe = self.probe.name(), error = %e, "probe failed");
            }
        }
    }

    fn io_round_trip(&mut self) {
        if self.state.active_io_threads() == 0 {
            return;
        }
        let Some(block) = self.block.take() else {
            return;
        };

        let len = self.rng.gen_range(1..=block.len().max(1));
        let op = if self.rng.gen_bool(0.5) {
            OperationType::Read
        } else {
            OperationType::Write
        };
        let id = self.state.next_request_id();
        let req = IoRequest::new(id, op, block, len, Some(self.completion.handle()));

        match self.queues.for_op(op).enqueue(req) {
            Ok(()) => self.state.counters.io_queued.incr(),
            Err(e) => {
                self.state.counters.io_rejected.incr();
                trace!(thread = self.id, error = %e, "request refused");
                self.block = Some(e.into_request().into_block());
                return;
            }
        }

        if wait_for_completion(&self.completion, &self.state, self.settings.poll_interval)
            == WaitResult::Shutdown
        {
            debug!(thread = self.id, request = id, "shutdown while request in flight");
            return;
        }

        match self.queues.done.remove(id) {
            Some(req) => {
                self.state
                    .counters
                    .direction(op)
                    .completed_bytes
                    .add(req.done() as u64);
                self.block = Some(req.into_block());
            }
            None => self.state.escalate(format!(
                "worker {} was woken but request {} is not on the done queue",
                self.id, id
            )),
        }
    }

    fn idle(&mut self) {
        let poll = self.settings.poll_interval;
        thread::sleep(self.rng.gen_range(poll..=poll * 2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBehavior, MockEngine};
    use crate::engine::sync::SyncEngine;
    use crate::engine::{EngineConfig, IOEngine};
    use crate::state::ThreadKind;
    use crate::target::DataFile;
    use io::{IoSettings, IoWorker};
    use probe::{create_probe, ProbeKind};
    use tempfile::TempDir;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            max_io_size: 64 * 1024,
            poll_interval: Duration::from_millis(5),
            probe_short_wait: Duration::from_micros(100),
            probe_long_wait: Duration::from_millis(2),
            short_lived: true,
        }
    }

    fn worker(state: &Arc<SystemState>, queues: &Arc<IoQueues>) -> Worker {
        Worker::new(
            1,
            Arc::clone(state),
            Arc::clone(queues),
            Arc::from(create_probe(ProbeKind::None)),
            settings(),
        )
    }

    #[test]
    fn test_allocation_size_bounds() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);

        let unlimited = MemoryBudget::new(0);
        for _ in 0..1000 {
            let size = allocation_size(&mut rng, 10_000, &unlimited);
            assert!((1..=10_000).contains(&size), "size={}", size);
        }

        let tight = MemoryBudget::new(3000);
        let _held = tight.alloc(2000).unwrap();
        for _ in 0..1000 {
            let size = allocation_size(&mut rng, 10_000, &tight);
            assert!((1..=1000).contains(&size), "size={}", size);
        }
    }

    #[test]
    fn test_zero_draw_fallback() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        // max_io_size 0 always draws zero
        let unlimited = MemoryBudget::new(0);
        assert_eq!(allocation_size(&mut rng, 0, &unlimited), 8);

        let _held = unlimited.alloc(100_000).unwrap();
        assert_eq!(allocation_size(&mut rng, 0, &unlimited), 4096);

        let small = MemoryBudget::new(1000);
        assert_eq!(allocation_size(&mut rng, 0, &small), 500);
    }

    #[test]
    fn test_memory_activities() {
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);
        let mut worker = worker(&state, &queues);

        // Touching without a block is a no-op
        assert!(worker.step(Activity::TouchWrite).is_continue());
        assert_eq!(state.counters.touch_write_bytes.get(), 0);

        worker.step(Activity::Allocate);
        let size = worker.block.as_ref().unwrap().len() as u64;
        assert_eq!(state.memory.in_use(), size);

        // A second allocate keeps the held block
        worker.step(Activity::Allocate);
        assert_eq!(state.memory.allocations(), 1);

        worker.step(Activity::TouchWrite);
        worker.step(Activity::TouchRead);
        assert_eq!(state.counters.touch_write_bytes.get(), size);
        assert_eq!(state.counters.touch_read_bytes.get(), size / 8 * 8);

        worker.step(Activity::Free);
        assert!(worker.block.is_none());
        assert_eq!(state.memory.in_use(), 0);
    }

    #[test]
    fn test_allocation_over_budget_is_counted() {
        let state = SystemState::new(4096);
        let queues = IoQueues::new(&state);
        let _hog = state.memory.alloc(4096).unwrap();
        let mut worker = worker(&state, &queues);

        worker.step(Activity::Allocate);
        assert!(worker.block.is_none());
        assert_eq!(state.counters.alloc_rejected.get(), 1);
        assert_eq!(state.memory.in_use(), 4096);
    }

    #[test]
    fn test_self_terminate_rules() {
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);
        state.register(ThreadKind::Worker);
        state.register(ThreadKind::Io);

        // Sole worker: never retires however often it rolls
        let mut sole = worker(&state, &queues);
        for _ in 0..10_000 {
            assert!(sole.step(Activity::SelfTerminate).is_continue());
        }

        // Long-lived workers never retire either
        state.register(ThreadKind::Worker);
        let mut pinned = worker(&state, &queues);
        pinned.settings.short_lived = false;
        for _ in 0..10_000 {
            assert!(pinned.step(Activity::SelfTerminate).is_continue());
        }

        let mut retired = 0;
        for _ in 0..100_000 {
            if sole.step(Activity::SelfTerminate).is_break() {
                retired += 1;
                break;
            }
        }
        assert_eq!(retired, 1);
        assert_eq!(state.active_workers(), 1);
    }

    #[test]
    fn test_probe_reapplies_every_time() {
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);
        let mut worker = worker(&state, &queues);

        for _ in 0..40 {
            worker.step(Activity::Probe);
            worker.step(Activity::ProbeRepeat);
        }
        let c = &state.counters;
        assert_eq!(c.probe_attempts.get(), 80);
        assert_eq!(c.probe_applied.get(), 80);
        assert_eq!(c.probe_long_waits.get() + c.probe_short_waits.get(), 80);
        assert_eq!(c.probe_interrupted.get(), 0);
        assert!(c.probe_timed_out_nanos.get() > 0);
    }

    #[test]
    fn test_round_trip_needs_io_thread_and_block() {
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);
        let mut worker = worker(&state, &queues);

        worker.step(Activity::Allocate);
        worker.step(Activity::IoRoundTrip);
        assert!(worker.block.is_some());
        assert_eq!(state.counters.io_queued.get(), 0);
    }

    #[test]
    fn test_refused_round_trip_keeps_block() {
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);
        state.register(ThreadKind::Io);
        state.close_io();
        let mut worker = worker(&state, &queues);

        worker.step(Activity::Allocate);
        let held = state.memory.in_use();
        worker.step(Activity::IoRoundTrip);

        assert!(worker.block.is_some());
        assert_eq!(state.memory.in_use(), held);
        assert_eq!(state.counters.io_rejected.get(), 1);
        assert!(!queues.any_pending());
    }

    #[test]
    fn test_round_trip_through_io_thread() {
        let temp_dir = TempDir::new().unwrap();
        let data = Arc::new(DataFile::create(&temp_dir.path().join("rt.dat"), 1 << 20).unwrap());
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);

        let mut engine = SyncEngine::new();
        engine.init(&EngineConfig::default()).unwrap();
        let io_worker = IoWorker::new(
            Arc::clone(&state),
            Arc::clone(&queues),
            data,
            Box::new(engine),
            IoSettings {
                timeout: Duration::from_secs(3),
                poll_interval: Duration::from_millis(5),
            },
        )
        .unwrap();
        state.register(ThreadKind::Io);
        let io_thread = thread::spawn(move || io_worker.run(2));

        let mut worker = worker(&state, &queues);
        for _ in 0..20 {
            worker.step(Activity::Allocate);
            worker.step(Activity::IoRoundTrip);
            assert!(worker.block.is_some());
        }
        state.set_end_all();
        io_thread.join().unwrap();

        let c = &state.counters;
        assert_eq!(c.io_queued.get(), 20);
        assert_eq!(c.io_finished.get(), 20);
        let attempted = c.read.attempted_bytes.get() + c.write.attempted_bytes.get();
        let completed = c.read.completed_bytes.get() + c.write.completed_bytes.get();
        assert!(completed > 0);
        assert!(completed <= attempted);
        assert!(queues.done.is_empty());
    }

    #[test]
    fn test_wait_ends_on_shutdown_with_request_in_flight() {
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);
        // An I/O thread is counted but never services anything
        state.register(ThreadKind::Io);

        let mut worker = worker(&state, &queues);
        worker.step(Activity::Allocate);
        let runner = thread::spawn(move || {
            worker.step(Activity::IoRoundTrip);
            worker.block.is_none()
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!runner.is_finished());
        state.set_end_all();
        // The buffer stays with the unserviced request
        assert!(runner.join().unwrap());
        assert_eq!(queues.read.pending() + queues.write.pending(), 1);

        queues.clear_all();
        assert_eq!(state.memory.in_use(), 0);
    }

    #[test]
    fn test_timed_out_request_returns_to_worker() {
        let temp_dir = TempDir::new().unwrap();
        let data = Arc::new(DataFile::create(&temp_dir.path().join("to.dat"), 1 << 20).unwrap());
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);

        let io_worker = IoWorker::new(
            Arc::clone(&state),
            Arc::clone(&queues),
            data,
            Box::new(MockEngine::new(MockBehavior::NeverComplete)),
            IoSettings {
                timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(50),
            },
        )
        .unwrap();
        state.register(ThreadKind::Io);
        let io_thread = thread::spawn(move || io_worker.run(2));

        let mut worker = worker(&state, &queues);
        worker.step(Activity::Allocate);
        worker.step(Activity::IoRoundTrip);
        assert!(worker.block.is_some());

        state.set_end_all();
        io_thread.join().unwrap();

        let c = &state.counters;
        assert_eq!(c.read.timeouts.get() + c.write.timeouts.get(), 1);
        assert_eq!(c.read.completed_bytes.get() + c.write.completed_bytes.get(), 0);
    }

    #[test]
    fn test_run_stops_and_frees() {
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);
        let worker = worker(&state, &queues);

        state.register(ThreadKind::Worker);
        let runner = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let exit = worker.run();
                state.unregister(ThreadKind::Worker, exit == WorkerExit::Retired);
                exit
            })
        };
        thread::sleep(Duration::from_millis(100));
        state.set_end_all();

        assert_eq!(runner.join().unwrap(), WorkerExit::Stopped);
        assert_eq!(state.active_threads(), 0);
        assert_eq!(state.memory.in_use(), 0);
    }
}
