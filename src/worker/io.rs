//! I/O thread
//!
//! Each I/O thread owns a private handle on the data file and one engine. It
//! alternates at random between the read and write queues, services whatever
//! it finds, and always publishes the request to the done queue afterwards,
//! whether the transfer worked or not.
//!
//! Servicing a request:
//!
//! 1. Pick a random offset so that `[offset, offset + len)` fits in the file
//! 2. Take a byte-range lock: shared for reads, exclusive for writes
//! 3. Submit the transfer and poll for it once per poll interval
//! 4. Past the timeout, cancel; a refused cancel keeps polling until the
//!    kernel hands the buffer back
//! 5. Release the lock
//!
//! Lock failures escalate to a whole-run stop. Transfer failures only bump
//! counters.

use crate::engine::{CancelOutcome, IOEngine, IOOperation, OperationType};
use crate::queue::{IoQueues, IoRequest};
use crate::state::SystemState;
use crate::stats::histogram::LatencyHistogram;
use crate::target::{DataFile, LockKind};
use crate::Result;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Timing knobs of an I/O thread
#[derive(Debug, Clone, Copy)]
pub struct IoSettings {
    /// Longest a transfer may run before it is cancelled
    pub timeout: Duration,
    /// Completion poll period and idle sleep
    pub poll_interval: Duration,
}

/// How one transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete(usize),
    Short { done: usize, shortfall: usize },
    TimedOut,
    Failed,
}

impl TransferOutcome {
    fn classify(result: &Result<usize>, len: usize) -> Self {
        match result {
            Ok(n) if *n >= len => TransferOutcome::Complete(len),
            Ok(n) => TransferOutcome::Short {
                done: *n,
                shortfall: len - n,
            },
            Err(e) => {
                trace!(error = %e, "transfer failed");
                TransferOutcome::Failed
            }
        }
    }

    /// Bytes that reached their destination
    pub fn transferred(&self) -> usize {
        match self {
            TransferOutcome::Complete(n) => *n,
            TransferOutcome::Short { done, .. } => *done,
            TransferOutcome::TimedOut | TransferOutcome::Failed => 0,
        }
    }
}

/// Submit `op` and see it through to completion, timeout or cancellation
///
/// Returns only once the engine no longer references the buffer.
pub fn run_timed(
    engine: &mut dyn IOEngine,
    op: IOOperation,
    timeout: Duration,
    poll_interval: Duration,
) -> TransferOutcome {
    let len = op.length;
    let started = Instant::now();

    if let Err(e) = engine.submit(op) {
        debug!(error = %e, "submit failed");
        return TransferOutcome::Failed;
    }

    loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        match engine.wait(poll_interval.min(remaining)) {
            Ok(Some(done)) => return TransferOutcome::classify(&done.result, len),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "completion poll failed, cancelling");
                break;
            }
        }
    }

    loop {
        match engine.cancel() {
            Ok(CancelOutcome::Canceled) => return TransferOutcome::TimedOut,
            Ok(CancelOutcome::AlreadyDone(done)) => {
                return TransferOutcome::classify(&done.result, len)
            }
            Ok(CancelOutcome::Idle) => return TransferOutcome::Failed,
            Ok(CancelOutcome::InProgress) => {
                debug!(elapsed = ?started.elapsed(), "timed-out transfer could not be cancelled yet");
                match engine.wait(poll_interval) {
                    Ok(Some(done)) if was_cancelled(&done.result) => return TransferOutcome::TimedOut,
                    Ok(Some(done)) => return TransferOutcome::classify(&done.result, len),
                    Ok(None) => {}
                    Err(e) => return abandon(engine, e),
                }
            }
            Err(e) => return abandon(engine, e),
        }
    }
}

/// A queued cancellation that landed after `cancel()` returned
fn was_cancelled(result: &Result<usize>) -> bool {
    match result {
        Ok(_) => false,
        Err(e) => e
            .root_cause()
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::raw_os_error)
            == Some(libc::ECANCELED),
    }
}

/// Tear the engine down so the kernel lets go of the buffer
///
/// Later submissions on this engine fail and count as failed transfers.
fn abandon(engine: &mut dyn IOEngine, error: anyhow::Error) -> TransferOutcome {
    warn!(error = %error, "engine lost track of a transfer, shutting it down");
    if let Err(e) = engine.cleanup() {
        warn!(error = %e, "engine cleanup failed");
    }
    TransferOutcome::Failed
}

/// One I/O thread
pub struct IoWorker {
    id: u32,
    state: Arc<SystemState>,
    queues: Arc<IoQueues>,
    data: Arc<DataFile>,
    handle: File,
    engine: Box<dyn IOEngine>,
    settings: IoSettings,
    rng: Xoshiro256PlusPlus,
    latency: LatencyHistogram,
}

impl IoWorker {
    /// Open a private data file handle; the engine must already be initialized
    pub fn new(
        state: Arc<SystemState>,
        queues: Arc<IoQueues>,
        data: Arc<DataFile>,
        engine: Box<dyn IOEngine>,
        settings: IoSettings,
    ) -> Result<Self> {
        let handle = data.open_handle()?;
        Ok(Self {
            id: 0,
            state,
            queues,
            data,
            handle,
            engine,
            settings,
            rng: Xoshiro256PlusPlus::from_entropy(),
            latency: LatencyHistogram::new(),
        })
    }

    /// Service requests as thread `id` until end-all-threads is set
    pub fn run(mut self, id: u32) {
        self.id = id;
        debug!(thread = self.id, async_io = self.engine.capabilities().async_io, "I/O thread started");
        let queues = Arc::clone(&self.queues);

        while !self.state.end_all() {
            let queue = if self.rng.gen_bool(0.5) {
                &queues.read
            } else {
                &queues.write
            };

            let Some(mut req) = queue.dequeue() else {
                thread::sleep(self.settings.poll_interval);
                continue;
            };

            self.state.counters.io_tried.incr();
            req.attach_fd(self.handle.as_raw_fd());
            self.service(&mut req);
            req.detach_fd();

            if let Err(e) = queues.done.publish(req) {
                self.state
                    .escalate(format!("I/O thread {} could not publish a request: {}", self.id, e));
            }
        }

        if let Err(e) = self.engine.cleanup() {
            warn!(thread = self.id, error = %e, "engine cleanup failed");
        }
        self.state.merge_io_latency(&self.latency);
        debug!(thread = self.id, "I/O thread ending");
    }

    /// Perform the locked transfer for one request
    fn service(&mut self, req: &mut IoRequest) {
        let op = req.op();
        let len = req.len();
        let counters = self.state.counters.direction(op);
        let size = self.data.size();
        req.set_done(0);

        if len as u64 >= size {
            counters.failed.incr();
            self.state.counters.io_finished.incr();
            return;
        }
        let offset = self.rng.gen_range(0..=size - len as u64 - 1);

        let kind = match op {
            OperationType::Read => LockKind::Shared,
            OperationType::Write => LockKind::Exclusive,
        };
        let lock = match self.data.lock_range(&self.handle, kind, offset, len as u64) {
            Ok(lock) => lock,
            Err(e) => {
                counters.failed.incr();
                self.state
                    .escalate(format!("I/O thread {} failed to lock data file: {:#}", self.id, e));
                return;
            }
        };

        counters.attempted_bytes.add(len as u64);
        let io = IOOperation {
            op_type: op,
            target_fd: req.fd().unwrap_or_else(|| self.handle.as_raw_fd()),
            offset,
            buffer: req.buffer_ptr(),
            length: len,
            user_data: req.id(),
        };

        let started = Instant::now();
        let outcome = run_timed(
            self.engine.as_mut(),
            io,
            self.settings.timeout,
            self.settings.poll_interval,
        );

        match outcome {
            TransferOutcome::Complete(_) => self.latency.record(started.elapsed()),
            TransferOutcome::Short { shortfall, .. } => {
                counters.incomplete.incr();
                counters.shortfall_bytes.add(shortfall as u64);
                self.latency.record(started.elapsed());
            }
            TransferOutcome::TimedOut => counters.timeouts.incr(),
            TransferOutcome::Failed => counters.failed.incr(),
        }
        req.set_done(outcome.transferred());
        trace!(thread = self.id, request = req.id(), %op, offset, len, ?outcome, "serviced");

        if let Err(e) = lock.release() {
            self.state
                .escalate(format!("I/O thread {} failed to unlock data file: {:#}", self.id, e));
        }
        self.state.counters.io_finished.incr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBehavior, MockEngine};
    use crate::engine::sync::SyncEngine;
    use crate::engine::{EngineConfig, IOEngine};
    use crate::queue::Completion;
    use anyhow::Context;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    const FAST: IoSettings = IoSettings {
        timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
    };

    fn op(length: usize) -> IOOperation {
        IOOperation {
            op_type: OperationType::Write,
            target_fd: -1,
            offset: 0,
            buffer: std::ptr::null_mut(),
            length,
            user_data: 1,
        }
    }

    /// Engine whose first cancel is refused and whose operation then finishes
    ///
    /// With `cancelled` set the operation ends as a cancellation the kernel
    /// had queued instead.
    struct StubbornEngine {
        outstanding: bool,
        cancel_calls: u32,
        cancelled: bool,
    }

    impl IOEngine for StubbornEngine {
        fn init(&mut self, _config: &EngineConfig) -> Result<()> {
            Ok(())
        }
        fn submit(&mut self, _op: IOOperation) -> Result<()> {
            self.outstanding = true;
            Ok(())
        }
        fn wait(&mut self, timeout: Duration) -> Result<Option<crate::engine::IOCompletion>> {
            if self.outstanding && self.cancel_calls > 0 {
                self.outstanding = false;
                let result = if self.cancelled {
                    Err(std::io::Error::from_raw_os_error(libc::ECANCELED))
                        .context("write operation failed")
                } else {
                    Ok(64)
                };
                return Ok(Some(crate::engine::IOCompletion {
                    user_data: 1,
                    result,
                    op_type: OperationType::Write,
                }));
            }
            thread::sleep(timeout);
            Ok(None)
        }
        fn cancel(&mut self) -> Result<CancelOutcome> {
            self.cancel_calls += 1;
            Ok(CancelOutcome::InProgress)
        }
        fn cleanup(&mut self) -> Result<()> {
            Ok(())
        }
        fn capabilities(&self) -> crate::engine::EngineCapabilities {
            crate::engine::EngineCapabilities {
                async_io: true,
                cancelable: false,
            }
        }
    }

    #[test]
    fn test_run_timed_outcomes() {
        let mut engine = MockEngine::new(MockBehavior::Complete);
        assert_eq!(
            run_timed(&mut engine, op(512), FAST.timeout, FAST.poll_interval),
            TransferOutcome::Complete(512)
        );

        let mut engine = MockEngine::new(MockBehavior::Short(100));
        assert_eq!(
            run_timed(&mut engine, op(512), FAST.timeout, FAST.poll_interval),
            TransferOutcome::Short {
                done: 100,
                shortfall: 412
            }
        );

        let mut engine = MockEngine::new(MockBehavior::Fail);
        assert_eq!(
            run_timed(&mut engine, op(512), FAST.timeout, FAST.poll_interval),
            TransferOutcome::Failed
        );
    }

    #[test]
    fn test_run_timed_cancels_after_timeout() {
        let mut engine = MockEngine::new(MockBehavior::NeverComplete);
        let stats = engine.stats();

        let started = Instant::now();
        let outcome = run_timed(&mut engine, op(512), FAST.timeout, FAST.poll_interval);
        assert_eq!(outcome, TransferOutcome::TimedOut);
        assert!(started.elapsed() >= FAST.timeout);
        assert_eq!(stats.canceled.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_refused_cancel_waits_for_real_result() {
        let mut engine = StubbornEngine {
            outstanding: false,
            cancel_calls: 0,
            cancelled: false,
        };
        let outcome = run_timed(&mut engine, op(512), FAST.timeout, FAST.poll_interval);
        // Not a timeout: the transfer finished, just short
        assert_eq!(
            outcome,
            TransferOutcome::Short {
                done: 64,
                shortfall: 448
            }
        );
        assert_eq!(engine.cancel_calls, 1);
    }

    #[test]
    fn test_late_cancellation_counts_as_timeout() {
        let mut engine = StubbornEngine {
            outstanding: false,
            cancel_calls: 0,
            cancelled: true,
        };
        let outcome = run_timed(&mut engine, op(512), FAST.timeout, FAST.poll_interval);
        assert_eq!(outcome, TransferOutcome::TimedOut);
        assert_eq!(engine.cancel_calls, 1);

        // Other errors after a refused cancel are still failures
        let failed: Result<usize> = Err(anyhow::anyhow!("device gone"));
        assert!(!was_cancelled(&failed));
    }

    fn setup(engine: Box<dyn IOEngine>) -> (TempDir, Arc<SystemState>, Arc<IoQueues>, IoWorker) {
        let temp_dir = TempDir::new().unwrap();
        let data = Arc::new(DataFile::create(&temp_dir.path().join("io.dat"), 1 << 20).unwrap());
        let state = SystemState::new(0);
        let queues = IoQueues::new(&state);
        let worker = IoWorker::new(
            Arc::clone(&state),
            Arc::clone(&queues),
            data,
            engine,
            FAST,
        )
        .unwrap();
        (temp_dir, state, queues, worker)
    }

    #[test]
    fn test_service_counts_bytes() {
        let mut engine = SyncEngine::new();
        engine.init(&EngineConfig::default()).unwrap();
        let (_dir, state, _queues, mut worker) = setup(Box::new(engine));

        let block = state.memory.alloc(8192).unwrap();
        let mut req = IoRequest::new(7, OperationType::Write, block, 8192, None);
        worker.service(&mut req);

        assert_eq!(req.done(), 8192);
        assert_eq!(state.counters.write.attempted_bytes.get(), 8192);
        assert_eq!(state.counters.write.failed.get(), 0);
        assert_eq!(state.counters.io_finished.get(), 1);
        assert!(!state.end_all());
        assert_eq!(worker.latency.len(), 1);
    }

    #[test]
    fn test_thread_publishes_and_wakes_submitter() {
        let (_dir, state, queues, worker) = setup(Box::new(MockEngine::new(MockBehavior::Fail)));
        let completion = Completion::new();

        let block = state.memory.alloc(4096).unwrap();
        let req = IoRequest::new(9, OperationType::Read, block, 4096, Some(completion.handle()));
        queues.read.enqueue(req).unwrap();

        let runner = thread::spawn(move || worker.run(1));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !completion.try_wait() {
            assert!(Instant::now() < deadline, "request never came back");
            thread::sleep(Duration::from_millis(5));
        }
        state.set_end_all();
        runner.join().unwrap();

        // Failed transfers still come back, with nothing done
        let back = queues.done.remove(9).unwrap();
        assert_eq!(back.done(), 0);
        assert_eq!(back.fd(), None);
        assert_eq!(state.counters.read.failed.get(), 1);
        assert_eq!(state.counters.io_tried.get(), 1);
    }

    #[test]
    fn test_never_completing_transfer_counts_one_timeout() {
        let engine = MockEngine::new(MockBehavior::NeverComplete);
        let mock_stats = engine.stats();
        let (_dir, state, _queues, mut worker) = setup(Box::new(engine));

        let block = state.memory.alloc(4096).unwrap();
        let mut req = IoRequest::new(3, OperationType::Read, block, 4096, None);
        worker.service(&mut req);

        assert_eq!(state.counters.read.timeouts.get(), 1);
        assert_eq!(state.counters.read.failed.get(), 0);
        assert_eq!(state.counters.read.completed_bytes.get(), 0);
        assert_eq!(req.done(), 0);
        assert_eq!(mock_stats.canceled.load(Ordering::Relaxed), 1);
    }
}
