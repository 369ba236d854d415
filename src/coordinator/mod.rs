//! Pool and lifecycle controller
//!
//! The coordinator owns two slot tables, one for workers (sized to
//! `max_threads - io_threads`) and one for I/O threads. It starts the I/O
//! threads and the initial workers, then runs the clock. In short-lived mode
//! each tick may spawn a replacement worker into any free slot while the pool
//! is below its maximum.
//!
//! # Shutdown order
//!
//! 1. Set no-new-I/O and let queued requests drain while workers are alive.
//!    Drop out early if requests are queued but no I/O thread remains.
//! 2. Set end-all-threads and wait for the live thread count to reach zero
//! 3. Join every thread and free the slot tables
//! 4. Clear the queues, recording what was left on each
//! 5. Close and remove the data file

use crate::config::Config;
use crate::engine::{create_engine, EngineConfig, IOEngine};
use crate::error::StressError;
use crate::queue::IoQueues;
use crate::state::{SystemState, ThreadKind};
use crate::target::DataFile;
use crate::worker::io::{IoSettings, IoWorker};
use crate::worker::probe::{create_probe, Probe, ProbeKind};
use crate::worker::{Worker, WorkerExit, WorkerSettings};
use crate::Result;
use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Odds (1 in N) that a tick skips spawning a replacement worker
pub const SPAWN_SKIP_ODDS: u32 = 800;

/// Builds one initialized engine per I/O thread
pub type EngineFactory = Arc<dyn Fn() -> Result<Box<dyn IOEngine>> + Send + Sync>;

/// Block the probe's signal set in the calling thread
///
/// Must run before any other thread exists. Threads inherit the mask at
/// spawn, and a process-directed SIGUSR1 that lands on a thread not blocking
/// it kills the process instead of reaching a probe wait.
pub fn block_stop_signals(kind: ProbeKind) -> Result<()> {
    let probe = create_probe(kind);
    probe
        .apply()
        .with_context(|| format!("Failed to block stop signals with {}", probe.name()))
}

/// Route Ctrl-C and SIGTERM into the same stop request a probe raises
///
/// The handler runs on a thread of its own; call [`block_stop_signals`] first.
pub fn install_stop_handler(state: &Arc<SystemState>) -> Result<()> {
    let state = Arc::clone(state);
    ctrlc::set_handler(move || {
        info!("stop requested");
        state.request_stop();
    })
    .context("Failed to install stop handler")
}

#[derive(Debug, Default)]
struct ThreadSlot {
    /// Thread id, 0 while the slot is free
    id: u32,
    handle: Option<JoinHandle<()>>,
}

/// Fixed-size table of thread slots guarded by one pool lock
#[derive(Debug)]
pub struct SlotTable {
    kind: ThreadKind,
    first_id: u32,
    slots: Mutex<Vec<ThreadSlot>>,
}

impl SlotTable {
    /// Table with `capacity` slots handing out ids from `first_id` on
    pub fn new(kind: ThreadKind, capacity: usize, first_id: u32) -> Arc<Self> {
        let slots = (0..capacity).map(|_| ThreadSlot::default()).collect();
        Arc::new(Self {
            kind,
            first_id,
            slots: Mutex::new(slots),
        })
    }

    /// Start a thread in a free slot
    ///
    /// Returns `Ok(None)` when the pool is at `max_threads` or no slot is free.
    /// The thread is registered with `state` before it starts and unregistered
    /// when `body` returns or unwinds.
    pub fn try_spawn<F>(
        self: &Arc<Self>,
        state: &Arc<SystemState>,
        max_threads: usize,
        body: F,
    ) -> std::result::Result<Option<u32>, StressError>
    where
        F: FnOnce(u32) -> WorkerExit + Send + 'static,
    {
        let mut slots = self.slots.lock().map_err(|_| {
            state.escalate(format!("{} pool lock poisoned", self.kind));
            StressError::Locking(format!("{} pool lock poisoned", self.kind))
        })?;

        if state.active_threads() >= max_threads {
            return Ok(None);
        }
        let Some(index) = slots.iter().position(|slot| slot.id == 0) else {
            return Ok(None);
        };

        // The previous occupant already released the slot; reap it
        if let Some(previous) = slots[index].handle.take() {
            if previous.join().is_err() {
                warn!(kind = %self.kind, slot = index, "previous thread panicked");
            }
        }

        let id = self.first_id + index as u32;
        state.register(self.kind);

        let table = Arc::clone(self);
        let thread_state = Arc::clone(state);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.kind, id))
            .spawn(move || {
                let mut lease = SlotLease {
                    table,
                    state: thread_state,
                    index,
                    retired: false,
                };
                lease.retired = body(id) == WorkerExit::Retired;
            });

        match spawned {
            Ok(handle) => {
                slots[index] = ThreadSlot {
                    id,
                    handle: Some(handle),
                };
                Ok(Some(id))
            }
            Err(e) => {
                state.unregister(self.kind, false);
                state.counters.spawn_failures.incr();
                Err(StressError::Setup(format!(
                    "failed to spawn {} thread {}: {}",
                    self.kind, id, e
                )))
            }
        }
    }

    /// Slots currently held by a live thread
    pub fn occupied(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.iter().filter(|slot| slot.id != 0).count(),
            Err(poisoned) => poisoned.into_inner().iter().filter(|slot| slot.id != 0).count(),
        }
    }

    /// Join every thread ever started in this table
    fn join_all(&self) {
        let handles: Vec<_> = match self.slots.lock() {
            Ok(mut slots) => slots.iter_mut().filter_map(|slot| slot.handle.take()).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter_mut()
                .filter_map(|slot| slot.handle.take())
                .collect(),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!(kind = %self.kind, "thread panicked");
            }
        }
    }

    /// Drop the slots
    fn clear(&self) {
        match self.slots.lock() {
            Ok(mut slots) => slots.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

/// A running thread's claim on its slot
///
/// Frees the slot and unregisters the thread when dropped, including when the
/// thread body panics.
struct SlotLease {
    table: Arc<SlotTable>,
    state: Arc<SystemState>,
    index: usize,
    retired: bool,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        match self.table.slots.lock() {
            Ok(mut slots) => {
                if let Some(slot) = slots.get_mut(self.index) {
                    slot.id = 0;
                }
            }
            Err(_) => self
                .state
                .escalate(format!("{} pool lock poisoned", self.table.kind)),
        }
        self.state.unregister(self.table.kind, self.retired);
    }
}

/// Drives one run from pool start to teardown
pub struct Coordinator {
    config: Config,
    state: Arc<SystemState>,
    queues: Arc<IoQueues>,
    data_file: Option<Arc<DataFile>>,
    engine_factory: EngineFactory,
    probe: Arc<dyn Probe>,
    workers: Arc<SlotTable>,
    io_threads: Arc<SlotTable>,
    rng: Xoshiro256PlusPlus,
}

impl Coordinator {
    /// Build a coordinator; `data_file` is required when I/O threads are configured
    pub fn new(config: Config, state: Arc<SystemState>, data_file: Option<Arc<DataFile>>) -> Self {
        let engine_type = config.io.engine;
        let engine_factory: EngineFactory =
            Arc::new(move || create_engine(engine_type, &EngineConfig::default()));
        let probe: Arc<dyn Probe> = Arc::from(create_probe(config.runtime.probe));

        let workers = SlotTable::new(ThreadKind::Worker, config.worker_slots(), 1);
        let io_threads = SlotTable::new(
            ThreadKind::Io,
            config.pool.io_threads,
            config.worker_slots() as u32 + 1,
        );

        Self {
            queues: IoQueues::new(&state),
            config,
            state,
            data_file,
            engine_factory,
            probe,
            workers,
            io_threads,
            rng: Xoshiro256PlusPlus::from_entropy(),
        }
    }

    /// Replace the engine construction, e.g. with a mock
    pub fn with_engine_factory(mut self, factory: EngineFactory) -> Self {
        self.engine_factory = factory;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn queues(&self) -> &Arc<IoQueues> {
        &self.queues
    }

    /// Run the pool for the configured duration and tear it down
    ///
    /// Teardown happens on every path. An error means the pool could not be
    /// started.
    pub fn run(&mut self) -> Result<Duration> {
        let started = Instant::now();

        // Threads spawned from here on inherit the mask
        if let Err(e) = self.probe.apply() {
            warn!(probe = self.probe.name(), error = %e, "initial probe application failed");
        }

        let result = self.start_pool();
        match &result {
            Ok(()) => self.run_clock(started),
            Err(e) => warn!(error = %e, "pool setup failed, shutting down"),
        }
        self.shutdown();

        result.map(|()| started.elapsed())
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_io_size: self.config.memory.max_io_size as usize,
            poll_interval: self.config.poll_interval(),
            probe_short_wait: self.config.probe_short_wait(),
            probe_long_wait: self.config.probe_long_wait(),
            short_lived: self.config.pool.short_lived,
        }
    }

    fn start_pool(&mut self) -> Result<()> {
        for _ in 0..self.config.pool.io_threads {
            self.spawn_io_thread()?;
        }
        info!(io_threads = self.state.active_io_threads(), "I/O threads started");

        for _ in 0..self.config.initial_workers() {
            if self.spawn_worker()?.is_none() {
                return Err(StressError::Setup("no free worker slot at startup".into()).into());
            }
        }
        info!(
            threads = self.state.active_threads(),
            workers = self.state.active_workers(),
            "worker threads started"
        );
        Ok(())
    }

    fn spawn_io_thread(&mut self) -> Result<()> {
        let data = self
            .data_file
            .clone()
            .ok_or_else(|| StressError::Setup("I/O threads configured without a data file".into()))?;
        let engine = (self.engine_factory)()
            .map_err(|e| StressError::Setup(format!("failed to create I/O engine: {:#}", e)))?;
        let io_worker = IoWorker::new(
            Arc::clone(&self.state),
            Arc::clone(&self.queues),
            data,
            engine,
            IoSettings {
                timeout: self.config.io_timeout(),
                poll_interval: self.config.poll_interval(),
            },
        )
        .map_err(|e| StressError::Setup(format!("{:#}", e)))?;

        let spawned = self.io_threads.try_spawn(
            &self.state,
            self.config.pool.max_threads,
            move |id| {
                io_worker.run(id);
                WorkerExit::Stopped
            },
        )?;
        if spawned.is_none() {
            return Err(StressError::Setup("no free I/O thread slot at startup".into()).into());
        }
        Ok(())
    }

    fn spawn_worker(&mut self) -> std::result::Result<Option<u32>, StressError> {
        let state = Arc::clone(&self.state);
        let queues = Arc::clone(&self.queues);
        let probe = Arc::clone(&self.probe);
        let settings = self.worker_settings();

        self.workers
            .try_spawn(&self.state, self.config.pool.max_threads, move |id| {
                Worker::new(id, state, queues, probe, settings).run()
            })
    }

    fn run_clock(&mut self, started: Instant) {
        let duration = self.config.duration();
        let poll = self.config.poll_interval();
        info!(duration = ?duration, "run started");

        loop {
            if self.state.end_all() {
                warn!("stopping after unrecoverable failure");
                break;
            }
            if self.state.stop_requests() > 0 {
                info!("stopped by signal");
                break;
            }
            let elapsed = started.elapsed();
            if elapsed >= duration {
                break;
            }

            if self.config.pool.short_lived
                && self.state.active_threads() < self.config.pool.max_threads
                && !self.rng.gen_ratio(1, SPAWN_SKIP_ODDS)
            {
                match self.spawn_worker() {
                    Ok(Some(id)) => debug!(thread = id, "replacement worker started"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "could not start replacement worker"),
                }
            }
            self.state.update_peak();
            debug!(
                elapsed = ?elapsed,
                threads = self.state.active_threads(),
                memory = self.state.memory.in_use(),
                "tick"
            );

            thread::sleep(poll.min(duration - elapsed));
        }
    }

    fn shutdown(&mut self) {
        let poll = self.config.poll_interval();

        // 1. Drain
        self.state.close_io();
        while self.state.active_workers() > 0 && self.queues.any_pending() {
            if self.state.active_io_threads() == 0 && self.queues.requests_pending() {
                warn!("requests queued but no I/O thread left, abandoning drain");
                break;
            }
            if self.state.end_all() {
                break;
            }
            thread::sleep(poll);
        }

        // 2. Stop every thread
        self.state.set_end_all();
        while self.state.active_threads() > 0 {
            thread::sleep(poll.min(Duration::from_millis(10)));
        }

        // 3. Reap and free the slot tables
        self.workers.join_all();
        self.io_threads.join_all();
        self.workers.clear();
        self.io_threads.clear();

        // 4. Leftover requests
        let leftovers = self.queues.clear_all();
        let counters = &self.state.counters;
        counters.leftover_read.add(leftovers.read as u64);
        counters.leftover_write.add(leftovers.write as u64);
        counters.leftover_done.add(leftovers.done as u64);
        if leftovers.read + leftovers.write + leftovers.done > 0 {
            debug!(?leftovers, "cleared leftover requests");
        }

        // 5. Data file
        if let Some(data) = &self.data_file {
            if let Err(e) = data.cleanup() {
                warn!(error = %e, "data file cleanup failed");
            }
        }
        info!("shutdown complete");
    }
}
