//! threadstress - thread pool, memory and locked file I/O stress generator
//!
//! threadstress keeps a bounded, dynamically resized pool of threads busy with
//! a random mix of work: memory allocation and touching against a global
//! budget, signal mask reapplication with timed signal waits, and reads and
//! writes of a shared data file serviced by dedicated I/O threads under
//! byte-range locks. The run ends after a fixed duration or on request, shuts
//! down in a fixed order and always reports its counters.
//!
//! # Architecture
//!
//! - **Memory budget**: accounted allocator handing out owned blocks
//! - **Dispatch queues**: read, write and done queues linking workers to I/O threads
//! - **I/O engines**: Linux native AIO, sync, and a mock for tests
//! - **Coordinator**: slot tables, run clock and ordered shutdown
//! - **Stats**: cache-line aligned counters and an I/O latency histogram

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod memory;
pub mod output;
pub mod queue;
pub mod state;
pub mod stats;
pub mod target;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::Coordinator;
pub use engine::IOEngine;
pub use state::SystemState;

/// Result type used throughout threadstress
pub type Result<T> = anyhow::Result<T>;
