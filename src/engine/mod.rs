//! I/O engine abstraction
//!
//! An engine moves bytes between a request buffer and the shared data file.
//! Each I/O thread owns one engine and keeps at most one operation in flight,
//! so the interface is built around a single outstanding operation:
//!
//! 1. `submit()` hands the operation to the kernel (or performs it)
//! 2. `wait()` polls for the completion for at most one poll interval
//! 3. `cancel()` asks the kernel to give up on an operation that timed out
//!
//! # Engine Types
//!
//! - **libaio**: Linux native asynchronous I/O through raw syscalls
//! - **sync**: blocking `pread`/`pwrite`, completed at submit time
//! - **mock**: scripted outcomes for tests

pub mod libaio;
pub mod mock;
pub mod sync;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Engine backend selected in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    #[default]
    Libaio,
    Sync,
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineType::Libaio => write!(f, "libaio"),
            EngineType::Sync => write!(f, "sync"),
        }
    }
}

/// Build and initialize an engine of the given type
pub fn create_engine(engine_type: EngineType, config: &EngineConfig) -> Result<Box<dyn IOEngine>> {
    let mut engine: Box<dyn IOEngine> = match engine_type {
        EngineType::Libaio => Box::new(libaio::LibaioEngine::new()),
        EngineType::Sync => Box::new(sync::SyncEngine::new()),
    };
    engine.init(config)?;
    Ok(engine)
}

/// Single-operation I/O engine
///
/// Engines must be `Send` so they can move into the I/O thread that owns them.
pub trait IOEngine: Send {
    /// Set up kernel resources; called once before any submission
    fn init(&mut self, config: &EngineConfig) -> Result<()>;

    /// Start one operation
    ///
    /// Fails if another operation is still outstanding.
    fn submit(&mut self, op: IOOperation) -> Result<()>;

    /// Wait up to `timeout` for the outstanding operation
    ///
    /// Returns `Ok(None)` when nothing completed in time.
    fn wait(&mut self, timeout: Duration) -> Result<Option<IOCompletion>>;

    /// Ask the kernel to abandon the outstanding operation
    fn cancel(&mut self) -> Result<CancelOutcome>;

    /// Release kernel resources
    fn cleanup(&mut self) -> Result<()>;

    fn capabilities(&self) -> EngineCapabilities;
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Kernel completion queue size; one is enough for a single operation
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { queue_depth: 1 }
    }
}

/// One read or write against the data file
///
/// # Safety
///
/// `buffer` must stay valid for `length` bytes until the operation has
/// completed or been cancelled.
#[derive(Debug)]
pub struct IOOperation {
    pub op_type: OperationType,
    pub target_fd: RawFd,
    pub offset: u64,
    pub buffer: *mut u8,
    pub length: usize,
    /// Returned unchanged in the completion
    pub user_data: u64,
}

// SAFETY: the buffer is owned by the request being serviced, which the I/O
// thread holds exclusively while the operation is in flight.
unsafe impl Send for IOOperation {}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Read,
    Write,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Read => write!(f, "read"),
            OperationType::Write => write!(f, "write"),
        }
    }
}

/// Finished operation
#[derive(Debug)]
pub struct IOCompletion {
    pub user_data: u64,
    /// Bytes transferred, possibly fewer than requested
    pub result: Result<usize>,
    pub op_type: OperationType,
}

/// Answer to a cancellation request
#[derive(Debug)]
pub enum CancelOutcome {
    /// The operation was abandoned; the buffer is free again
    Canceled,
    /// The operation finished before it could be cancelled
    AlreadyDone(IOCompletion),
    /// The kernel could not cancel; the operation is still running
    InProgress,
    /// Nothing was outstanding
    Idle,
}

/// Engine features reported for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCapabilities {
    pub async_io: bool,
    pub cancelable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sync_engine() {
        let engine = create_engine(EngineType::Sync, &EngineConfig::default()).unwrap();
        assert!(!engine.capabilities().async_io);
    }

    #[test]
    fn test_engine_type_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            engine: EngineType,
        }
        let w: Wrapper = ::toml::from_str("engine = \"sync\"").unwrap();
        assert_eq!(w.engine, EngineType::Sync);
        assert_eq!(EngineType::default().to_string(), "libaio");
    }
}
