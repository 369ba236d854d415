//! Error taxonomy
//!
//! Most setup and reporting code uses `anyhow` with context. The types here
//! cover the places where a caller has to branch on what went wrong:
//!
//! - **Resource exhaustion** ([`MemoryError`]): recovered locally by the worker
//! - **Queue rejection** ([`QueueError`]): the request is handed back
//! - **Escalations** ([`StressError`]): locking anomalies and setup failures

use crate::queue::{IoRequest, QueueKind};
use thiserror::Error;

/// Failure to obtain a block from the memory budget
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// Charging the request would push usage past the ceiling
    #[error("allocation of {requested} bytes exceeds budget ({in_use} of {ceiling} bytes in use)")]
    OutOfBudget {
        requested: usize,
        in_use: u64,
        ceiling: u64,
    },

    /// The system allocator returned null; the charge was rolled back
    #[error("system allocator failed to provide {requested} bytes")]
    AllocationFailed { requested: usize },
}

/// Rejected queue operation
///
/// The rejected request travels back inside the error so the submitter keeps
/// ownership of its buffer.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No-new-I/O has been signaled
    #[error("{0} queue no longer accepts requests")]
    Closed(QueueKind, Box<IoRequest>),

    /// The queue lock was poisoned; end-all-threads has been set
    #[error("{0} queue lock is poisoned")]
    Poisoned(QueueKind, Box<IoRequest>),
}

impl QueueError {
    /// Take back the request that could not be queued
    pub fn into_request(self) -> Box<IoRequest> {
        match self {
            QueueError::Closed(_, req) | QueueError::Poisoned(_, req) => req,
        }
    }
}

/// Failures that stop the whole run
#[derive(Debug, Error)]
pub enum StressError {
    /// A pool, queue or byte-range lock could not be acquired or released
    #[error("locking failure: {0}")]
    Locking(String),

    /// Synchronization objects or threads could not be created at startup
    #[error("setup failure: {0}")]
    Setup(String),
}
