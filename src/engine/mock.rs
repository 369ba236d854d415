//! Mock I/O engine for testing
//!
//! Never touches the file. Each operation finishes according to the configured
//! [`MockBehavior`], which lets tests drive the timeout, cancellation, short
//! transfer and failure paths of the I/O worker deterministically.
//!
//! # Example
//!
//! ```
//! use threadstress::engine::{IOEngine, EngineConfig, IOOperation, OperationType};
//! use threadstress::engine::mock::{MockBehavior, MockEngine};
//! use std::time::Duration;
//!
//! let mut engine = MockEngine::new(MockBehavior::Short(100));
//! engine.init(&EngineConfig::default()).unwrap();
//! engine.submit(IOOperation {
//!     op_type: OperationType::Write,
//!     target_fd: -1,
//!     offset: 0,
//!     buffer: std::ptr::null_mut(),
//!     length: 4096,
//!     user_data: 7,
//! }).unwrap();
//!
//! let done = engine.wait(Duration::from_millis(1)).unwrap().unwrap();
//! assert_eq!(*done.result.as_ref().unwrap(), 100);
//! ```

use super::{
    CancelOutcome, EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation,
    OperationType,
};
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How every submitted operation ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Transfer the full length
    Complete,
    /// Transfer at most this many bytes
    Short(usize),
    /// Fail with an error
    Fail,
    /// Never finish; cancellation succeeds
    NeverComplete,
}

/// Counters shared between a mock engine and the test that created it
#[derive(Debug, Default)]
pub struct MockStats {
    pub submitted: AtomicU64,
    pub canceled: AtomicU64,
    pub cleanups: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    op_type: OperationType,
    length: usize,
    user_data: u64,
}

/// Scripted engine
pub struct MockEngine {
    behavior: MockBehavior,
    outstanding: Option<Outstanding>,
    stats: Arc<MockStats>,
}

impl MockEngine {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            outstanding: None,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Handle for observing the engine after it moved into a thread
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    fn finish(&self, op: Outstanding) -> IOCompletion {
        let result = match self.behavior {
            MockBehavior::Complete => Ok(op.length),
            MockBehavior::Short(limit) => Ok(op.length.min(limit)),
            MockBehavior::Fail | MockBehavior::NeverComplete => {
                Err(anyhow::anyhow!("mock {} failure", op.op_type))
            }
        };
        IOCompletion {
            user_data: op.user_data,
            result,
            op_type: op.op_type,
        }
    }
}

impl IOEngine for MockEngine {
    fn init(&mut self, _config: &EngineConfig) -> Result<()> {
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        if self.outstanding.is_some() {
            anyhow::bail!("mock engine already has an outstanding operation");
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.outstanding = Some(Outstanding {
            op_type: op.op_type,
            length: op.length,
            user_data: op.user_data,
        });
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<IOCompletion>> {
        match self.outstanding {
            None => Ok(None),
            Some(_) if self.behavior == MockBehavior::NeverComplete => {
                std::thread::sleep(timeout);
                Ok(None)
            }
            Some(op) => {
                self.outstanding = None;
                Ok(Some(self.finish(op)))
            }
        }
    }

    fn cancel(&mut self) -> Result<CancelOutcome> {
        let Some(op) = self.outstanding.take() else {
            return Ok(CancelOutcome::Idle);
        };
        if self.behavior == MockBehavior::NeverComplete {
            self.stats.canceled.fetch_add(1, Ordering::Relaxed);
            Ok(CancelOutcome::Canceled)
        } else {
            Ok(CancelOutcome::AlreadyDone(self.finish(op)))
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        self.outstanding = None;
        self.stats.cleanups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            async_io: true,
            cancelable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(length: usize) -> IOOperation {
        IOOperation {
            op_type: OperationType::Read,
            target_fd: -1,
            offset: 0,
            buffer: std::ptr::null_mut(),
            length,
            user_data: 3,
        }
    }

    #[test]
    fn test_mock_complete() {
        let mut engine = MockEngine::new(MockBehavior::Complete);
        engine.submit(op(512)).unwrap();
        let done = engine.wait(Duration::ZERO).unwrap().unwrap();
        assert_eq!(*done.result.as_ref().unwrap(), 512);
        assert_eq!(engine.stats().submitted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_mock_rejects_second_submission() {
        let mut engine = MockEngine::new(MockBehavior::Complete);
        engine.submit(op(1)).unwrap();
        assert!(engine.submit(op(1)).is_err());
    }

    #[test]
    fn test_mock_failure() {
        let mut engine = MockEngine::new(MockBehavior::Fail);
        engine.submit(op(64)).unwrap();
        let done = engine.wait(Duration::ZERO).unwrap().unwrap();
        assert!(done.result.is_err());
    }

    #[test]
    fn test_mock_never_completes_until_canceled() {
        let mut engine = MockEngine::new(MockBehavior::NeverComplete);
        let stats = engine.stats();
        engine.submit(op(64)).unwrap();

        assert!(engine.wait(Duration::from_millis(5)).unwrap().is_none());
        assert!(engine.wait(Duration::from_millis(5)).unwrap().is_none());
        assert!(matches!(engine.cancel().unwrap(), CancelOutcome::Canceled));
        assert!(matches!(engine.cancel().unwrap(), CancelOutcome::Idle));
        assert_eq!(stats.canceled.load(Ordering::Relaxed), 1);
    }
}
