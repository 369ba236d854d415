//! Synchronous I/O engine
//!
//! Performs the transfer with blocking `pread`/`pwrite` inside `submit()` and
//! parks the result until `wait()` collects it. Works on any filesystem and
//! needs no kernel AIO support, so it doubles as the portable fallback.
//!
//! Partial transfers are retried until the full length moved, the file ended
//! (reads), or the syscall failed.

use super::{CancelOutcome, EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation};
use crate::Result;
use anyhow::Context;
use std::time::Duration;

/// Blocking pread/pwrite engine
pub struct SyncEngine {
    completion: Option<IOCompletion>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self { completion: None }
    }

    fn do_read(fd: i32, buffer: *mut u8, length: usize, offset: u64) -> Result<usize> {
        let mut total = 0;

        while total < length {
            // SAFETY: the caller guarantees buffer is valid for length bytes
            let result = unsafe {
                libc::pread(
                    fd,
                    buffer.add(total) as *mut libc::c_void,
                    length - total,
                    (offset + total as u64) as libc::off_t,
                )
            };

            if result < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context(format!(
                    "pread failed: fd={}, offset={}, length={}",
                    fd,
                    offset + total as u64,
                    length - total
                ));
            }
            if result == 0 {
                // End of file: report what was read
                break;
            }
            total += result as usize;
        }

        Ok(total)
    }

    fn do_write(fd: i32, buffer: *const u8, length: usize, offset: u64) -> Result<usize> {
        let mut total = 0;

        while total < length {
            // SAFETY: the caller guarantees buffer is valid for length bytes
            let result = unsafe {
                libc::pwrite(
                    fd,
                    buffer.add(total) as *const libc::c_void,
                    length - total,
                    (offset + total as u64) as libc::off_t,
                )
            };

            if result < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context(format!(
                    "pwrite failed: fd={}, offset={}, length={}",
                    fd,
                    offset + total as u64,
                    length - total
                ));
            }
            if result == 0 {
                break;
            }
            total += result as usize;
        }

        Ok(total)
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for SyncEngine {
    fn init(&mut self, _config: &EngineConfig) -> Result<()> {
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        if self.completion.is_some() {
            anyhow::bail!("sync engine already holds an uncollected completion");
        }

        let result = match op.op_type {
            super::OperationType::Read => Self::do_read(op.target_fd, op.buffer, op.length, op.offset),
            super::OperationType::Write => {
                Self::do_write(op.target_fd, op.buffer, op.length, op.offset)
            }
        };

        self.completion = Some(IOCompletion {
            user_data: op.user_data,
            result,
            op_type: op.op_type,
        });
        Ok(())
    }

    fn wait(&mut self, _timeout: Duration) -> Result<Option<IOCompletion>> {
        Ok(self.completion.take())
    }

    fn cancel(&mut self) -> Result<CancelOutcome> {
        Ok(match self.completion.take() {
            Some(done) => CancelOutcome::AlreadyDone(done),
            None => CancelOutcome::Idle,
        })
    }

    fn cleanup(&mut self) -> Result<()> {
        self.completion = None;
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            async_io: false,
            cancelable: false,
        }
    }
}
