//! libaio I/O engine
//!
//! Linux native asynchronous I/O through direct syscalls rather than a binding
//! crate (the libaio library is LGPL). One context per engine, one control
//! block, one operation in flight.
//!
//! Completion is collected with `io_getevents` bounded by the caller's poll
//! interval, so an I/O thread can keep checking its timeout between polls.
//! Cancellation goes through `io_cancel`. Kernels that queue the cancellation
//! (`EINPROGRESS`) deliver the cancelled event through the ring; `cancel()`
//! reaps for it once and otherwise reports the operation as still in
//! progress, leaving the caller to keep polling. The event then shows up from
//! `wait()` with `ECANCELED`. Kernels or files that cannot cancel (`EINVAL`,
//! `EAGAIN`) leave the operation running and the caller has to keep waiting
//! for it.

use super::{
    CancelOutcome, EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation,
    OperationType,
};
use crate::Result;
use anyhow::Context;
use std::time::Duration;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// How long one `cancel()` call waits for a queued cancellation to land
const CANCEL_REAP_POLL: Duration = Duration::from_millis(100);

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoControlBlock {
    data: u64,          // aio_data, echoed in the event
    key: u32,           // aio_key, filled by the kernel
    aio_rw_flags: u32,  // RWF_* flags
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,         // IOCB_FLAG_*
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,  // bytes transferred or -errno
    res2: i64,
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_setup, maxevents as libc::c_long, ctxp)
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbpp: *mut *mut IoControlBlock) -> libc::c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp)
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout)
}

unsafe fn io_cancel(ctx: AioContext, iocb: *mut IoControlBlock, result: *mut IoEvent) -> libc::c_long {
    libc::syscall(libc::SYS_io_cancel, ctx, iocb, result)
}

/// Native AIO engine
pub struct LibaioEngine {
    ctx: Option<AioContext>,
    /// Boxed so its address stays fixed while the kernel refers to it
    iocb: Box<IoControlBlock>,
    outstanding: Option<OperationType>,
    /// io_cancel answered EINPROGRESS for the outstanding operation
    cancel_queued: bool,
}

impl LibaioEngine {
    pub fn new() -> Self {
        Self {
            ctx: None,
            iocb: Box::default(),
            outstanding: None,
            cancel_queued: false,
        }
    }

    fn context(&self) -> Result<AioContext> {
        self.ctx
            .ok_or_else(|| anyhow::anyhow!("libaio engine not initialized"))
    }

    fn to_completion(&self, op_type: OperationType, event: &IoEvent) -> IOCompletion {
        let result = if event.res >= 0 {
            Ok(event.res as usize)
        } else {
            let errno = (-event.res) as i32;
            Err(std::io::Error::from_raw_os_error(errno))
                .context(format!("{} operation failed: errno={}", op_type, errno))
        };
        IOCompletion {
            user_data: event.data,
            result,
            op_type,
        }
    }

    /// One bounded `io_getevents` call; `None` on timeout or EINTR
    fn reap(&mut self, timeout: Duration) -> Result<Option<IoEvent>> {
        let ctx = self.context()?;
        let mut event = IoEvent::default();
        let mut ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };

        let result = unsafe { io_getevents(ctx, 1, 1, &mut event, &mut ts) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err).context("io_getevents failed");
        }
        Ok((result > 0).then_some(event))
    }

    /// Outcome of a queued cancellation given what the ring produced
    fn settle_cancel(&mut self, op_type: OperationType, event: Option<IoEvent>) -> CancelOutcome {
        let Some(event) = event else {
            return CancelOutcome::InProgress;
        };
        self.outstanding = None;
        self.cancel_queued = false;
        if event.res == -(libc::ECANCELED as i64) {
            CancelOutcome::Canceled
        } else {
            CancelOutcome::AlreadyDone(self.to_completion(op_type, &event))
        }
    }
}

impl Default for LibaioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for LibaioEngine {
    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        let mut ctx: AioContext = 0;
        let result = unsafe { io_setup(config.queue_depth as libc::c_int, &mut ctx) };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!(
                "io_setup failed with queue_depth={}",
                config.queue_depth
            ));
        }

        self.ctx = Some(ctx);
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let ctx = self.context()?;
        if self.outstanding.is_some() {
            anyhow::bail!("libaio engine already has an outstanding operation");
        }

        *self.iocb = IoControlBlock {
            data: op.user_data,
            lio_opcode: match op.op_type {
                OperationType::Read => IOCB_CMD_PREAD,
                OperationType::Write => IOCB_CMD_PWRITE,
            },
            aio_fildes: op.target_fd as u32,
            buf: op.buffer as u64,
            nbytes: op.length as u64,
            offset: op.offset as i64,
            ..IoControlBlock::default()
        };

        let mut iocb_ptr: *mut IoControlBlock = &mut *self.iocb;
        let result = unsafe { io_submit(ctx, 1, &mut iocb_ptr) };

        if result != 1 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("io_submit failed for {} operation", op.op_type));
        }

        self.outstanding = Some(op.op_type);
        self.cancel_queued = false;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<IOCompletion>> {
        let Some(op_type) = self.outstanding else {
            return Ok(None);
        };

        match self.reap(timeout)? {
            Some(event) => {
                self.outstanding = None;
                self.cancel_queued = false;
                Ok(Some(self.to_completion(op_type, &event)))
            }
            None => Ok(None),
        }
    }

    fn cancel(&mut self) -> Result<CancelOutcome> {
        let ctx = self.context()?;
        let Some(op_type) = self.outstanding else {
            return Ok(CancelOutcome::Idle);
        };

        if self.cancel_queued {
            let event = self.reap(CANCEL_REAP_POLL)?;
            return Ok(self.settle_cancel(op_type, event));
        }

        let mut event = IoEvent::default();
        let result = unsafe { io_cancel(ctx, &mut *self.iocb, &mut event) };

        if result == 0 {
            self.outstanding = None;
            return Ok(CancelOutcome::Canceled);
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) => {
                // The cancelled event arrives through the ring
                self.cancel_queued = true;
                let event = self.reap(CANCEL_REAP_POLL)?;
                Ok(self.settle_cancel(op_type, event))
            }
            Some(libc::EINVAL) | Some(libc::EAGAIN) => Ok(CancelOutcome::InProgress),
            _ => Err(err).context("io_cancel failed"),
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        if let Some(ctx) = self.ctx.take() {
            // io_destroy waits for anything still in flight
            let result = unsafe { io_destroy(ctx) };
            if result < 0 {
                let err = std::io::Error::last_os_error();
                return Err(err).context("io_destroy failed");
            }
        }
        self.outstanding = None;
        self.cancel_queued = false;
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            async_io: true,
            cancelable: true,
        }
    }
}

impl Drop for LibaioEngine {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
