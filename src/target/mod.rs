//! Shared data file and byte-range locking
//!
//! All I/O threads work on one pre-sized flat file. Each thread opens its own
//! handle, and every operation holds an open-file-description (OFD) lock over
//! exactly the bytes it touches: shared for reads, exclusive for writes. OFD
//! locks belong to the open file description rather than the process, so two
//! threads of this process with separate handles exclude each other just like
//! two processes would.
//!
//! # Example
//!
//! ```no_run
//! use threadstress::target::{DataFile, LockKind};
//!
//! let data = DataFile::create("/tmp/stress.dat".as_ref(), 1 << 20).unwrap();
//! let handle = data.open_handle().unwrap();
//! let lock = data.lock_range(&handle, LockKind::Exclusive, 4096, 512).unwrap();
//! // ... write bytes 4096..4608 ...
//! lock.release().unwrap();
//! data.cleanup().unwrap();
//! ```

pub mod file;

pub use file::DataFile;

use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;

/// Lock mode for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Read lock, may overlap other shared locks
    Shared,
    /// Write lock, overlaps nothing
    Exclusive,
}

impl LockKind {
    fn l_type(self) -> libc::c_short {
        match self {
            LockKind::Shared => libc::F_RDLCK as libc::c_short,
            LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }
}

/// Held byte-range lock
///
/// Release it with [`release`](RangeLock::release) so an unlock failure can be
/// reported. Dropping an unreleased lock unlocks on a best-effort basis.
#[derive(Debug)]
pub struct RangeLock {
    fd: RawFd,
    kind: LockKind,
    start: u64,
    len: u64,
    released: bool,
}

impl RangeLock {
    /// Block until `[start, start + len)` is locked in `kind` mode on `fd`
    ///
    /// Interrupted waits are retried.
    pub(crate) fn acquire(fd: RawFd, kind: LockKind, start: u64, len: u64) -> Result<Self> {
        let flock = range_flock(kind.l_type(), start, len);

        loop {
            let result = unsafe { libc::fcntl(fd, libc::F_OFD_SETLKW, &flock) };
            if result == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context(format!(
                "fcntl(F_OFD_SETLKW) failed: kind={:?}, offset={}, len={}",
                kind, start, len
            ));
        }

        Ok(Self {
            fd,
            kind,
            start,
            len,
            released: false,
        })
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Unlock the range
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        unlock(self.fd, self.start, self.len).with_context(|| {
            format!(
                "fcntl(F_UNLCK) failed: kind={:?}, offset={}, len={}",
                self.kind, self.start, self.len
            )
        })
    }
}

impl Drop for RangeLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = unlock(self.fd, self.start, self.len);
        }
    }
}

fn range_flock(l_type: libc::c_short, start: u64, len: u64) -> libc::flock {
    // SAFETY: flock is plain data; zero is a valid bit pattern and OFD locks
    // require l_pid to be 0
    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = l_type;
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    flock.l_start = start as libc::off_t;
    flock.l_len = len as libc::off_t;
    flock
}

fn unlock(fd: RawFd, start: u64, len: u64) -> std::io::Result<()> {
    let flock = range_flock(libc::F_UNLCK as libc::c_short, start, len);
    let result = unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, &flock) };
    if result < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Whether `[start, start + len)` could be locked in `kind` mode on `fd` now
#[cfg(test)]
pub(crate) fn range_is_free(fd: RawFd, kind: LockKind, start: u64, len: u64) -> Result<bool> {
    let mut flock = range_flock(kind.l_type(), start, len);
    let result = unsafe { libc::fcntl(fd, libc::F_OFD_GETLK, &mut flock) };
    if result < 0 {
        let err = std::io::Error::last_os_error();
        return Err(err).context("fcntl(F_OFD_GETLK) failed");
    }
    Ok(flock.l_type == libc::F_UNLCK as libc::c_short)
}
