//! Pre-populated data file
//!
//! The file is created (or truncated) at startup and filled with zeros up to
//! its configured size so that reads anywhere inside it hit real blocks. The
//! setup handle stays open until [`DataFile::cleanup`] closes it and removes
//! the file.

use super::{LockKind, RangeLock};
use crate::Result;
use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Size of each zero chunk written during pre-population
const FILL_CHUNK: usize = 10 * 1024 * 1024;

/// The single shared data file
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    size: u64,
    /// Setup handle, closed by cleanup
    handle: Mutex<Option<File>>,
}

impl DataFile {
    /// Create `path` and zero-fill it to `size` bytes
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("data file size must be greater than 0");
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create data file: {}", path.display()))?;

        info!(path = %path.display(), size, "pre-populating data file");

        let chunk = vec![0u8; FILL_CHUNK.min(size as usize)];
        let mut written = 0u64;
        while written < size {
            let n = (size - written).min(chunk.len() as u64) as usize;
            file.write_all(&chunk[..n]).with_context(|| {
                format!(
                    "Failed to pre-populate data file {} at offset {}",
                    path.display(),
                    written
                )
            })?;
            written += n as u64;
        }
        file.sync_data()
            .with_context(|| format!("Failed to sync data file: {}", path.display()))?;

        debug!(path = %path.display(), written, "data file ready");

        Ok(Self {
            path: path.to_path_buf(),
            size,
            handle: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open a private read/write handle for one I/O thread
    ///
    /// Every call creates a new open file description, so byte-range locks
    /// taken through different handles conflict with each other.
    pub fn open_handle(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open data file: {}", self.path.display()))
    }

    /// Lock `[offset, offset + len)` through `handle`, waiting for conflicts
    pub fn lock_range(&self, handle: &File, kind: LockKind, offset: u64, len: u64) -> Result<RangeLock> {
        if len == 0 || offset + len > self.size {
            anyhow::bail!(
                "lock range {}+{} is outside data file of {} bytes",
                offset,
                len,
                self.size
            );
        }
        RangeLock::acquire(handle.as_raw_fd(), kind, offset, len)
    }

    /// Close the setup handle and remove the file
    pub fn cleanup(&self) -> Result<()> {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(handle);

        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "removed data file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove data file: {}", self.path.display())),
        }
    }
}
