//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::engine::EngineType;
use crate::worker::probe::ProbeKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Data file size when neither a file size nor a memory ceiling is given
pub const DEFAULT_FILE_SIZE: u64 = 6 * 1024 * 1024 * 1024;

/// Largest single transfer the kernel interfaces accept
pub const MAX_IO_SIZE_LIMIT: u64 = 0x7FFF_FFFF;

/// I/O timeout used when the configured one is below one second
pub const FALLBACK_IO_TIMEOUT_SECS: u64 = 3;

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    pub io: IoConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Thread pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Threads started up front, I/O threads included
    pub min_threads: usize,
    /// Upper bound on live threads; 0 means equal to `min_threads`
    #[serde(default)]
    pub max_threads: usize,
    /// Dedicated I/O threads; 0 disables I/O entirely
    #[serde(default)]
    pub io_threads: usize,
    /// Workers may retire and get replaced during the run
    #[serde(default = "default_short_lived")]
    pub short_lived: bool,
}

fn default_short_lived() -> bool {
    true
}

/// Memory budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Ceiling for all worker buffers in bytes (0 = unlimited)
    #[serde(default)]
    pub max_memory: u64,
    /// Largest buffer, and so largest transfer, in bytes
    #[serde(default = "default_max_io_size")]
    pub max_io_size: u64,
}

fn default_max_io_size() -> u64 {
    1024 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory: 0,
            max_io_size: default_max_io_size(),
        }
    }
}

/// Data file and I/O engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Path of the shared data file
    pub data_file: PathBuf,
    /// Data file size in bytes
    pub max_file_size: Option<u64>,
    /// Per-transfer timeout in seconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    #[serde(default)]
    pub engine: EngineType,
}

fn default_io_timeout() -> u64 {
    FALLBACK_IO_TIMEOUT_SECS
}

/// Run clock, polling and probe tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Run duration in seconds
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
    /// Period of every polling loop in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub probe: ProbeKind,
    /// Short probe wait in microseconds
    #[serde(default = "default_probe_short_wait")]
    pub probe_short_wait_us: u64,
    /// Long probe wait in milliseconds
    #[serde(default = "default_probe_long_wait")]
    pub probe_long_wait_ms: u64,
}

fn default_duration() -> u64 {
    20
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_probe_short_wait() -> u64 {
    100
}

fn default_probe_long_wait() -> u64 {
    1000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration(),
            poll_interval_ms: default_poll_interval(),
            probe: ProbeKind::default(),
            probe_short_wait_us: default_probe_short_wait(),
            probe_long_wait_ms: default_probe_long_wait(),
        }
    }
}

/// Log level of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Brief,
    #[default]
    Normal,
    Verbose,
    Debug,
}

impl Verbosity {
    /// `tracing` filter directive used when `RUST_LOG` is not set
    pub fn filter(self) -> &'static str {
        match self {
            Verbosity::Brief => "warn",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Debug => "trace",
        }
    }
}

/// Reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Also write the final report as JSON to this path
    pub json_output: Option<PathBuf>,
}

impl Config {
    /// Minimal configuration for `min_threads` threads on `data_file`
    pub fn new(min_threads: usize, data_file: impl Into<PathBuf>) -> Self {
        Self {
            pool: PoolConfig {
                min_threads,
                max_threads: min_threads,
                io_threads: 0,
                short_lived: default_short_lived(),
            },
            memory: MemoryConfig::default(),
            io: IoConfig {
                data_file: data_file.into(),
                max_file_size: None,
                io_timeout_secs: default_io_timeout(),
                engine: EngineType::default(),
            },
            runtime: RuntimeConfig::default(),
            output: OutputConfig::default(),
        }
    }

    /// Fill in derived defaults
    ///
    /// An unset maximum becomes the minimum, and an I/O timeout below one
    /// second becomes three seconds.
    pub fn normalize(&mut self) {
        if self.pool.max_threads == 0 {
            self.pool.max_threads = self.pool.min_threads;
        }
        if self.io.io_timeout_secs < 1 {
            self.io.io_timeout_secs = FALLBACK_IO_TIMEOUT_SECS;
        }
    }

    /// Size the data file is created with
    ///
    /// The explicit size if set, else twice the memory ceiling, else 6 GiB.
    pub fn data_file_size(&self) -> u64 {
        match self.io.max_file_size {
            Some(size) if size > 0 => size,
            _ if self.memory.max_memory > 0 => self.memory.max_memory.saturating_mul(2),
            _ => DEFAULT_FILE_SIZE,
        }
    }

    /// Slots in the worker table
    pub fn worker_slots(&self) -> usize {
        self.pool.max_threads.saturating_sub(self.pool.io_threads)
    }

    /// Workers started before the clock begins
    pub fn initial_workers(&self) -> usize {
        self.pool.min_threads.saturating_sub(self.pool.io_threads)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.runtime.duration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.runtime.poll_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io.io_timeout_secs)
    }

    pub fn probe_short_wait(&self) -> Duration {
        Duration::from_micros(self.runtime.probe_short_wait_us)
    }

    pub fn probe_long_wait(&self) -> Duration {
        Duration::from_millis(self.runtime.probe_long_wait_ms)
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verbosity::Brief => write!(f, "brief"),
            Verbosity::Normal => write!(f, "normal"),
            Verbosity::Verbose => write!(f, "verbose"),
            Verbosity::Debug => write!(f, "debug"),
        }
    }
}

impl fmt::Display for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} threads ({} I/O), {}",
            self.min_threads,
            self.max_threads,
            self.io_threads,
            if self.short_lived { "short-lived" } else { "long-lived" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_defaults() {
        let mut config = Config::new(4, "/tmp/data.dat");
        config.pool.max_threads = 0;
        config.io.io_timeout_secs = 0;
        config.normalize();

        assert_eq!(config.pool.max_threads, 4);
        assert_eq!(config.io_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_data_file_size_precedence() {
        let mut config = Config::new(2, "/tmp/data.dat");
        assert_eq!(config.data_file_size(), DEFAULT_FILE_SIZE);

        config.memory.max_memory = 512 * 1024 * 1024;
        assert_eq!(config.data_file_size(), 1024 * 1024 * 1024);

        config.io.max_file_size = Some(64 * 1024 * 1024);
        assert_eq!(config.data_file_size(), 64 * 1024 * 1024);
    }

    #[test]
    fn test_slot_counts() {
        let mut config = Config::new(4, "/tmp/data.dat");
        config.pool.max_threads = 10;
        config.pool.io_threads = 2;

        assert_eq!(config.worker_slots(), 8);
        assert_eq!(config.initial_workers(), 2);
    }

    #[test]
    fn test_verbosity_filters() {
        assert_eq!(Verbosity::default().filter(), "info");
        assert_eq!(Verbosity::Brief.filter(), "warn");
        assert!(Verbosity::Debug > Verbosity::Verbose);
    }
}
