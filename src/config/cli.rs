//! CLI argument parsing using clap

use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

/// threadstress - thread pool, memory and locked file I/O stress tool
///
/// Runs a bounded pool of worker threads that allocate and touch memory,
/// reapply a signal mask, and hand random reads and writes of a shared data
/// file to dedicated I/O threads. A statistics report is printed at the end
/// of every run.
#[derive(Parser, Debug)]
#[command(name = "threadstress")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Data file shared by the I/O threads
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// TOML configuration file; command line values take precedence
    #[arg(short = 'c', long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    // === Pool Options ===
    /// Threads started up front, I/O threads included
    #[arg(short = 'n', long, alias = "minthreads")]
    pub min_threads: Option<usize>,

    /// Maximum number of threads alive at once (default: min-threads)
    #[arg(short = 'x', long, alias = "maxthreads")]
    pub max_threads: Option<usize>,

    /// Dedicated I/O threads (0 disables I/O)
    #[arg(short = 'i', long, alias = "iothreads")]
    pub io_threads: Option<usize>,

    /// Workers may retire and are replaced during the run (default)
    #[arg(long, alias = "shortthreads", conflicts_with = "long_threads")]
    pub short_threads: bool,

    /// Workers live until shutdown
    #[arg(long, alias = "longthreads")]
    pub long_threads: bool,

    // === Memory Options ===
    /// Memory budget for worker buffers (e.g., 512M, 2G; 0 = unlimited)
    #[arg(short = 'm', long, alias = "maxmem")]
    pub max_mem: Option<String>,

    /// Largest buffer and transfer size (e.g., 64k, 1M)
    #[arg(short = 'S', long, alias = "maxiosize")]
    pub max_io_size: Option<String>,

    // === I/O Options ===
    /// Data file size (default: twice max-mem, or 6G)
    #[arg(short = 'F', long, alias = "maxfilesize")]
    pub max_file_size: Option<String>,

    /// Per-transfer timeout (e.g., 3s); below one second means 3s
    #[arg(short = 'o', long, alias = "iotimeout")]
    pub io_timeout: Option<String>,

    /// I/O engine to use
    #[arg(long, value_enum)]
    pub engine: Option<EngineType>,

    // === Runtime Options ===
    /// Run duration (e.g., 20s, 5m)
    #[arg(short = 't', long)]
    pub time: Option<String>,

    /// Probe action run by workers
    #[arg(long, value_enum)]
    pub probe: Option<ProbeMode>,

    /// Same as --probe thread-mask
    #[arg(long, alias = "sigmaskthread", conflicts_with_all = ["probe", "sigmask_task"])]
    pub sigmask_thread: bool,

    /// Same as --probe process-mask
    #[arg(long, alias = "sigmasktask", conflicts_with = "probe")]
    pub sigmask_task: bool,

    /// Period of every polling loop (e.g., 1s, 250ms)
    #[arg(long)]
    pub poll_interval: Option<String>,

    /// Short probe wait (e.g., 100us)
    #[arg(long)]
    pub probe_short_wait: Option<String>,

    /// Long probe wait (e.g., 1s)
    #[arg(long)]
    pub probe_long_wait: Option<String>,

    // === Output Options ===
    /// Also write the final report as JSON
    #[arg(long, value_name = "PATH")]
    pub json_output: Option<PathBuf>,

    /// Log run progress at debug level
    #[arg(short = 'v', long, action = ArgAction::SetTrue, conflicts_with_all = ["brief", "debug"])]
    pub verbose: bool,

    /// Only log warnings
    #[arg(short = 'b', long, conflicts_with = "debug")]
    pub brief: bool,

    /// Log everything, including per-request tracing
    #[arg(long)]
    pub debug: bool,

    /// Validate and print the configuration, then exit
    #[arg(long)]
    pub dry_run: bool,
}

/// I/O engine type
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineType {
    /// Linux native asynchronous I/O
    Libaio,
    /// Blocking pread/pwrite
    Sync,
}

/// Probe action
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeMode {
    /// Block SIGQUIT and SIGUSR1 in the calling thread
    ThreadMask,
    /// Block SIGQUIT and SIGUSR1 for the whole process
    ProcessMask,
    /// Sleep instead of waiting for signals
    None,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    ///
    /// Without a configuration file the pool size and data file must come
    /// from the command line.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.config.is_none() {
            if self.min_threads.is_none() {
                anyhow::bail!("--min-threads is required unless --config is given");
            }
            if self.file.is_none() {
                anyhow::bail!("data FILE is required unless --config is given");
            }
        }

        if self.min_threads == Some(0) {
            anyhow::bail!("min-threads must be at least 1");
        }

        Ok(())
    }

    /// Probe selected by `--probe` or one of its aliases
    pub fn probe_mode(&self) -> Option<ProbeMode> {
        if self.sigmask_thread {
            Some(ProbeMode::ThreadMask)
        } else if self.sigmask_task {
            Some(ProbeMode::ProcessMask)
        } else {
            self.probe
        }
    }

    /// Worker replacement policy if given on the command line
    pub fn short_lived(&self) -> Option<bool> {
        match (self.short_threads, self.long_threads) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}
