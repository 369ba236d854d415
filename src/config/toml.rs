//! TOML configuration file parsing
//!
//! A file mirrors [`Config`] section by section:
//!
//! ```toml
//! [pool]
//! min_threads = 8
//! max_threads = 16
//! io_threads = 2
//!
//! [memory]
//! max_memory = 1073741824
//!
//! [io]
//! data_file = "/var/tmp/threadstress.dat"
//! engine = "libaio"
//!
//! [runtime]
//! duration_secs = 60
//! probe = "process-mask"
//! ```

use super::cli_convert::{convert_engine_type, convert_probe_mode, parse_duration, parse_size, parse_time_us};
use super::{Config, Verbosity};
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    if let Some(ref file) = cli.file {
        config.io.data_file = file.clone();
    }

    // Pool
    if let Some(min) = cli.min_threads {
        config.pool.min_threads = min;
    }
    if let Some(max) = cli.max_threads {
        config.pool.max_threads = max;
    }
    if let Some(io) = cli.io_threads {
        config.pool.io_threads = io;
    }
    if let Some(short_lived) = cli.short_lived() {
        config.pool.short_lived = short_lived;
    }

    // Memory
    if let Some(ref mem) = cli.max_mem {
        config.memory.max_memory = parse_size(mem).context("Invalid --max-mem")?;
    }
    if let Some(ref size) = cli.max_io_size {
        config.memory.max_io_size = parse_size(size).context("Invalid --max-io-size")?;
    }

    // I/O
    if let Some(ref size) = cli.max_file_size {
        config.io.max_file_size = Some(parse_size(size).context("Invalid --max-file-size")?);
    }
    if let Some(ref timeout) = cli.io_timeout {
        config.io.io_timeout_secs = parse_duration(timeout).context("Invalid --io-timeout")?;
    }
    if let Some(engine) = cli.engine {
        config.io.engine = convert_engine_type(engine);
    }

    // Runtime
    if let Some(ref time) = cli.time {
        config.runtime.duration_secs = parse_duration(time).context("Invalid --time")?;
    }
    if let Some(mode) = cli.probe_mode() {
        config.runtime.probe = convert_probe_mode(mode);
    }
    if let Some(ref poll) = cli.poll_interval {
        config.runtime.poll_interval_ms = parse_time_us(poll).context("Invalid --poll-interval")? / 1000;
    }
    if let Some(ref wait) = cli.probe_short_wait {
        config.runtime.probe_short_wait_us = parse_time_us(wait).context("Invalid --probe-short-wait")?;
    }
    if let Some(ref wait) = cli.probe_long_wait {
        config.runtime.probe_long_wait_ms = parse_time_us(wait).context("Invalid --probe-long-wait")? / 1000;
    }

    // Output
    if let Some(ref path) = cli.json_output {
        config.output.json_output = Some(path.clone());
    }
    if cli.debug {
        config.output.verbosity = Verbosity::Debug;
    } else if cli.verbose {
        config.output.verbosity = Verbosity::Verbose;
    } else if cli.brief {
        config.output.verbosity = Verbosity::Brief;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineType;
    use crate::worker::probe::ProbeKind;
    use clap::Parser;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[pool]
min_threads = 8
max_threads = 16
io_threads = 2
short_lived = false

[memory]
max_memory = 1073741824
max_io_size = 65536

[io]
data_file = "/var/tmp/stress.dat"
io_timeout_secs = 5
engine = "sync"

[runtime]
duration_secs = 60
probe = "process-mask"

[output]
verbosity = "brief"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_toml_string(SAMPLE).unwrap();
        assert_eq!(config.pool.min_threads, 8);
        assert_eq!(config.pool.max_threads, 16);
        assert_eq!(config.pool.io_threads, 2);
        assert!(!config.pool.short_lived);
        assert_eq!(config.memory.max_io_size, 65536);
        assert_eq!(config.io.data_file, PathBuf::from("/var/tmp/stress.dat"));
        assert_eq!(config.io.engine, EngineType::Sync);
        assert_eq!(config.runtime.duration_secs, 60);
        assert_eq!(config.runtime.probe, ProbeKind::ProcessMask);
        assert_eq!(config.runtime.poll_interval_ms, 1000);
        assert_eq!(config.output.verbosity, Verbosity::Brief);
    }

    #[test]
    fn test_parse_minimal_config_uses_defaults() {
        let config = parse_toml_string(
            r#"
[pool]
min_threads = 2

[io]
data_file = "/tmp/d"
"#,
        )
        .unwrap();
        assert_eq!(config.pool.max_threads, 0);
        assert!(config.pool.short_lived);
        assert_eq!(config.memory.max_io_size, 1024 * 1024);
        assert_eq!(config.io.io_timeout_secs, 3);
        assert_eq!(config.io.engine, EngineType::Libaio);
        assert_eq!(config.runtime.duration_secs, 20);
    }

    #[test]
    fn test_parse_rejects_unknown_probe() {
        let err = parse_toml_string(
            r#"
[pool]
min_threads = 2

[io]
data_file = "/tmp/d"

[runtime]
probe = "everything"
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::try_parse_from([
            "threadstress", "--config", &path, "-x", "32", "--short-threads", "--probe-long-wait",
            "250ms", "--debug", "/tmp/other.dat",
        ])
        .unwrap();
        let config = merge_cli_with_config(&cli, parse_toml_file(file.path()).unwrap()).unwrap();

        assert_eq!(config.pool.min_threads, 8);
        assert_eq!(config.pool.max_threads, 32);
        assert!(config.pool.short_lived);
        assert_eq!(config.runtime.probe_long_wait_ms, 250);
        assert_eq!(config.io.data_file, PathBuf::from("/tmp/other.dat"));
        assert_eq!(config.output.verbosity, Verbosity::Debug);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = parse_toml_file(Path::new("/nonexistent/threadstress.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/threadstress.toml"));
    }
}
