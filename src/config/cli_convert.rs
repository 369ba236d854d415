//! CLI to Config conversion utilities

use crate::config::cli::{self, Cli};
use crate::config::{toml, Config};
use crate::engine;
use crate::worker::probe::ProbeKind;
use anyhow::{Context, Result};

/// Parse a size string (e.g., "1G", "100M", "4k") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("kb") || s.ends_with('k') {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024u64)
    } else if s.ends_with("mb") || s.ends_with('m') {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024)
    } else if s.ends_with("gb") || s.ends_with('g') {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024)
    } else if s.ends_with("tb") || s.ends_with('t') {
        (s.trim_end_matches("tb").trim_end_matches('t'), 1024 * 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size out of range: {}", s))
}

/// Parse a duration string (e.g., "60s", "5m", "1h") to seconds
pub fn parse_duration(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("sec") || s.ends_with('s') {
        (s.trim_end_matches("sec").trim_end_matches('s'), 1u64)
    } else if s.ends_with("min") || s.ends_with('m') {
        (s.trim_end_matches("min").trim_end_matches('m'), 60)
    } else if s.ends_with("hr") || s.ends_with('h') {
        (s.trim_end_matches("hr").trim_end_matches('h'), 3600)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    Ok(num * multiplier)
}

/// Parse a time string (e.g., "100us", "1ms", "10ms") to microseconds
pub fn parse_time_us(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("us") {
        (s.trim_end_matches("us"), 1u64)
    } else if s.ends_with("ms") {
        (s.trim_end_matches("ms"), 1000)
    } else if s.ends_with('s') {
        (s.trim_end_matches('s'), 1_000_000)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid time format: {}", s))?;

    Ok(num * multiplier)
}

/// Convert CLI EngineType to engine EngineType
pub fn convert_engine_type(cli_type: cli::EngineType) -> engine::EngineType {
    match cli_type {
        cli::EngineType::Libaio => engine::EngineType::Libaio,
        cli::EngineType::Sync => engine::EngineType::Sync,
    }
}

/// Convert CLI ProbeMode to ProbeKind
pub fn convert_probe_mode(cli_mode: cli::ProbeMode) -> ProbeKind {
    match cli_mode {
        cli::ProbeMode::ThreadMask => ProbeKind::ThreadMask,
        cli::ProbeMode::ProcessMask => ProbeKind::ProcessMask,
        cli::ProbeMode::None => ProbeKind::None,
    }
}

/// Build the run configuration from the command line
///
/// Starts from the TOML file when `--config` is given, otherwise from the
/// defaults, then applies every option set on the command line. The result
/// is normalized but not validated.
pub fn build_config(cli: &Cli) -> Result<Config> {
    let base = match &cli.config {
        Some(path) => toml::parse_toml_file(path)?,
        None => {
            let min_threads = cli
                .min_threads
                .context("--min-threads is required unless --config is given")?;
            let file = cli
                .file
                .clone()
                .context("data FILE is required unless --config is given")?;
            Config::new(min_threads, file)
        }
    };

    let mut config = toml::merge_cli_with_config(cli, base)?;
    config.normalize();
    Ok(config)
}
