//! JSON output formatting
//!
//! The JSON report carries the same counters as the text report plus the
//! configuration the run used, the host it ran on and when it was written.

use crate::config::Config;
use crate::stats::StatsSnapshot;
use crate::util::time::{format_duration, format_throughput, per_second};
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

/// Throughput with bytes/sec and human-readable format
#[derive(Debug, Clone, Serialize)]
pub struct JsonThroughput {
    pub bytes_per_sec: u64,
    pub human: String,
}

impl JsonThroughput {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        let rate = per_second(bytes, elapsed);
        Self {
            bytes_per_sec: rate as u64,
            human: format_throughput(rate),
        }
    }
}

/// Derived rates that are not stored as counters
#[derive(Debug, Clone, Serialize)]
pub struct JsonRates {
    pub elapsed: String,
    pub read: JsonThroughput,
    pub write: JsonThroughput,
    pub touch_read: JsonThroughput,
    pub touch_write: JsonThroughput,
    pub probe_waits_per_worker: f64,
    pub probe_applied_per_worker: f64,
}

/// Complete JSON report
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// RFC 3339 time the report was generated
    pub generated_at: String,
    pub config: &'a Config,
    pub stats: &'a StatsSnapshot,
    pub rates: JsonRates,
}

impl<'a> JsonReport<'a> {
    pub fn new(config: &'a Config, stats: &'a StatsSnapshot) -> Self {
        let elapsed = Duration::from_secs_f64(stats.elapsed_secs);
        let rates = JsonRates {
            elapsed: format_duration(elapsed),
            read: JsonThroughput::new(stats.io.read.completed_bytes, elapsed),
            write: JsonThroughput::new(stats.io.write.completed_bytes, elapsed),
            touch_read: JsonThroughput::new(stats.memory.touch_read_bytes, elapsed),
            touch_write: JsonThroughput::new(stats.memory.touch_write_bytes, elapsed),
            probe_waits_per_worker: stats.probe_waits_per_worker(),
            probe_applied_per_worker: stats.probe_applied_per_worker(),
        };

        Self {
            version: env!("CARGO_PKG_VERSION"),
            hostname: hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok()),
            generated_at: chrono::Local::now().to_rfc3339(),
            config,
            stats,
            rates,
        }
    }
}

/// Write the JSON report to `output_path`
pub fn write_json_output(output_path: &Path, config: &Config, stats: &StatsSnapshot) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON output: {}", output_path.display()))?;
    let mut writer = BufWriter::new(file);

    serde_json::to_writer_pretty(&mut writer, &JsonReport::new(config, stats))
        .context("Failed to serialize JSON report")?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    Ok(())
}
