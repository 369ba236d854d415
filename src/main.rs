//! threadstress CLI entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use threadstress::config::{cli::Cli, cli_convert, validator, Config};
use threadstress::coordinator::{block_stop_signals, install_stop_handler};
use threadstress::output::{json, text};
use threadstress::stats::StatsSnapshot;
use threadstress::target::DataFile;
use threadstress::util::time::format_bytes;
use threadstress::{Coordinator, SystemState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    println!("threadstress v{}", env!("CARGO_PKG_VERSION"));
    println!("Thread pool, memory and locked file I/O stress generator");
    println!();

    let cli = Cli::parse_args();
    cli.validate()?;

    let config = cli_convert::build_config(&cli)?;
    init_tracing(&config);
    // Every thread started from here on, the stop handler's included, inherits the mask
    block_stop_signals(config.runtime.probe)?;

    validator::validate_config(&config).context("Configuration validation failed")?;
    print_configuration(&config);

    if cli.dry_run {
        println!();
        println!("Dry run mode - configuration validated successfully");
        return Ok(());
    }

    println!();
    println!("Starting run...");
    println!();

    let state = SystemState::new(config.memory.max_memory);
    install_stop_handler(&state)?;

    let started = Instant::now();
    let outcome = create_data_file(&config).and_then(|data| {
        let mut coordinator = Coordinator::new(config.clone(), Arc::clone(&state), data);
        coordinator.run()
    });
    let elapsed = match &outcome {
        Ok(elapsed) => *elapsed,
        Err(_) => started.elapsed(),
    };

    // The report is printed on every path
    report(&config, &state, elapsed);

    outcome
        .map(|_| ())
        .context("Run aborted during setup")
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.output.verbosity.filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();
}

/// Create and fill the data file when I/O threads are configured
fn create_data_file(config: &Config) -> Result<Option<Arc<DataFile>>> {
    if config.pool.io_threads == 0 {
        return Ok(None);
    }

    let size = config.data_file_size();
    info!(path = %config.io.data_file.display(), size, "creating data file");
    let data = DataFile::create(&config.io.data_file, size)?;
    Ok(Some(Arc::new(data)))
}

fn report(config: &Config, state: &SystemState, elapsed: Duration) {
    let stats = StatsSnapshot::capture(state, elapsed);
    text::print_results(&stats);

    if let Some(ref path) = config.output.json_output {
        match json::write_json_output(path, config, &stats) {
            Ok(()) => println!("JSON report written to {}", path.display()),
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(error = %reason, "failed to write JSON report");
            }
        }
    }
}

fn print_configuration(config: &Config) {
    println!("Configuration:");
    println!("  Pool:");
    println!("    Threads: {}", config.pool);
    println!("    Worker slots: {}", config.worker_slots());
    println!("  Memory:");
    if config.memory.max_memory == 0 {
        println!("    Budget: unlimited");
    } else {
        println!("    Budget: {}", format_bytes(config.memory.max_memory));
    }
    println!("    Max I/O size: {}", format_bytes(config.memory.max_io_size));
    println!("  I/O:");
    if config.pool.io_threads == 0 {
        println!("    Disabled");
    } else {
        println!("    Data file: {}", config.io.data_file.display());
        println!("    Size: {}", format_bytes(config.data_file_size()));
        println!("    Engine: {}", config.io.engine);
        println!("    Timeout: {}s", config.io.io_timeout_secs);
    }
    println!("  Runtime:");
    println!("    Duration: {}s", config.runtime.duration_secs);
    println!("    Probe: {}", config.runtime.probe);
    println!("    Poll interval: {}ms", config.runtime.poll_interval_ms);
    println!("    Verbosity: {}", config.output.verbosity);
}
