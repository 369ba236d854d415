//! Human-readable text output

use crate::stats::{DirectionSnapshot, StatsSnapshot};
use crate::util::time::{format_bytes, format_number, format_throughput, per_second};
use std::fmt::Write;
use std::time::Duration;

const RULE: &str = "═══════════════════════════════════════════════════════════";

/// Print the end-of-run report to stdout
pub fn print_results(stats: &StatsSnapshot) {
    print!("{}", render_results(stats));
}

/// Render the end-of-run report
///
/// Every counter is listed. Failure counters of a transfer direction only
/// appear once they are non-zero.
pub fn render_results(stats: &StatsSnapshot) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = write_results(&mut out, stats);
    out
}

fn write_results(out: &mut String, stats: &StatsSnapshot) -> std::fmt::Result {
    let elapsed = Duration::from_secs_f64(stats.elapsed_secs);

    writeln!(out, "{}", RULE)?;
    writeln!(out, "                      RUN RESULTS")?;
    writeln!(out, "{}", RULE)?;
    writeln!(out)?;
    writeln!(out, "Elapsed Time: {:.3}s", stats.elapsed_secs)?;
    if let Some(ref reason) = stats.aborted {
        writeln!(out, "Aborted:      {}", reason)?;
    }
    writeln!(out)?;

    let t = &stats.threads;
    writeln!(out, "Threads:")?;
    writeln!(out, "  Workers started:    {}", format_number(t.workers_started))?;
    writeln!(out, "  I/O threads:        {}", format_number(t.io_threads_started))?;
    writeln!(out, "  Peak concurrent:    {}", t.peak)?;
    writeln!(out, "  Retired:            {}", format_number(t.workers_retired))?;
    writeln!(out, "  Spawn failures:     {}", t.spawn_failures)?;
    writeln!(
        out,
        "  Active at end:      {} ({} I/O)",
        t.active_at_end, t.io_active_at_end
    )?;
    writeln!(out)?;

    let m = &stats.memory;
    writeln!(out, "Memory:")?;
    if m.ceiling == 0 {
        writeln!(out, "  Ceiling:            unlimited")?;
    } else {
        writeln!(out, "  Ceiling:            {}", format_bytes(m.ceiling))?;
    }
    writeln!(out, "  Peak in use:        {}", format_bytes(m.peak))?;
    writeln!(out, "  In use at end:      {}", format_bytes(m.in_use_at_end))?;
    writeln!(
        out,
        "  Allocations:        {} ({} freed)",
        format_number(m.allocations),
        format_number(m.frees)
    )?;
    writeln!(out, "  Over budget:        {}", format_number(m.rejected))?;
    writeln!(out, "  Allocator failures: {}", format_number(m.failed))?;
    writeln!(
        out,
        "  Touched (write):    {} ({})",
        format_bytes(m.touch_write_bytes),
        format_throughput(per_second(m.touch_write_bytes, elapsed))
    )?;
    writeln!(
        out,
        "  Touched (read):     {} ({})",
        format_bytes(m.touch_read_bytes),
        format_throughput(per_second(m.touch_read_bytes, elapsed))
    )?;
    writeln!(out)?;

    let p = &stats.probe;
    writeln!(out, "Probe:")?;
    writeln!(
        out,
        "  Waits:              {} ({:.1} per worker)",
        format_number(p.attempts),
        stats.probe_waits_per_worker()
    )?;
    writeln!(
        out,
        "  Mask reapplied:     {} ({:.1} per worker, {} failed)",
        format_number(p.applied),
        stats.probe_applied_per_worker(),
        p.failures
    )?;
    writeln!(out, "  Long timeouts:      {}", format_number(p.long_waits))?;
    writeln!(out, "  Short timeouts:     {}", format_number(p.short_waits))?;
    writeln!(out, "  Interrupted:        {}", format_number(p.interrupted))?;
    writeln!(out, "  Time timed out:     {:.3}s", p.timed_out_secs)?;
    writeln!(out, "  Time interrupted:   {:.3}s", p.interrupted_secs)?;
    writeln!(out, "  Stop signals:       {}", p.stop_signals)?;
    writeln!(out)?;

    let io = &stats.io;
    writeln!(out, "I/O:")?;
    writeln!(
        out,
        "  Requests:           {} queued, {} refused",
        format_number(io.queued),
        format_number(io.rejected)
    )?;
    writeln!(
        out,
        "  Serviced:           {} tried, {} finished",
        format_number(io.tried),
        format_number(io.finished)
    )?;
    write_direction(out, "Read", &io.read, elapsed)?;
    write_direction(out, "Write", &io.write, elapsed)?;
    writeln!(
        out,
        "  Left in queues:     read {}, write {}, done {}",
        io.leftover_read, io.leftover_write, io.leftover_done
    )?;
    if let Some(ref latency) = io.latency {
        writeln!(
            out,
            "  Latency:            mean {}us, p50 {}us, p99 {}us, max {}us ({} samples)",
            latency.mean_us, latency.p50_us, latency.p99_us, latency.max_us, latency.samples
        )?;
    }
    writeln!(out)?;
    writeln!(out, "{}", RULE)?;
    Ok(())
}

fn write_direction(
    out: &mut String,
    label: &str,
    dir: &DirectionSnapshot,
    elapsed: Duration,
) -> std::fmt::Result {
    writeln!(
        out,
        "  {:<6}              {} of {} ({})",
        format!("{}:", label),
        format_bytes(dir.completed_bytes),
        format_bytes(dir.attempted_bytes),
        format_throughput(per_second(dir.completed_bytes, elapsed))
    )?;
    if dir.failed > 0 {
        writeln!(out, "    Failed:           {}", format_number(dir.failed))?;
    }
    if dir.timeouts > 0 {
        writeln!(out, "    Timed out:        {}", format_number(dir.timeouts))?;
    }
    if dir.incomplete > 0 {
        writeln!(
            out,
            "    Incomplete:       {} ({} short)",
            format_number(dir.incomplete),
            format_bytes(dir.shortfall_bytes)
        )?;
    }
    Ok(())
}
