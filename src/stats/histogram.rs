//! I/O latency histogram
//!
//! Each I/O thread records the wall time of its locked operations (lock wait
//! included) into a private [`LatencyHistogram`] and merges it into the shared
//! one when it exits. Recording never takes a lock.

use crate::Result;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;

/// Longest latency tracked, one hour in nanoseconds
const MAX_TRACKED_NANOS: u64 = 3_600_000_000_000;

/// HdrHistogram over nanoseconds, 1ns to 1h, 3 significant digits
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let histogram = Histogram::new_with_bounds(1, MAX_TRACKED_NANOS, 3)
            .expect("histogram bounds are constant and valid");
        Self { histogram }
    }

    /// Record one sample, clamped into the tracked range
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        let nanos = (latency.as_nanos() as u64).clamp(1, MAX_TRACKED_NANOS);
        let _ = self.histogram.record(nanos);
    }

    /// Latency at `percentile` (0.0 - 100.0), `None` when empty
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(
            self.histogram.value_at_percentile(percentile),
        ))
    }

    pub fn max(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.max()))
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.mean() as u64))
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.len() == 0
    }

    /// Fold another histogram's samples into this one
    pub fn merge(&mut self, other: &LatencyHistogram) -> Result<()> {
        self.histogram
            .add(&other.histogram)
            .map_err(|e| anyhow::anyhow!("Failed to merge latency histograms: {}", e))?;
        Ok(())
    }

    /// Condense into the figures printed in the report
    pub fn summary(&self) -> Option<LatencySummary> {
        Some(LatencySummary {
            samples: self.len(),
            mean_us: self.mean()?.as_micros() as u64,
            p50_us: self.percentile(50.0)?.as_micros() as u64,
            p99_us: self.percentile(99.0)?.as_micros() as u64,
            max_us: self.max()?.as_micros() as u64,
        })
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency figures for the report, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_histogram_has_no_summary() {
        let hist = LatencyHistogram::new();
        assert!(hist.is_empty());
        assert!(hist.percentile(50.0).is_none());
        assert!(hist.summary().is_none());
    }

    #[test]
    fn test_percentiles() {
        let mut hist = LatencyHistogram::new();
        for i in 1..=100 {
            hist.record(Duration::from_micros(i * 10));
        }

        let p50 = hist.percentile(50.0).unwrap();
        let p99 = hist.percentile(99.0).unwrap();
        assert!(p50.as_micros() >= 450 && p50.as_micros() <= 550);
        assert!(p99.as_micros() >= 940 && p99.as_micros() <= 1040);
    }

    #[test]
    fn test_merge() {
        let mut a = LatencyHistogram::new();
        a.record(Duration::from_micros(100));

        let mut b = LatencyHistogram::new();
        b.record(Duration::from_millis(2));
        b.record(Duration::from_millis(3));

        a.merge(&b).unwrap();
        assert_eq!(a.len(), 3);

        let summary = a.summary().unwrap();
        assert_eq!(summary.samples, 3);
        assert!(summary.max_us >= 2990 && summary.max_us <= 3010);
    }

    #[test]
    fn test_zero_latency_is_clamped() {
        let mut hist = LatencyHistogram::new();
        hist.record(Duration::ZERO);
        assert_eq!(hist.len(), 1);
    }
}
