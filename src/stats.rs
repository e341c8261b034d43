//! Metrics for cloud environment operations.
//!
//! A deliberately small surface: one ticker counting manifest uploads and one
//! histogram of their latencies. Tickers are atomics; the histogram keeps a
//! running summary under a lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ticker {
    /// Number of times the manifest was written to the cloud.
    NumberManifestWrites,
}

impl Ticker {
    pub fn name(&self) -> &'static str {
        match self {
            Ticker::NumberManifestWrites => "cloud.number.manifest.writes",
        }
    }
}

/// Latency distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Histogram {
    /// Milliseconds elapsed during manifest uploads.
    ManifestWritesTime,
}

impl Histogram {
    pub fn name(&self) -> &'static str {
        match self {
            Histogram::ManifestWritesTime => "cloud.manifest.writes.millis",
        }
    }
}

/// Summary of a histogram's recorded values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl HistogramSummary {
    fn record(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }
}

/// Statistics sink shared by all components of one environment.
#[derive(Debug, Default)]
pub struct CloudStats {
    manifest_writes: AtomicU64,
    manifest_write_millis: Mutex<HistogramSummary>,
}

impl CloudStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, ticker: Ticker, count: u64) {
        match ticker {
            Ticker::NumberManifestWrites => {
                self.manifest_writes.fetch_add(count, Ordering::Relaxed);
            }
        }
    }

    pub fn ticker_count(&self, ticker: Ticker) -> u64 {
        match ticker {
            Ticker::NumberManifestWrites => self.manifest_writes.load(Ordering::Relaxed),
        }
    }

    pub fn measure_time(&self, histogram: Histogram, value: u64) {
        match histogram {
            Histogram::ManifestWritesTime => {
                self.manifest_write_millis.lock().record(value);
            }
        }
    }

    pub fn histogram(&self, histogram: Histogram) -> HistogramSummary {
        match histogram {
            Histogram::ManifestWritesTime => *self.manifest_write_millis.lock(),
        }
    }
}

impl std::fmt::Display for CloudStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hist = self.histogram(Histogram::ManifestWritesTime);
        write!(
            f,
            "{}: {} | {}: count {} sum {} min {} max {}",
            Ticker::NumberManifestWrites.name(),
            self.ticker_count(Ticker::NumberManifestWrites),
            Histogram::ManifestWritesTime.name(),
            hist.count,
            hist.sum,
            hist.min,
            hist.max,
        )
    }
}
