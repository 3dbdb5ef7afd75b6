//! Per-session latency statistics.
//!
//! All counters are atomics so callbacks on different CPUs can record
//! without taking the session's exclusion lock.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Number of histogram buckets.
pub const NUM_BUCKETS: usize = 8;

/// Exclusive upper bounds of the histogram buckets, in nanoseconds.
pub const BUCKET_BOUNDS_NS: [u64; NUM_BUCKETS] = [
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    u64::MAX,
];

const BUCKET_LABELS: [&str; NUM_BUCKETS] = [
    "0-1us", "1-10us", "10-100us", "100us-1ms", "1-10ms", "10-100ms", "100ms-1s", ">1s",
];

/// Logarithmic latency histogram.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; NUM_BUCKETS],
}

impl LatencyHistogram {
    pub const fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; NUM_BUCKETS],
        }
    }

    /// Bucket a duration falls into.
    pub fn bucket_index(duration_ns: u64) -> usize {
        BUCKET_BOUNDS_NS
            .iter()
            .position(|&bound| duration_ns < bound)
            .unwrap_or(NUM_BUCKETS - 1)
    }

    pub fn record(&self, duration_ns: u64) {
        self.buckets[Self::bucket_index(duration_ns)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: core::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub buckets: [u64; NUM_BUCKETS],
}

impl HistogramSnapshot {
    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Upper bound of the bucket holding the `percent`th percentile
    /// sample, or 0 if empty. `percent` is clamped to 1..=100.
    pub fn percentile_bound(&self, percent: u32) -> u64 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        let percent = percent.clamp(1, 100) as u64;
        let rank = (total * percent).div_ceil(100);
        let mut seen = 0;
        for (i, &count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return BUCKET_BOUNDS_NS[i];
            }
        }
        BUCKET_BOUNDS_NS[NUM_BUCKETS - 1]
    }
}

impl fmt::Display for HistogramSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peak = self.buckets.iter().copied().max().unwrap_or(0).max(1);
        for (label, &count) in BUCKET_LABELS.iter().zip(self.buckets.iter()) {
            let width = (count * BAR_WIDTH as u64).div_ceil(peak) as usize;
            writeln!(f, "{:>10} | {} {}", label, Bar(width), count)?;
        }
        Ok(())
    }
}

const BAR_WIDTH: usize = 40;

/// Fixed-width bar, `#` filled and space padded.
struct Bar(usize);

impl fmt::Display for Bar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..BAR_WIDTH {
            f.write_str(if i < self.0 { "#" } else { " " })?;
        }
        Ok(())
    }
}

/// Counters and latency distribution of one probe session.
#[derive(Debug)]
pub struct LatencyStats {
    samples: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
    last_ns: AtomicU64,
    /// Invocations skipped by the context filter.
    filtered: AtomicU64,
    /// Invocations not tracked because the slot table was full.
    missed: AtomicU64,
    /// Post-callbacks without a matching pre-callback slot.
    unmatched: AtomicU64,
    /// Argument fetches that failed on foreign memory.
    arg_faults: AtomicU64,
    /// Faults reported while the probe was running.
    faults: AtomicU64,
    histogram: LatencyHistogram,
}

impl LatencyStats {
    pub const fn new() -> Self {
        Self {
            samples: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
            last_ns: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            arg_faults: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            histogram: LatencyHistogram::new(),
        }
    }

    /// Record one entry-to-exit latency sample ending at `timestamp`.
    pub fn record(&self, timestamp: u64, elapsed_ns: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        self.last_ns.store(timestamp, Ordering::Relaxed);
        self.min_ns.fetch_min(elapsed_ns, Ordering::Relaxed);
        self.max_ns.fetch_max(elapsed_ns, Ordering::Relaxed);
        self.histogram.record(elapsed_ns);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missed(&self) {
        self.missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_arg_fault(&self) {
        self.arg_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let samples = self.samples.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let min_ns = self.min_ns.load(Ordering::Relaxed);
        LatencySnapshot {
            samples,
            total_ns,
            min_ns: if min_ns == u64::MAX { 0 } else { min_ns },
            max_ns: self.max_ns.load(Ordering::Relaxed),
            avg_ns: if samples > 0 { total_ns / samples } else { 0 },
            last_ns: self.last_ns.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            arg_faults: self.arg_faults.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            histogram: self.histogram.snapshot(),
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`LatencyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub samples: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
    /// Timestamp of the most recent sample.
    pub last_ns: u64,
    pub filtered: u64,
    pub missed: u64,
    pub unmatched: u64,
    pub arg_faults: u64,
    pub faults: u64,
    pub histogram: HistogramSnapshot,
}
