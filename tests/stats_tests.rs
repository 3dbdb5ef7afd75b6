//! Integration tests for session latency statistics.
//!
//! Tests LatencyStats snapshots and the latency histogram.

use axprobe::stats::{BUCKET_BOUNDS_NS, LatencyHistogram, LatencyStats, NUM_BUCKETS};

// =============================================================================
// LatencyStats Tests
// =============================================================================

#[test]
fn test_stats_new() {
    let snapshot = LatencyStats::new().snapshot();
    assert_eq!(snapshot.samples, 0);
    assert_eq!(snapshot.total_ns, 0);
    assert_eq!(snapshot.min_ns, 0);
    assert_eq!(snapshot.max_ns, 0);
    assert_eq!(snapshot.avg_ns, 0);
}

#[test]
fn test_record_updates_duration_stats() {
    let stats = LatencyStats::new();
    stats.record(1_000, 500);
    stats.record(2_000, 100);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.samples, 2);
    assert_eq!(snapshot.total_ns, 600);
    assert_eq!(snapshot.min_ns, 100);
    assert_eq!(snapshot.max_ns, 500);
    assert_eq!(snapshot.avg_ns, 300);
    assert_eq!(snapshot.last_ns, 2_000);
}

#[test]
fn test_zero_latency_sample() {
    let stats = LatencyStats::new();
    stats.record(5, 0);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.samples, 1);
    assert_eq!(snapshot.min_ns, 0);
    assert_eq!(snapshot.histogram.buckets[0], 1);
}

#[test]
fn test_side_counters_do_not_touch_samples() {
    let stats = LatencyStats::new();
    stats.record_filtered();
    stats.record_missed();
    stats.record_missed();
    stats.record_unmatched();
    stats.record_arg_fault();
    stats.record_fault();

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.samples, 0);
    assert_eq!(snapshot.filtered, 1);
    assert_eq!(snapshot.missed, 2);
    assert_eq!(snapshot.unmatched, 1);
    assert_eq!(snapshot.arg_faults, 1);
    assert_eq!(snapshot.faults, 1);
}

#[test]
fn test_concurrent_record() {
    use std::sync::Arc;
    use std::thread;

    let stats = Arc::new(LatencyStats::new());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let stats = stats.clone();
            thread::spawn(move || {
                for i in 0..250u64 {
                    stats.record(i, t * 1_000 + i);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.samples, 1_000);
    assert_eq!(snapshot.min_ns, 0);
    assert_eq!(snapshot.max_ns, 3_249);
    assert_eq!(snapshot.histogram.total(), 1_000);
}

// =============================================================================
// Histogram Tests
// =============================================================================

#[test]
fn test_bucket_bounds_order() {
    assert_eq!(BUCKET_BOUNDS_NS.len(), NUM_BUCKETS);
    for w in BUCKET_BOUNDS_NS.windows(2) {
        assert!(w[0] < w[1]);
    }
}

#[test]
fn test_histogram_distribution() {
    let hist = LatencyHistogram::new();
    hist.record(500); // 0-1us
    hist.record(5_000); // 1-10us
    hist.record(50_000_000); // 10-100ms
    hist.record(5_000_000_000); // >1s

    let snapshot = hist.snapshot();
    assert_eq!(snapshot.buckets, [1, 1, 0, 0, 0, 1, 0, 1]);
    assert_eq!(snapshot.total(), 4);
    assert_eq!(snapshot.percentile_bound(100), u64::MAX);
}

#[test]
fn test_histogram_display() {
    let hist = LatencyHistogram::new();
    hist.record(2_000);
    hist.record(2_000);
    let text = format!("{}", hist.snapshot());
    assert!(text.contains("1-10us"));
    assert!(text.lines().nth(1).unwrap().contains('#'));
}
