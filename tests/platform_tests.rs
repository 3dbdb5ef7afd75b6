//! Integration tests for the simulated clock.
//!
//! This binary steps the clock to absolute values, so it keeps its tests
//! apart from the ones that only advance it.

use axprobe::platform::{self, set_mock_cpu_id, set_mock_time};
use axprobe::{CallFrame, InvocationContext, ProbeConfig, ProbeHarness, SoftHost, SymbolTable};

// =============================================================================
// Clock Tests
// =============================================================================

#[test]
fn test_clock_stepping_backwards_gives_zero_latency() {
    let table = SymbolTable::new().with_symbol("tick_widget", 0x1000);
    let harness = ProbeHarness::new(SoftHost::new(), table);
    let mut session = harness.attach(ProbeConfig::new("tick_widget")).unwrap();

    set_mock_time(5_000_000);
    let frame = CallFrame::new("ntpd", 123);
    harness.host().invoke("tick_widget", &frame, || set_mock_time(4_000_000));

    let stats = session.stats();
    assert_eq!(stats.samples, 1);
    assert_eq!(stats.max_ns, 0);
    assert_eq!(stats.last_ns, 4_000_000);
    assert_eq!(stats.histogram.buckets[0], 1);

    set_mock_time(4_000_000);
    harness.host().invoke("tick_widget", &frame, || set_mock_time(4_000_750));
    let stats = session.stats();
    assert_eq!(stats.samples, 2);
    assert_eq!(stats.max_ns, 750);
    assert_eq!(platform::time_ns(), 4_000_750);

    harness.disarm(&mut session);
}

#[test]
fn test_frame_without_cpu_reads_simulated_cpu() {
    set_mock_cpu_id(6);
    assert_eq!(CallFrame::new("kworker", 9).cpu(), 6);
    assert_eq!(CallFrame::new("kworker", 9).with_cpu(1).cpu(), 1);
    set_mock_cpu_id(0);
}
