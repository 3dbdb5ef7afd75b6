//! Clock and CPU id as seen by probe callbacks.
//!
//! Kernel builds with `axhal` read the hardware monotonic clock. Every
//! other build (and every test build) runs on a simulated clock that only
//! moves when a test moves it, so latencies in tests are exact.

/// Time and CPU queries made from inside a probe callback.
///
/// Implementations must not sleep or take locks: callbacks run with the
/// probed function's context, often with interrupts off.
pub trait PlatformOps {
    /// Monotonic nanoseconds since an arbitrary epoch.
    fn time_ns() -> u64;

    /// Index of the executing CPU.
    fn cpu_id() -> u32;
}

#[cfg(all(not(test), feature = "axhal"))]
mod kernel {
    use super::PlatformOps;

    /// Hardware clock and per-CPU id from `axhal`.
    pub struct KernelPlatform;

    impl PlatformOps for KernelPlatform {
        fn time_ns() -> u64 {
            axhal::time::monotonic_time().as_nanos() as u64
        }

        fn cpu_id() -> u32 {
            axhal::percpu::this_cpu_id() as u32
        }
    }
}

mod sim {
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use super::PlatformOps;

    // Starts at 1s so a zero timestamp never looks like a real reading.
    static NOW_NS: AtomicU64 = AtomicU64::new(1_000_000_000);
    static CPU: AtomicU32 = AtomicU32::new(0);

    /// Simulated clock and CPU.
    pub struct SimPlatform;

    impl PlatformOps for SimPlatform {
        fn time_ns() -> u64 {
            NOW_NS.load(Ordering::SeqCst)
        }

        fn cpu_id() -> u32 {
            CPU.load(Ordering::Relaxed)
        }
    }

    /// Step the simulated clock to `ns`. It may move backwards; samples
    /// that straddle the step come out as zero-length.
    pub fn set_mock_time(ns: u64) {
        NOW_NS.store(ns, Ordering::SeqCst);
    }

    pub fn advance_mock_time(ns: u64) {
        NOW_NS.fetch_add(ns, Ordering::SeqCst);
    }

    /// Choose the CPU id the simulated platform reports.
    pub fn set_mock_cpu_id(id: u32) {
        CPU.store(id, Ordering::Relaxed);
    }
}

#[cfg(all(not(test), feature = "axhal"))]
pub use kernel::KernelPlatform;
pub use sim::{SimPlatform, advance_mock_time, set_mock_cpu_id, set_mock_time};

#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = KernelPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = SimPlatform;

#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

#[inline]
pub fn cpu_id() -> u32 {
    Platform::cpu_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_clock_forward() {
        // The clock is shared with every other unit test in this binary.
        let before = time_ns();
        advance_mock_time(1000);
        assert!(time_ns() >= before + 1000);
    }

    #[test]
    fn cpu_id_follows_simulation() {
        set_mock_cpu_id(3);
        assert_eq!(cpu_id(), 3);
        set_mock_cpu_id(0);
        assert_eq!(cpu_id(), 0);
    }
}
