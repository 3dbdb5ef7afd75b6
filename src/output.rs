//! Probe log output.
//!
//! Formats the per-invocation context line and latency deltas, and rate
//! limits verbose output. Everything here formats through `log` without
//! allocating, so it may be called from probe callbacks.

use core::fmt;

use spin::Mutex;

use crate::context::InvocationContext;
use crate::platform;

/// Default rate-limit window: 5 seconds.
pub const DEFAULT_RATELIMIT_INTERVAL_NS: u64 = 5_000_000_000;

/// Default number of messages allowed per window.
pub const DEFAULT_RATELIMIT_BURST: u32 = 10;

/// A duration rendered as `N ns (= U us = M ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta(pub u64);

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ns (= {} us = {} ms)",
            self.0,
            self.0 / 1_000,
            self.0 / 1_000_000
        )
    }
}

/// Log one line describing who made the call:
/// `003) vi              :1234   | ...1  /* pre alloc_widget */`
pub fn log_context(tag: &str, symbol: &str, ctx: &dyn InvocationContext) {
    debug!(
        "{:03}) {:<16}:{:<6} | {}  /* {} {} */",
        ctx.cpu(),
        ctx.comm(),
        ctx.pid(),
        ctx.flags(),
        tag,
        symbol
    );
}

#[derive(Debug)]
struct RateState {
    begin_ns: Option<u64>,
    printed: u32,
    missed: u32,
}

/// Message rate limiter: at most `burst` messages per `interval_ns`.
///
/// Never spins: a caller that finds the limiter busy is suppressed.
#[derive(Debug)]
pub struct RateLimit {
    interval_ns: u64,
    burst: u32,
    state: Mutex<RateState>,
}

impl RateLimit {
    /// A limiter allowing `burst` messages per `interval_ns`; an interval
    /// of 0 disables limiting.
    pub const fn new(interval_ns: u64, burst: u32) -> Self {
        Self {
            interval_ns,
            burst,
            state: Mutex::new(RateState {
                begin_ns: None,
                printed: 0,
                missed: 0,
            }),
        }
    }

    /// Whether the next message may be emitted.
    pub fn allow(&self) -> bool {
        if self.interval_ns == 0 {
            return true;
        }
        let Some(mut st) = self.state.try_lock() else {
            return false;
        };

        let now = platform::time_ns();
        let begin = *st.begin_ns.get_or_insert(now);
        if now.saturating_sub(begin) >= self.interval_ns {
            if st.missed > 0 {
                warn!("axprobe: {} callbacks suppressed", st.missed);
            }
            st.begin_ns = Some(now);
            st.printed = 0;
            st.missed = 0;
        }

        if st.printed < self.burst {
            st.printed += 1;
            true
        } else {
            st.missed += 1;
            false
        }
    }

    /// Messages suppressed in the current window.
    pub fn suppressed(&self) -> u32 {
        self.state.lock().missed
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(DEFAULT_RATELIMIT_INTERVAL_NS, DEFAULT_RATELIMIT_BURST)
    }
}
