//! Probe sessions.
//!
//! A [`ProbeSession`] is one instrumentation point on one target
//! function. Its callback state lives in an [`Arc<ProbeCore>`] that the
//! host holds for as long as the probe is installed; the session keeps
//! the host's registration handle.
//!
//! Entry timestamps are stored per invocation in a preallocated slot
//! table keyed by invocation identity, so concurrent calls of the target
//! never mix each other's start times. The table's spin lock is held only
//! while a slot is claimed or released.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

use crate::abi::CallingConvention;
use crate::config::{ArgFetch, ArgKind, ProbeConfig};
use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::filter::ContextFilter;
use crate::host::ProbeCallbacks;
use crate::output::{self, Delta, RateLimit};
use crate::platform;
use crate::stats::{LatencySnapshot, LatencyStats};
use crate::uaccess::{FETCH_STR_MAX, ForeignMemory};

/// Registration state of a session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not installed in any host.
    Unregistered = 0,
    /// Installed; callbacks sample.
    Armed = 1,
    /// Being torn down; callbacks return immediately.
    Disarming = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Armed,
            2 => Self::Disarming,
            _ => Self::Unregistered,
        }
    }
}

/// The function a session instruments.
#[derive(Debug)]
pub struct ProbeTarget {
    name: String,
    /// Entry address, 0 until resolved.
    addr: AtomicUsize,
    filter: Option<ContextFilter>,
}

impl ProbeTarget {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved entry address, if the session has been armed.
    pub fn addr(&self) -> Option<usize> {
        match self.addr.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn filter(&self) -> Option<&ContextFilter> {
        self.filter.as_ref()
    }
}

/// What the entry callback left for an invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Entry {
    /// Entry timestamp in nanoseconds.
    Timed(u64),
    /// Entered, but the sample was abandoned in `pre`.
    #[default]
    Skipped,
}

#[derive(Debug, Clone, Copy, Default)]
struct InvocationSlot {
    live: bool,
    key: u64,
    entry: Entry,
    seq: u64,
}

/// Fixed-capacity table of in-progress invocations.
#[derive(Debug)]
pub(crate) struct InvocationTable {
    slots: Vec<InvocationSlot>,
    next_seq: u64,
}

impl InvocationTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize(capacity, InvocationSlot::default());
        Self { slots, next_seq: 0 }
    }

    /// Claim a slot for invocation `key`. Returns `false` when full.
    pub(crate) fn begin(&mut self, key: u64, entry: Entry) -> bool {
        let seq = self.next_seq;
        let Some(slot) = self.slots.iter_mut().find(|s| !s.live) else {
            return false;
        };
        *slot = InvocationSlot {
            live: true,
            key,
            entry,
            seq,
        };
        self.next_seq = seq.wrapping_add(1);
        true
    }

    /// Release the newest slot of invocation `key`. Newest-first pairs
    /// nested calls of a recursive target.
    pub(crate) fn finish(&mut self, key: u64) -> Option<Entry> {
        let slot = self
            .slots
            .iter_mut()
            .filter(|s| s.live && s.key == key)
            .max_by_key(|s| s.seq)?;
        slot.live = false;
        Some(slot.entry)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    /// Drop every outstanding slot, returning how many there were.
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.outstanding();
        for slot in &mut self.slots {
            slot.live = false;
        }
        n
    }
}

/// Decrements the in-flight counter when a callback returns.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Callback-side state of a session, shared with the host.
pub struct ProbeCore {
    target: ProbeTarget,
    verbose: bool,
    fetch: Option<ArgFetch>,
    max_active: usize,
    convention: Option<&'static CallingConvention>,
    memory: Option<Arc<dyn ForeignMemory>>,
    state: AtomicU8,
    in_flight: AtomicUsize,
    invocations: Mutex<InvocationTable>,
    stats: LatencyStats,
    verbose_limit: RateLimit,
}

impl fmt::Debug for ProbeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeCore")
            .field("target", &self.target)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ProbeCore {
    fn new(config: ProbeConfig, memory: Option<Arc<dyn ForeignMemory>>) -> Self {
        let max_active = config.max_active.max(1);
        Self {
            target: ProbeTarget {
                name: config.target,
                addr: AtomicUsize::new(0),
                filter: config.filter,
            },
            verbose: config.verbose,
            fetch: config.fetch,
            max_active,
            convention: CallingConvention::host(),
            memory,
            state: AtomicU8::new(SessionState::Unregistered as u8),
            in_flight: AtomicUsize::new(0),
            invocations: Mutex::new(InvocationTable::with_capacity(max_active)),
            stats: LatencyStats::new(),
            verbose_limit: RateLimit::default(),
        }
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_addr(&self, addr: usize) {
        self.target.addr.store(addr, Ordering::Release);
    }

    pub(crate) fn max_active(&self) -> usize {
        self.max_active
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn stats(&self) -> LatencySnapshot {
        self.stats.snapshot()
    }

    /// Number of invocations between pre and post right now.
    pub fn outstanding(&self) -> usize {
        self.invocations.lock().outstanding()
    }

    /// Enter a callback. `None` unless the session is armed.
    ///
    /// The counter is raised before the state is checked, so a teardown
    /// that publishes `Disarming` and then waits for the counter to drain
    /// cannot miss a callback that saw `Armed`.
    fn enter(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        (self.state() == SessionState::Armed).then_some(guard)
    }

    /// Spin until no callback is running.
    pub(crate) fn wait_quiescent(&self) {
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
    }

    /// Drop outstanding invocation slots; returns how many were dropped.
    pub(crate) fn drop_outstanding(&self) -> usize {
        self.invocations.lock().clear()
    }

    fn passes_filter(&self, ctx: &dyn InvocationContext) -> bool {
        self.target.filter.as_ref().is_none_or(|f| f.matches(ctx))
    }

    fn log_verbose(&self, tag: &str, ctx: &dyn InvocationContext) {
        if self.verbose && self.verbose_limit.allow() {
            output::log_context(tag, self.target.name(), ctx);
        }
    }

    /// Extract the configured argument and log it.
    fn fetch_arg(&self, fetch: ArgFetch, ctx: &dyn InvocationContext) -> Result<()> {
        let name = self.target.name();
        let Some((reg, value)) = self
            .convention
            .and_then(|c| Some((c.arg_reg(fetch.index)?, c.arg(ctx, fetch.index)?)))
        else {
            debug!("axprobe: '{}' arg{} not passed in a register", name, fetch.index);
            return Ok(());
        };

        match fetch.kind {
            ArgKind::Value => {
                info!("axprobe: '{}' arg{} ({}) = {:#x}", name, fetch.index, reg, value);
            }
            ArgKind::Str => {
                let memory = self
                    .memory
                    .as_ref()
                    .ok_or(Error::ForeignMemoryAccessFailed { addr: value })?;
                let mut buf = [0u8; FETCH_STR_MAX];
                let len = memory
                    .strncpy_nofault(value, &mut buf)
                    .map_err(|_| Error::ForeignMemoryAccessFailed { addr: value })?;
                let text = match core::str::from_utf8(&buf[..len]) {
                    Ok(s) => s,
                    Err(e) => core::str::from_utf8(&buf[..e.valid_up_to()]).unwrap_or(""),
                };
                info!(
                    "axprobe: '{}' arg{} ({}) @ {:#x}: \"{}\"",
                    name, fetch.index, reg, value, text
                );
            }
        }
        Ok(())
    }
}

impl ProbeCallbacks for ProbeCore {
    fn pre(&self, ctx: &dyn InvocationContext) {
        let Some(_guard) = self.enter() else {
            return;
        };
        if !self.passes_filter(ctx) {
            self.stats.record_filtered();
            return;
        }

        self.log_verbose("pre", ctx);

        let fetched = match self.fetch {
            Some(fetch) => self.fetch_arg(fetch, ctx),
            None => Ok(()),
        };
        if let Err(e) = &fetched {
            self.stats.record_arg_fault();
            debug!("axprobe: '{}' sample skipped: {}", self.target.name(), e);
        }

        // A skipped entry still takes a slot so the exit pairs with it.
        let claimed = {
            let mut table = self.invocations.lock();
            let entry = match fetched {
                Ok(()) => Entry::Timed(platform::time_ns()),
                Err(_) => Entry::Skipped,
            };
            table.begin(ctx.invocation_id(), entry)
        };
        if !claimed {
            self.stats.record_missed();
            trace!(
                "axprobe: '{}' maxactive {} reached, invocation {} not tracked",
                self.target.name(),
                self.max_active,
                ctx.invocation_id()
            );
        }
    }

    fn post(&self, ctx: &dyn InvocationContext) {
        let Some(_guard) = self.enter() else {
            return;
        };

        // The slot is released before the filter runs: the entry decision
        // stands even if the task changed its comm inside the target.
        let (end, entry) = {
            let mut table = self.invocations.lock();
            let end = platform::time_ns();
            (end, table.finish(ctx.invocation_id()))
        };
        let start = match entry {
            Some(Entry::Timed(start)) => start,
            Some(Entry::Skipped) => return,
            None => {
                if self.passes_filter(ctx) {
                    self.stats.record_unmatched();
                    trace!(
                        "axprobe: '{}' invocation {} returned without a tracked entry",
                        self.target.name(),
                        ctx.invocation_id()
                    );
                }
                return;
            }
        };

        let elapsed = end.saturating_sub(start);
        self.stats.record(end, elapsed);
        info!("axprobe: '{}' latency: {}", self.target.name(), Delta(elapsed));

        self.log_verbose("post", ctx);
        if self.verbose {
            if let Some(ret) = self.convention.and_then(|c| c.ret(ctx)) {
                debug!("axprobe: '{}' returned {:#x}", self.target.name(), ret);
            }
        }
    }

    fn fault(&self, ctx: &dyn InvocationContext, trapnr: u32) -> bool {
        self.stats.record_fault();
        warn!(
            "axprobe: fault in probe '{}' @ {:#x}: trap #{} (task {} pid {})",
            self.target.name(),
            self.target.addr().unwrap_or(0),
            trapnr,
            ctx.comm(),
            ctx.pid()
        );
        // Never handled: recovering here would mask the real bug.
        false
    }
}

/// One probe on one target function.
///
/// `K` is the host's registration handle type. A session starts
/// unregistered; [`ProbeHarness::arm`] installs it and
/// [`ProbeHarness::disarm`] removes it.
///
/// [`ProbeHarness::arm`]: crate::ProbeHarness::arm
/// [`ProbeHarness::disarm`]: crate::ProbeHarness::disarm
pub struct ProbeSession<K> {
    pub(crate) core: Arc<ProbeCore>,
    pub(crate) handle: Option<K>,
}

impl<K> ProbeSession<K> {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            core: Arc::new(ProbeCore::new(config, None)),
            handle: None,
        }
    }

    /// A session whose string argument fetches read through `memory`.
    pub fn with_memory(config: ProbeConfig, memory: Arc<dyn ForeignMemory>) -> Self {
        Self {
            core: Arc::new(ProbeCore::new(config, Some(memory))),
            handle: None,
        }
    }

    pub fn target(&self) -> &ProbeTarget {
        self.core.target()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&K> {
        self.handle.as_ref()
    }

    pub fn stats(&self) -> LatencySnapshot {
        self.core.stats()
    }

    /// The callbacks as handed to the host.
    pub fn callbacks(&self) -> Arc<dyn ProbeCallbacks> {
        self.core.clone()
    }

    /// Run the entry callback for one invocation.
    pub fn pre_callback(&self, ctx: &dyn InvocationContext) {
        self.core.pre(ctx);
    }

    /// Run the exit callback for one invocation.
    pub fn post_callback(&self, ctx: &dyn InvocationContext) {
        self.core.post(ctx);
    }

    /// Run the fault callback. Always returns `false`.
    pub fn fault_callback(&self, ctx: &dyn InvocationContext, trapnr: u32) -> bool {
        self.core.fault(ctx, trapnr)
    }
}

impl<K> fmt::Debug for ProbeSession<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeSession")
            .field("core", &self.core)
            .field("armed", &self.handle.is_some())
            .finish()
    }
}

impl<K> Drop for ProbeSession<K> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(
                "axprobe: session for '{}' dropped while armed; the host keeps its callbacks",
                self.core.target.name()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallFrame;

    type Session = ProbeSession<()>;

    fn armed(config: ProbeConfig) -> Session {
        let s = Session::new(config);
        s.core.set_state(SessionState::Armed);
        s
    }

    #[test]
    fn table_matches_by_key() {
        let mut t = InvocationTable::with_capacity(4);
        assert!(t.begin(1, Entry::Timed(100)));
        assert!(t.begin(2, Entry::Timed(200)));
        assert_eq!(t.finish(2), Some(Entry::Timed(200)));
        assert_eq!(t.finish(1), Some(Entry::Timed(100)));
        assert_eq!(t.finish(1), None);
    }

    #[test]
    fn table_pairs_nested_calls_lifo() {
        let mut t = InvocationTable::with_capacity(4);
        t.begin(7, Entry::Timed(10));
        t.begin(7, Entry::Skipped);
        assert_eq!(t.finish(7), Some(Entry::Skipped));
        assert_eq!(t.finish(7), Some(Entry::Timed(10)));
    }

    #[test]
    fn table_full_and_clear() {
        let mut t = InvocationTable::with_capacity(2);
        assert!(t.begin(1, Entry::Timed(0)));
        assert!(t.begin(2, Entry::Skipped));
        assert!(!t.begin(3, Entry::Timed(0)));
        assert_eq!(t.outstanding(), 2);
        assert_eq!(t.clear(), 2);
        assert_eq!(t.outstanding(), 0);
    }

    #[test]
    fn unarmed_session_ignores_callbacks() {
        let s = Session::new(ProbeConfig::new("f"));
        let frame = CallFrame::new("t", 1);
        s.pre_callback(&frame);
        s.post_callback(&frame);
        assert_eq!(s.stats().samples, 0);
        assert_eq!(s.core.outstanding(), 0);
        assert_eq!(s.core.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pre_then_post_records_one_sample() {
        let s = armed(ProbeConfig::new("f"));
        let frame = CallFrame::new("t", 1);
        s.pre_callback(&frame);
        assert_eq!(s.core.outstanding(), 1);
        platform::advance_mock_time(250);
        s.post_callback(&frame);

        let stats = s.stats();
        assert_eq!(stats.samples, 1);
        assert!(stats.min_ns >= 250);
        assert_eq!(s.core.outstanding(), 0);
    }

    #[test]
    fn overflow_counts_missed_and_unmatched() {
        let s = armed(ProbeConfig::new("f").max_active(1));
        let a = CallFrame::new("t", 1);
        let b = CallFrame::new("t", 2);
        s.pre_callback(&a);
        s.pre_callback(&b);
        s.post_callback(&b);
        s.post_callback(&a);

        let stats = s.stats();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.missed, 1);
        assert_eq!(stats.unmatched, 1);
    }

    #[test]
    fn filtered_invocations_are_counted_not_sampled() {
        let s = armed(ProbeConfig::new("f").filter(ContextFilter::comm_prefix("vi")));
        let frame = CallFrame::new("bash", 1);
        s.pre_callback(&frame);
        s.post_callback(&frame);

        let stats = s.stats();
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.unmatched, 0);
    }

    #[test]
    fn comm_change_inside_target_still_releases_slot() {
        let config = ProbeConfig::new("f")
            .filter(ContextFilter::comm_prefix("vi"))
            .max_active(4);
        let s = armed(config);
        for id in 0..4 {
            s.pre_callback(&CallFrame::new("vi", 10).with_id(id));
            s.post_callback(&CallFrame::new("bash", 10).with_id(id));
        }
        assert_eq!(s.core.outstanding(), 0);

        let vim = CallFrame::new("vim", 11);
        s.pre_callback(&vim);
        s.post_callback(&vim);

        let stats = s.stats();
        assert_eq!(stats.samples, 5);
        assert_eq!(stats.missed, 0);
        assert_eq!(stats.unmatched, 0);
        assert_eq!(stats.filtered, 0);
    }

    #[test]
    fn filtered_entry_with_matching_exit_is_unmatched() {
        let s = armed(ProbeConfig::new("f").filter(ContextFilter::comm_prefix("vi")));
        s.pre_callback(&CallFrame::new("bash", 1).with_id(3));
        s.post_callback(&CallFrame::new("vim", 1).with_id(3));

        let stats = s.stats();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.unmatched, 1);
    }

    #[test]
    fn string_fetch_without_memory_skips_sample() {
        let s = armed(ProbeConfig::new("f").fetch_arg(0, ArgKind::Str));
        let frame = CallFrame::new("t", 1).with_args(&[0xdead_0000]);
        s.pre_callback(&frame);
        if CallingConvention::host().is_some() {
            assert_eq!(s.core.outstanding(), 1);
        }
        s.post_callback(&frame);

        let stats = s.stats();
        assert_eq!(s.core.outstanding(), 0);
        assert_eq!(stats.unmatched, 0);
        if CallingConvention::host().is_some() {
            assert_eq!(stats.arg_faults, 1);
            assert_eq!(stats.samples, 0);
        }
    }

    #[test]
    fn fault_is_never_handled() {
        let s = armed(ProbeConfig::new("f"));
        let frame = CallFrame::new("t", 1);
        assert!(!s.fault_callback(&frame, 14));
        assert_eq!(s.stats().faults, 1);
    }
}
