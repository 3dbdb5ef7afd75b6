//! Dynamic function-probe harness
//!
//! Attaches entry and exit probes to a function named at configuration
//! time and measures the wall-clock latency of every call, optionally
//! filtered by calling task and with one argument extracted per call.
//!
//! # Features
//!
//! - `symbols` - Resolve targets through the kernel symbol table (`ksym`)
//! - `kprobe` - Breakpoint-based host built on the `kprobe` crate
//! - `axhal` - Real clock and CPU id; a mock platform is used otherwise
//!
//! # Quick Start
//!
//! ```ignore
//! use axprobe::{ProbeConfig, ProbeHarness, SoftHost, SymbolTable};
//!
//! let symbols = SymbolTable::new().with_symbol("alloc_widget", 0x1000);
//! let harness = ProbeHarness::new(SoftHost::new(), symbols);
//!
//! let config = ProbeConfig::from_params("kprobe_func=alloc_widget verbose=1")?;
//! let mut session = harness.attach(config)?;
//!
//! // ... every call of alloc_widget is now timed ...
//!
//! harness.disarm(&mut session);
//! println!("{} samples", session.stats().samples);
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

// =============================================================================
// Probe Harness
// =============================================================================

pub mod abi;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod harness;
pub mod host;
pub mod output;
pub mod session;
pub mod stats;
pub mod symbols;
pub mod uaccess;

// Re-export key types for convenience
pub use abi::{Arch, CallingConvention, Reg};
pub use config::{ArgFetch, ArgKind, ProbeConfig};
pub use context::{CallFrame, ContextFlags, InvocationContext, TaskComm};
pub use error::{Error, Result};
pub use filter::ContextFilter;
pub use harness::ProbeHarness;
pub use host::{HostError, ProbeCallbacks, ProbeDescriptor, ProbeHost, SoftHandle, SoftHost};
pub use session::{ProbeSession, ProbeTarget, SessionState};
pub use stats::{HistogramSnapshot, LatencySnapshot};
pub use symbols::{Blacklist, Resolution, SymbolResolver, SymbolTable};
pub use uaccess::{ForeignMemory, MemoryWindow};

#[cfg(feature = "kprobe")]
pub use host::kprobe::{
    CurrentTask, KprobeContext, KprobeHandle, KprobeHost, invocation_key,
    register_current_task_hook,
};

#[cfg(feature = "kprobe")]
pub use kprobe::PtRegs;

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the probe harness.
///
/// Call once during boot, after the memory allocator is ready. Does not
/// load the symbol table; use `init_with_symbols()` to resolve targets
/// through kallsyms.
pub fn init() {
    info!("Initializing axprobe...");

    match CallingConvention::host() {
        Some(cc) => info!("  - {} argument registers: {:?}", cc.arch.label(), cc.arg_regs),
        None => warn!("  - no calling convention for this architecture, argument fetch disabled"),
    }

    #[cfg(feature = "symbols")]
    info!("  - symbols module enabled (call init_with_symbols to resolve targets)");

    #[cfg(feature = "kprobe")]
    info!("  - kprobe host enabled");

    info!("axprobe initialization complete");
}

/// Initialize the probe harness with symbol table support.
///
/// # Arguments
/// * `kallsyms_data` - The kallsyms.bin binary blob (static lifetime required)
/// * `stext` - Start address of kernel text section (_stext)
/// * `etext` - End address of kernel text section (_etext)
///
/// # Example
/// ```ignore
/// extern "C" {
///     static _stext: u8;
///     static _etext: u8;
/// }
/// let stext = unsafe { &_stext as *const u8 as u64 };
/// let etext = unsafe { &_etext as *const u8 as u64 };
/// axprobe::init_with_symbols(include_bytes!("../../kallsyms.bin"), stext, etext)?;
/// ```
#[cfg(feature = "symbols")]
pub fn init_with_symbols(
    kallsyms_data: &'static [u8],
    stext: u64,
    etext: u64,
) -> core::result::Result<(), symbols::Error> {
    init();

    // The ksym library expects the blob to be page-aligned in memory.
    let ptr = kallsyms_data.as_ptr() as usize;
    if ptr % 4096 != 0 {
        warn!("  - kallsyms data is not page-aligned (ptr % 4096 = {})", ptr % 4096);
    }

    symbols::init(kallsyms_data, stext, etext).inspect_err(|e| {
        error!("  - failed to load symbol table: {}", e);
    })
}
