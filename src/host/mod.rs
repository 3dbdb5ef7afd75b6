//! Host registration interface.
//!
//! The harness never patches code itself. A [`ProbeHost`] installs the
//! entry/exit hooks and calls back into [`ProbeCallbacks`] whenever the
//! probed function runs:
//! - [`SoftHost`]: in-process dispatcher, for simulation and tests
//! - `kprobe::KprobeHost`: breakpoint-based kretprobes via the `kprobe`
//!   crate (feature `kprobe`)

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use crate::context::InvocationContext;

pub mod soft;

#[cfg(feature = "kprobe")]
pub mod kprobe;

pub use soft::{SoftHandle, SoftHost};

/// Callbacks the host invokes around each call of the probed function.
///
/// All three run in atomic context: they must not block, sleep or
/// allocate.
pub trait ProbeCallbacks: Send + Sync {
    /// Immediately before the target runs.
    fn pre(&self, ctx: &dyn InvocationContext);

    /// Immediately after the target returns.
    fn post(&self, ctx: &dyn InvocationContext);

    /// A fault was raised inside a callback or while single-stepping the
    /// probed instruction. Returns whether the fault was handled.
    fn fault(&self, ctx: &dyn InvocationContext, trapnr: u32) -> bool;
}

/// Everything a host needs to install one probe.
#[derive(Clone)]
pub struct ProbeDescriptor {
    /// Target symbol name.
    pub symbol: String,
    /// Resolved entry address.
    pub addr: usize,
    /// Maximum number of concurrently tracked invocations.
    pub max_active: usize,
    /// Opaque per-session context handed back on every hit.
    pub callbacks: Arc<dyn ProbeCallbacks>,
}

impl fmt::Debug for ProbeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeDescriptor")
            .field("symbol", &self.symbol)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("max_active", &self.max_active)
            .finish_non_exhaustive()
    }
}

/// Reasons a host refuses to register a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// A probe is already installed at this address.
    Duplicate,
    /// The host has no room for another probe.
    Exhausted,
    /// Any other host-specific refusal.
    Rejected(&'static str),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "probe already registered at this address"),
            Self::Exhausted => write!(f, "no probe slots left"),
            Self::Rejected(reason) => write!(f, "{}", reason),
        }
    }
}

impl core::error::Error for HostError {}

/// The host's probe registration API.
pub trait ProbeHost {
    /// Proof of one successful registration. Consumed by `unregister`, so a
    /// handle can be unregistered at most once.
    type Handle;

    /// Install the probe described by `desc`.
    fn register(&self, desc: ProbeDescriptor) -> Result<Self::Handle, HostError>;

    /// Remove a probe. When this returns, the host starts no new callback
    /// for it; callbacks already running may still be finishing.
    fn unregister(&self, handle: Self::Handle);
}

impl<H: ProbeHost + ?Sized> ProbeHost for Arc<H> {
    type Handle = H::Handle;

    fn register(&self, desc: ProbeDescriptor) -> Result<Self::Handle, HostError> {
        (**self).register(desc)
    }

    fn unregister(&self, handle: Self::Handle) {
        (**self).unregister(handle)
    }
}

impl<H: ProbeHost + ?Sized> ProbeHost for &H {
    type Handle = H::Handle;

    fn register(&self, desc: ProbeDescriptor) -> Result<Self::Handle, HostError> {
        (**self).register(desc)
    }

    fn unregister(&self, handle: Self::Handle) {
        (**self).unregister(handle)
    }
}
