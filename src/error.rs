//! Error taxonomy for probe registration and sampling.

use alloc::string::String;

use crate::host::HostError;

/// Result alias used across the harness.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported by the probe harness.
///
/// Registration errors are returned from [`ProbeHarness::arm`]; sampling
/// errors raised inside a callback are counted and dropped instead.
///
/// [`ProbeHarness::arm`]: crate::ProbeHarness::arm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No target function name was supplied.
    ConfigurationMissing,
    /// The target name did not resolve to a probeable function.
    TargetNotFound(String),
    /// The target is excluded from instrumentation.
    TargetBlacklisted(String),
    /// A non-faulting copy from foreign memory failed.
    ForeignMemoryAccessFailed {
        /// Source address of the failed copy.
        addr: u64,
    },
    /// The session (or another probe at the same address) is already armed.
    AlreadyArmed(String),
    /// A configuration parameter could not be parsed.
    InvalidParameter(String),
    /// The host rejected the probe descriptor.
    Registration {
        /// Target symbol.
        symbol: String,
        /// Host-reported reason.
        reason: HostError,
    },
}

impl Error {
    /// Whether the caller should abort its own startup on this error.
    ///
    /// Only foreign memory faults are recoverable: they cost one sample.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ForeignMemoryAccessFailed { .. })
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ConfigurationMissing => write!(f, "No target function name configured"),
            Self::TargetNotFound(name) => write!(f, "Probe target not found: {}", name),
            Self::TargetBlacklisted(name) => {
                write!(f, "Probe target is blacklisted: {}", name)
            }
            Self::ForeignMemoryAccessFailed { addr } => {
                write!(f, "Foreign memory access failed at {:#x}", addr)
            }
            Self::AlreadyArmed(name) => write!(f, "Probe already armed: {}", name),
            Self::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Self::Registration { symbol, reason } => {
                write!(f, "Probe registration for {} failed: {}", symbol, reason)
            }
        }
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn only_foreign_faults_are_recoverable() {
        assert!(!Error::ForeignMemoryAccessFailed { addr: 0x10 }.is_fatal());
        assert!(Error::ConfigurationMissing.is_fatal());
        assert!(Error::TargetBlacklisted("x".to_string()).is_fatal());
    }

    #[test]
    fn display_names_the_target() {
        let e = Error::TargetNotFound("alloc_widget".to_string());
        assert_eq!(e.to_string(), "Probe target not found: alloc_widget");
    }
}
