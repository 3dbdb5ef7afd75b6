//! Non-suspending access to foreign (caller-space) memory.
//!
//! Probe callbacks run in atomic context, so pointer arguments that
//! reference caller memory must be copied with primitives that fail
//! instead of faulting pages in. A failed copy is reported, never retried.

use alloc::vec::Vec;

use axerrno::AxResult;

/// Longest string copied out of foreign memory by an argument fetch,
/// including the terminating NUL.
pub const FETCH_STR_MAX: usize = 256;

/// Non-faulting copy primitives provided by the embedding environment.
pub trait ForeignMemory: Send + Sync {
    /// Copy `dst.len()` bytes starting at foreign address `src`.
    ///
    /// Must not sleep and must not take page faults; an inaccessible range
    /// is an error.
    fn copy_nofault(&self, src: u64, dst: &mut [u8]) -> AxResult;

    /// Copy a NUL-terminated string starting at `src` into `dst`.
    ///
    /// Returns the string length without the NUL. A string longer than
    /// `dst` is truncated to `dst.len() - 1` bytes and terminated.
    fn strncpy_nofault(&self, src: u64, dst: &mut [u8]) -> AxResult<usize> {
        let Some(limit) = dst.len().checked_sub(1) else {
            return Ok(0);
        };
        // Byte-wise so a string ending just before an unmapped page is
        // still copied.
        for i in 0..limit {
            let mut byte = [0u8; 1];
            self.copy_nofault(src.wrapping_add(i as u64), &mut byte)?;
            dst[i] = byte[0];
            if byte[0] == 0 {
                return Ok(i);
            }
        }
        dst[limit] = 0;
        Ok(limit)
    }
}

/// A contiguous window of foreign memory backed by a local buffer.
///
/// Used to simulate caller address spaces when driving probes through
/// [`SoftHost`](crate::host::SoftHost).
#[derive(Debug, Clone, Default)]
pub struct MemoryWindow {
    base: u64,
    bytes: Vec<u8>,
}

impl MemoryWindow {
    pub fn new(base: u64, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl ForeignMemory for MemoryWindow {
    fn copy_nofault(&self, src: u64, dst: &mut [u8]) -> AxResult {
        let Some(offset) = src.checked_sub(self.base) else {
            return axerrno::ax_err!(BadAddress, "foreign read below window");
        };
        let start = offset as usize;
        let end = start.checked_add(dst.len());
        match end {
            Some(end) if offset <= usize::MAX as u64 && end <= self.bytes.len() => {
                dst.copy_from_slice(&self.bytes[start..end]);
                Ok(())
            }
            _ => axerrno::ax_err!(BadAddress, "foreign read outside window"),
        }
    }
}
