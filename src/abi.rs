//! Calling-convention strategy table.
//!
//! Maps "Nth integer argument" and "return value" to the register that
//! carries it on each supported instruction-set architecture. The table is
//! consulted through [`CallingConvention::host()`] once per session, so the
//! callback paths never branch on the target architecture.

use core::fmt;

use crate::context::InvocationContext;

/// Instruction-set architectures with a known argument-register mapping.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// System V AMD64 ABI.
    X86_64 = 0,
    /// AAPCS64.
    Aarch64 = 1,
    /// AAPCS (32-bit ARM).
    Arm = 2,
    /// RISC-V LP64 integer calling convention.
    Riscv64 = 3,
}

impl Arch {
    /// The architecture this crate was compiled for, if it has a mapping.
    pub const fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else if cfg!(target_arch = "arm") {
            Some(Arch::Arm)
        } else if cfg!(target_arch = "riscv64") {
            Some(Arch::Riscv64)
        } else {
            None
        }
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Arm => "arm",
            Arch::Riscv64 => "riscv64",
        }
    }
}

/// A general-purpose register that may carry an argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reg {
    Rax,
    Rdi,
    Rsi,
    Rdx,
    Rcx,
    R8,
    R9,
    /// AArch64 `xN`.
    X(u8),
    /// 32-bit ARM `rN`.
    R(u8),
    /// RISC-V `aN`.
    A(u8),
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Rax => f.write_str("rax"),
            Reg::Rdi => f.write_str("rdi"),
            Reg::Rsi => f.write_str("rsi"),
            Reg::Rdx => f.write_str("rdx"),
            Reg::Rcx => f.write_str("rcx"),
            Reg::R8 => f.write_str("r8"),
            Reg::R9 => f.write_str("r9"),
            Reg::X(n) => write!(f, "x{}", n),
            Reg::R(n) => write!(f, "r{}", n),
            Reg::A(n) => write!(f, "a{}", n),
        }
    }
}

/// Argument and return registers of one architecture, in ABI order.
#[derive(Debug)]
pub struct CallingConvention {
    pub arch: Arch,
    pub arg_regs: &'static [Reg],
    pub ret_reg: Reg,
}

const X86_64_ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

const AARCH64_ARGS: [Reg; 8] = [
    Reg::X(0),
    Reg::X(1),
    Reg::X(2),
    Reg::X(3),
    Reg::X(4),
    Reg::X(5),
    Reg::X(6),
    Reg::X(7),
];

const ARM_ARGS: [Reg; 4] = [Reg::R(0), Reg::R(1), Reg::R(2), Reg::R(3)];

const RISCV64_ARGS: [Reg; 8] = [
    Reg::A(0),
    Reg::A(1),
    Reg::A(2),
    Reg::A(3),
    Reg::A(4),
    Reg::A(5),
    Reg::A(6),
    Reg::A(7),
];

/// Indexed by `Arch as usize`.
static CONVENTIONS: [CallingConvention; 4] = [
    CallingConvention {
        arch: Arch::X86_64,
        arg_regs: &X86_64_ARGS,
        ret_reg: Reg::Rax,
    },
    CallingConvention {
        arch: Arch::Aarch64,
        arg_regs: &AARCH64_ARGS,
        ret_reg: Reg::X(0),
    },
    CallingConvention {
        arch: Arch::Arm,
        arg_regs: &ARM_ARGS,
        ret_reg: Reg::R(0),
    },
    CallingConvention {
        arch: Arch::Riscv64,
        arg_regs: &RISCV64_ARGS,
        ret_reg: Reg::A(0),
    },
];

/// Largest argument count across all supported conventions.
pub const MAX_REG_ARGS: usize = 8;

impl CallingConvention {
    /// Look up the convention for `arch`.
    pub fn for_arch(arch: Arch) -> &'static CallingConvention {
        &CONVENTIONS[arch as usize]
    }

    /// The convention of the compilation target, if supported.
    pub fn host() -> Option<&'static CallingConvention> {
        Arch::host().map(Self::for_arch)
    }

    /// Number of arguments passed in registers.
    pub fn max_args(&self) -> usize {
        self.arg_regs.len()
    }

    /// Register carrying the `n`th (zero-based) argument.
    pub fn arg_reg(&self, n: usize) -> Option<Reg> {
        self.arg_regs.get(n).copied()
    }

    /// Position of `reg` in the argument list.
    pub fn position(&self, reg: Reg) -> Option<usize> {
        self.arg_regs.iter().position(|r| *r == reg)
    }

    /// Read the `n`th argument from an invocation's register state.
    ///
    /// Returns `None` for arguments beyond the register-passed ones (those
    /// live on the stack) or if the context does not expose the register.
    pub fn arg(&self, ctx: &dyn InvocationContext, n: usize) -> Option<u64> {
        ctx.register(self.arg_reg(n)?)
    }

    /// Read the return value after the target has returned.
    pub fn ret(&self, ctx: &dyn InvocationContext) -> Option<u64> {
        ctx.register(self.ret_reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn table_is_indexed_by_arch() {
        for arch in [Arch::X86_64, Arch::Aarch64, Arch::Arm, Arch::Riscv64] {
            assert_eq!(CallingConvention::for_arch(arch).arch, arch);
        }
    }

    #[test]
    fn second_argument_register_per_arch() {
        // The pathname argument of do_sys_open() is argument 1.
        assert_eq!(CallingConvention::for_arch(Arch::X86_64).arg_reg(1), Some(Reg::Rsi));
        assert_eq!(CallingConvention::for_arch(Arch::Aarch64).arg_reg(1), Some(Reg::X(1)));
        assert_eq!(CallingConvention::for_arch(Arch::Arm).arg_reg(1), Some(Reg::R(1)));
        assert_eq!(CallingConvention::for_arch(Arch::Riscv64).arg_reg(1), Some(Reg::A(1)));
    }

    #[test]
    fn stack_arguments_are_not_mapped() {
        let arm = CallingConvention::for_arch(Arch::Arm);
        assert_eq!(arm.max_args(), 4);
        assert_eq!(arm.arg_reg(4), None);
        assert!(arm.max_args() <= MAX_REG_ARGS);
    }

    #[test]
    fn register_names() {
        assert_eq!(Reg::Rsi.to_string(), "rsi");
        assert_eq!(Reg::X(7).to_string(), "x7");
        assert_eq!(Reg::A(0).to_string(), "a0");
    }
}
