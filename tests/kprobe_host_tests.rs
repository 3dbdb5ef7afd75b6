//! Integration tests for the kretprobe-backed host.
//!
//! Nothing here patches code: the tests cover invocation keying, register
//! access and the host's behavior for addresses it does not own.

#![cfg(feature = "kprobe")]

use axprobe::{
    CallingConvention, CurrentTask, InvocationContext, KprobeContext, KprobeHost, PtRegs,
    TaskComm, invocation_key,
};

/// Auxiliary ops for a host that never installs a probe.
#[derive(Clone, Copy, Debug)]
struct IdleOps;

impl kprobe::KprobeAuxiliaryOps for IdleOps {
    fn copy_memory(src: *const u8, dst: *mut u8, len: usize, _user_pid: Option<i32>) {
        unsafe { core::ptr::copy_nonoverlapping(src, dst, len) }
    }

    fn set_writeable_for_address<F: FnOnce(*mut u8)>(
        address: usize,
        _len: usize,
        _user_pid: Option<i32>,
        action: F,
    ) {
        action(address as *mut u8)
    }

    fn alloc_kernel_exec_memory() -> *mut u8 {
        core::ptr::null_mut()
    }

    fn free_kernel_exec_memory(_ptr: *mut u8) {}

    fn alloc_user_exec_memory<F: FnOnce(*mut u8)>(_pid: Option<i32>, _action: F) -> *mut u8 {
        core::ptr::null_mut()
    }

    fn free_user_exec_memory(_pid: Option<i32>, _ptr: *mut u8) {}

    fn insert_kretprobe_instance_to_task(_instance: kprobe::retprobe::RetprobeInstance) {}

    fn pop_kretprobe_instance_from_task() -> kprobe::retprobe::RetprobeInstance {
        unreachable!("no kretprobe is installed by these tests")
    }
}

fn zeroed_regs() -> PtRegs {
    // Plain register words; all-zero is a valid value.
    unsafe { core::mem::zeroed() }
}

fn task(pid: u32, comm: &str) -> CurrentTask {
    CurrentTask {
        pid,
        comm: TaskComm::new(comm),
    }
}

// =============================================================================
// Invocation Key Tests
// =============================================================================

#[test]
fn test_tasks_are_keyed_by_pid() {
    assert_eq!(invocation_key(42, 0), 42);
    assert_eq!(invocation_key(42, 3), 42);
    assert_eq!(invocation_key(u32::MAX, 1), u32::MAX as u64);
}

#[test]
fn test_idle_task_is_keyed_per_cpu() {
    assert_eq!(invocation_key(0, 0), 1 << 32);
    assert_eq!(invocation_key(0, 3), (1 << 32) | 3);
    assert_ne!(invocation_key(0, 0), invocation_key(0, 1));
    // Idle keys never collide with a real pid.
    assert!(invocation_key(0, 0) > u32::MAX as u64);
}

#[test]
fn test_context_reports_task_and_cpu() {
    let regs = zeroed_regs();
    let ctx = KprobeContext::new(&regs, task(0, "swapper/2"), 2);
    assert_eq!(ctx.invocation_id(), invocation_key(0, 2));
    assert_eq!(ctx.comm().as_str(), "swapper/2");
    assert_eq!(ctx.pid(), 0);
    assert_eq!(ctx.cpu(), 2);

    let ctx = KprobeContext::new(&regs, task(314, "vim"), 2);
    assert_eq!(ctx.invocation_id(), 314);
}

// =============================================================================
// Register Access Tests
// =============================================================================

#[cfg(target_arch = "x86_64")]
#[test]
fn test_arguments_and_return_value_come_from_pt_regs() {
    let mut regs = zeroed_regs();
    regs.rdi = 0x11 as _;
    regs.rsi = 0x22 as _;
    regs.rdx = 0x33 as _;
    regs.rax = 0x99 as _;
    let ctx = KprobeContext::new(&regs, task(7, "cat"), 0);

    let cc = CallingConvention::host().unwrap();
    assert_eq!(cc.arg(&ctx, 0), Some(0x11));
    assert_eq!(cc.arg(&ctx, 1), Some(0x22));
    assert_eq!(cc.arg(&ctx, 2), Some(0x33));
    assert_eq!(cc.ret(&ctx), Some(0x99));
}

#[cfg(target_arch = "aarch64")]
#[test]
fn test_arguments_and_return_value_come_from_pt_regs() {
    let mut regs = zeroed_regs();
    regs.regs[0] = 0x11 as _;
    regs.regs[1] = 0x22 as _;
    regs.regs[7] = 0x77 as _;
    let ctx = KprobeContext::new(&regs, task(7, "cat"), 0);

    let cc = CallingConvention::host().unwrap();
    assert_eq!(cc.arg(&ctx, 0), Some(0x11));
    assert_eq!(cc.arg(&ctx, 1), Some(0x22));
    assert_eq!(cc.arg(&ctx, 7), Some(0x77));
    // x0 carries the return value on exit.
    assert_eq!(cc.ret(&ctx), Some(0x11));
}

// =============================================================================
// Host Tests
// =============================================================================

#[test]
fn test_new_host_owns_no_address() {
    let host = KprobeHost::<IdleOps>::default();
    assert!(!host.is_registered(0xffff_0000_0010_0000));
}

#[test]
fn test_fault_at_unowned_address_is_not_handled() {
    let host = KprobeHost::<IdleOps>::new();
    let regs = zeroed_regs();
    assert!(!host.handle_fault(0xffff_0000_0010_0000, 14, &regs));
}
