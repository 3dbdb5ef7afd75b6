//! Breakpoint-based host on top of the `kprobe` crate.
//!
//! Each session becomes one kretprobe: the entry handler runs the
//! session's pre callback and the return handler its post callback. The
//! embedding kernel supplies the [`kprobe::KprobeAuxiliaryOps`] glue, a
//! current-task hook, and forwards its breakpoint/debug exceptions to
//! [`KprobeHost::handle_breakpoint`].

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use spin::{Mutex, Once};

use super::{HostError, ProbeCallbacks, ProbeDescriptor, ProbeHost};
use crate::abi::Reg;
use crate::context::{InvocationContext, TaskComm};
use crate::platform;

/// Lock type alias for the kprobe library
type LockType = spin::Mutex<()>;

/// The task running when a probe fires.
#[derive(Debug, Clone, Copy)]
pub struct CurrentTask {
    pub pid: u32,
    pub comm: TaskComm,
}

static CURRENT_TASK: Once<fn() -> CurrentTask> = Once::new();

/// Install the hook that reports the current task. Only the first call
/// takes effect.
pub fn register_current_task_hook(hook: fn() -> CurrentTask) {
    CURRENT_TASK.call_once(|| hook);
}

fn current_task() -> CurrentTask {
    match CURRENT_TASK.get() {
        Some(hook) => hook(),
        None => CurrentTask {
            pid: 0,
            comm: TaskComm::new("swapper"),
        },
    }
}

/// Invocation key of a hit taken by task `pid` on `cpu`.
///
/// Tasks are keyed by pid. The idle task (pid 0) runs once per CPU, so it
/// gets one key per CPU, above the pid range.
pub fn invocation_key(pid: u32, cpu: u32) -> u64 {
    match pid {
        0 => (1 << 32) | cpu as u64,
        pid => pid as u64,
    }
}

/// Register view of one breakpoint hit.
pub struct KprobeContext<'a> {
    regs: &'a kprobe::PtRegs,
    task: CurrentTask,
    cpu: u32,
}

impl<'a> KprobeContext<'a> {
    pub fn new(regs: &'a kprobe::PtRegs, task: CurrentTask, cpu: u32) -> Self {
        Self { regs, task, cpu }
    }

    /// Context of the task running on this CPU.
    fn current(regs: &'a kprobe::PtRegs) -> Self {
        Self::new(regs, current_task(), platform::cpu_id())
    }
}

impl InvocationContext for KprobeContext<'_> {
    fn invocation_id(&self) -> u64 {
        invocation_key(self.task.pid, self.cpu)
    }

    fn comm(&self) -> &TaskComm {
        &self.task.comm
    }

    fn pid(&self) -> u32 {
        self.task.pid
    }

    fn cpu(&self) -> u32 {
        self.cpu
    }

    fn register(&self, reg: Reg) -> Option<u64> {
        read_reg(self.regs, reg)
    }
}

#[cfg(target_arch = "aarch64")]
fn read_reg(regs: &kprobe::PtRegs, reg: Reg) -> Option<u64> {
    match reg {
        Reg::X(n) if (n as usize) < regs.regs.len() => Some(regs.regs[n as usize]),
        _ => None,
    }
}

#[cfg(target_arch = "x86_64")]
fn read_reg(regs: &kprobe::PtRegs, reg: Reg) -> Option<u64> {
    let value = match reg {
        Reg::Rax => regs.rax,
        Reg::Rdi => regs.rdi,
        Reg::Rsi => regs.rsi,
        Reg::Rdx => regs.rdx,
        Reg::Rcx => regs.rcx,
        Reg::R8 => regs.r8,
        Reg::R9 => regs.r9,
        _ => return None,
    };
    Some(value as u64)
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
fn read_reg(_regs: &kprobe::PtRegs, _reg: Reg) -> Option<u64> {
    None
}

/// Per-probe data handed back by the kprobe library on every hit.
#[derive(Clone)]
struct HarnessProbeData {
    symbol: String,
    addr: usize,
    callbacks: Arc<dyn ProbeCallbacks>,
}

impl fmt::Debug for HarnessProbeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessProbeData")
            .field("symbol", &self.symbol)
            .field("addr", &format_args!("{:#x}", self.addr))
            .finish_non_exhaustive()
    }
}

fn entry_handler(data: &dyn kprobe::ProbeData, pt_regs: &mut kprobe::PtRegs) {
    let Some(probe) = data.as_any().downcast_ref::<HarnessProbeData>() else {
        return;
    };
    probe.callbacks.pre(&KprobeContext::current(pt_regs));
}

fn ret_handler(data: &dyn kprobe::ProbeData, pt_regs: &mut kprobe::PtRegs) {
    let Some(probe) = data.as_any().downcast_ref::<HarnessProbeData>() else {
        return;
    };
    probe.callbacks.post(&KprobeContext::current(pt_regs));
}

/// Installed probes by address.
#[derive(Default)]
struct ActiveProbes {
    probes: BTreeMap<usize, HarnessProbeData>,
}

impl ActiveProbes {
    /// Claim `desc.addr` for a new probe.
    fn reserve(&mut self, desc: ProbeDescriptor) -> Result<HarnessProbeData, HostError> {
        if self.probes.contains_key(&desc.addr) {
            return Err(HostError::Duplicate);
        }
        let data = HarnessProbeData {
            symbol: desc.symbol,
            addr: desc.addr,
            callbacks: desc.callbacks,
        };
        self.probes.insert(data.addr, data.clone());
        Ok(data)
    }

    fn release(&mut self, addr: usize) -> Option<HarnessProbeData> {
        self.probes.remove(&addr)
    }

    fn get(&self, addr: usize) -> Option<HarnessProbeData> {
        self.probes.get(&addr).cloned()
    }

    fn contains(&self, addr: usize) -> bool {
        self.probes.contains_key(&addr)
    }
}

/// Hand a fault at `addr` to its probe. The table lock is dropped before
/// the callback runs.
fn route_fault(
    active: &Mutex<ActiveProbes>,
    addr: usize,
    trapnr: u32,
    ctx: &dyn InvocationContext,
) -> bool {
    let probe = active.lock().get(addr);
    match probe {
        Some(probe) => probe.callbacks.fault(ctx, trapnr),
        None => false,
    }
}

/// Registration handle of [`KprobeHost`].
pub struct KprobeHandle<O: kprobe::KprobeAuxiliaryOps + 'static> {
    addr: usize,
    probe: Arc<kprobe::Kretprobe<LockType, O>>,
}

impl<O: kprobe::KprobeAuxiliaryOps + 'static> KprobeHandle<O> {
    pub fn addr(&self) -> usize {
        self.addr
    }
}

impl<O: kprobe::KprobeAuxiliaryOps + 'static> fmt::Debug for KprobeHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KprobeHandle({:#x})", self.addr)
    }
}

struct Probes<O: kprobe::KprobeAuxiliaryOps + 'static> {
    /// The kprobe library's probe manager
    manager: kprobe::ProbeManager<LockType, O>,
    /// Probe point list
    probe_points: kprobe::ProbePointList<O>,
}

/// Kretprobe-backed [`ProbeHost`].
pub struct KprobeHost<O: kprobe::KprobeAuxiliaryOps + 'static> {
    probes: Mutex<Probes<O>>,
    /// Separate from `probes` so faults can be routed while a breakpoint
    /// is being handled.
    active: Mutex<ActiveProbes>,
    _ops: PhantomData<O>,
}

impl<O: kprobe::KprobeAuxiliaryOps + 'static> Default for KprobeHost<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: kprobe::KprobeAuxiliaryOps + 'static> KprobeHost<O> {
    pub fn new() -> Self {
        Self {
            probes: Mutex::new(Probes {
                manager: kprobe::ProbeManager::new(),
                probe_points: kprobe::ProbePointList::new(),
            }),
            active: Mutex::new(ActiveProbes::default()),
            _ops: PhantomData,
        }
    }

    /// Dispatch a breakpoint exception. Returns `None` if no probe owns it.
    pub fn handle_breakpoint(&self, regs: &mut kprobe::PtRegs) -> Option<()> {
        let mut probes = self.probes.lock();
        kprobe::kprobe_handler_from_break(&mut probes.manager, regs)
    }

    /// Dispatch a single-step debug exception.
    #[cfg(target_arch = "x86_64")]
    pub fn handle_debug(&self, regs: &mut kprobe::PtRegs) -> Option<()> {
        let mut probes = self.probes.lock();
        kprobe::kprobe_handler_from_debug(&mut probes.manager, regs)
    }

    /// Route a fault taken inside the probe at `addr` to its session.
    /// Returns whether the fault was handled.
    pub fn handle_fault(&self, addr: usize, trapnr: u32, regs: &kprobe::PtRegs) -> bool {
        route_fault(&self.active, addr, trapnr, &KprobeContext::current(regs))
    }

    pub fn is_registered(&self, addr: usize) -> bool {
        self.active.lock().contains(addr)
    }
}

impl<O: kprobe::KprobeAuxiliaryOps + 'static> ProbeHost for KprobeHost<O> {
    type Handle = KprobeHandle<O>;

    fn register(&self, desc: ProbeDescriptor) -> Result<KprobeHandle<O>, HostError> {
        let max_active = desc.max_active;
        let data = self.active.lock().reserve(desc)?;
        let addr = data.addr;

        log::info!(
            "kprobe: registering {} at {:#x} (maxactive={})",
            data.symbol,
            addr,
            max_active
        );
        let builder = kprobe::KretprobeBuilder::<LockType>::new(max_active as _)
            .with_symbol_addr(addr)
            .with_symbol(data.symbol.clone())
            .with_enable(true)
            .with_entry_handler(entry_handler)
            .with_ret_handler(ret_handler)
            .with_data(data);

        let mut probes = self.probes.lock();
        let Probes {
            manager,
            probe_points,
        } = &mut *probes;
        let probe = kprobe::register_kretprobe(manager, probe_points, builder);

        Ok(KprobeHandle { addr, probe })
    }

    fn unregister(&self, handle: KprobeHandle<O>) {
        {
            let mut probes = self.probes.lock();
            let Probes {
                manager,
                probe_points,
            } = &mut *probes;
            kprobe::unregister_kretprobe(manager, probe_points, handle.probe);
        }
        match self.active.lock().release(handle.addr) {
            Some(probe) => {
                log::info!("kprobe: unregistered {} at {:#x}", probe.symbol, handle.addr)
            }
            None => log::warn!("kprobe: no probe registered at {:#x}", handle.addr),
        }
    }
}
