//! Invocation context seen by probe callbacks.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::abi::{CallingConvention, MAX_REG_ARGS, Reg};
use crate::platform;

/// Maximum task name length, including the terminating NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Fixed-size task name, as stored in a task descriptor.
///
/// Lives inline so callbacks can carry and compare it without allocating.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskComm {
    bytes: [u8; TASK_COMM_LEN],
    len: u8,
}

impl TaskComm {
    /// Build from a name, truncating to `TASK_COMM_LEN - 1` bytes on a
    /// character boundary.
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(TASK_COMM_LEN - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; TASK_COMM_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// Build from a raw NUL-padded buffer; invalid UTF-8 is cut at the
    /// first bad byte.
    pub fn from_raw(raw: &[u8]) -> Self {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let raw = &raw[..end];
        let name = match core::str::from_utf8(raw) {
            Ok(s) => s,
            // Safe: valid_up_to() marks a UTF-8 boundary.
            Err(e) => core::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or(""),
        };
        Self::new(name)
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for TaskComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for TaskComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Execution-context flags of an invocation, for the context line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    pub irqs_disabled: bool,
    pub hardirq: bool,
    pub softirq: bool,
    pub nmi: bool,
    pub preempt_depth: u8,
}

impl ContextFlags {
    /// Probe handlers always run with preemption disabled.
    pub const PROBE_HANDLER: Self = Self {
        irqs_disabled: false,
        hardirq: false,
        softirq: false,
        nmi: false,
        preempt_depth: 1,
    };

    /// Whether the invocation may not sleep.
    pub fn is_atomic(&self) -> bool {
        self.irqs_disabled || self.hardirq || self.softirq || self.nmi || self.preempt_depth > 0
    }
}

/// Renders the ftrace-style latency field, e.g. `d.h1`.
impl fmt::Display for ContextFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let irq = if self.irqs_disabled { 'd' } else { '.' };
        let ctx = match (self.nmi, self.hardirq, self.softirq) {
            (true, _, _) => 'Z',
            (false, true, true) => 'H',
            (false, true, false) => 'h',
            (false, false, true) => 's',
            _ => '.',
        };
        write!(f, "{}.{}{}", irq, ctx, self.preempt_depth.min(9))
    }
}

/// The identity and register state of one call being instrumented.
///
/// Implementations are handed to callbacks running in atomic context:
/// every method must be cheap and must not block.
pub trait InvocationContext {
    /// Identity of the invocation, unique among concurrently running
    /// calls of the target (typically the task id).
    fn invocation_id(&self) -> u64;

    /// Name of the task that made the call.
    fn comm(&self) -> &TaskComm;

    /// Id of the task that made the call.
    fn pid(&self) -> u32;

    /// CPU the callback is running on.
    fn cpu(&self) -> u32 {
        platform::cpu_id()
    }

    fn flags(&self) -> ContextFlags {
        ContextFlags::PROBE_HANDLER
    }

    /// Value of a general-purpose register, if the context exposes it.
    fn register(&self, reg: Reg) -> Option<u64>;
}

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// A synthesized invocation context, used by [`SoftHost`] callers.
///
/// [`SoftHost`]: crate::host::SoftHost
#[derive(Debug, Clone)]
pub struct CallFrame {
    id: u64,
    pid: u32,
    comm: TaskComm,
    cpu: Option<u32>,
    flags: ContextFlags,
    convention: Option<&'static CallingConvention>,
    args: [u64; MAX_REG_ARGS],
    nargs: usize,
    retval: Option<u64>,
}

impl CallFrame {
    /// A frame for a call made by task `comm`/`pid`, with a fresh
    /// invocation id and the host calling convention.
    pub fn new(comm: &str, pid: u32) -> Self {
        Self {
            id: NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            comm: TaskComm::new(comm),
            cpu: None,
            flags: ContextFlags::PROBE_HANDLER,
            convention: CallingConvention::host(),
            args: [0; MAX_REG_ARGS],
            nargs: 0,
            retval: None,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn with_flags(mut self, flags: ContextFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_convention(mut self, convention: &'static CallingConvention) -> Self {
        self.convention = Some(convention);
        self
    }

    /// Place call arguments into the convention's argument registers.
    /// Arguments beyond the register-passed ones are dropped.
    pub fn with_args(mut self, args: &[u64]) -> Self {
        let n = args.len().min(MAX_REG_ARGS);
        self.args[..n].copy_from_slice(&args[..n]);
        self.nargs = n;
        self
    }

    /// Set the value the return register holds after the call.
    pub fn set_retval(&mut self, value: u64) {
        self.retval = Some(value);
    }
}

impl InvocationContext for CallFrame {
    fn invocation_id(&self) -> u64 {
        self.id
    }

    fn comm(&self) -> &TaskComm {
        &self.comm
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn cpu(&self) -> u32 {
        self.cpu.unwrap_or_else(platform::cpu_id)
    }

    fn flags(&self) -> ContextFlags {
        self.flags
    }

    fn register(&self, reg: Reg) -> Option<u64> {
        let conv = self.convention?;
        if let Some(v) = self.retval.filter(|_| reg == conv.ret_reg) {
            return Some(v);
        }
        let pos = conv.position(reg)?;
        if pos < self.nargs.min(conv.max_args()) {
            Some(self.args[pos])
        } else {
            None
        }
    }
}
