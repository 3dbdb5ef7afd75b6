//! Calling-context filters.
//!
//! A filter restricts sampling to invocations made by particular tasks.
//! Matching is allocation-free, since it runs inside probe callbacks.

use core::fmt;

use crate::context::{InvocationContext, TaskComm};

/// Predicate over the task that invoked the probed function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFilter {
    /// Task name starts with the given prefix (`strncmp(comm, p, len(p))`).
    CommPrefix(TaskComm),
    /// Task name equals the given name.
    Comm(TaskComm),
    /// Task id equals the given pid.
    Pid(u32),
}

impl ContextFilter {
    pub fn comm_prefix(prefix: &str) -> Self {
        Self::CommPrefix(TaskComm::new(prefix))
    }

    pub fn comm(name: &str) -> Self {
        Self::Comm(TaskComm::new(name))
    }

    /// Whether the invocation should be sampled.
    pub fn matches(&self, ctx: &dyn InvocationContext) -> bool {
        match self {
            Self::CommPrefix(prefix) => ctx.comm().as_str().starts_with(prefix.as_str()),
            Self::Comm(name) => ctx.comm() == name,
            Self::Pid(pid) => ctx.pid() == *pid,
        }
    }
}

impl fmt::Display for ContextFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommPrefix(prefix) => write!(f, "comm^={}", prefix),
            Self::Comm(name) => write!(f, "comm={}", name),
            Self::Pid(pid) => write!(f, "pid={}", pid),
        }
    }
}
