//! In-process probe host.
//!
//! Keeps a registry of installed probes and dispatches their callbacks
//! when a caller announces a call of the probed function through
//! [`SoftHost::invoke`]. Useful for exercising probe logic in user space
//! and for instrumenting functions that are called through an explicit
//! dispatch point.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{HostError, ProbeCallbacks, ProbeDescriptor, ProbeHost};
use crate::context::CallFrame;

/// One installed probe.
struct SoftProbe {
    /// Symbol name.
    name: String,
    /// Hit count.
    hits: u64,
    callbacks: Arc<dyn ProbeCallbacks>,
}

/// Probe registry.
#[derive(Default)]
struct SoftRegistry {
    /// Installed probes by address.
    probes: BTreeMap<usize, SoftProbe>,
    /// Name to address mapping.
    name_map: BTreeMap<String, usize>,
}

/// Handle returned by [`SoftHost::register`].
#[derive(Debug, PartialEq, Eq)]
pub struct SoftHandle {
    addr: usize,
}

impl SoftHandle {
    pub fn addr(&self) -> usize {
        self.addr
    }
}

/// In-process probe host.
pub struct SoftHost {
    registry: Mutex<SoftRegistry>,
    capacity: usize,
}

impl Default for SoftHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftHost {
    /// A host with no limit on installed probes.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// A host that refuses registrations beyond `capacity` probes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(SoftRegistry::default()),
            capacity,
        }
    }

    /// Record a hit on `symbol` and return its callbacks, if probed.
    ///
    /// The registry lock is released before any callback runs.
    fn hit(&self, symbol: &str) -> Option<Arc<dyn ProbeCallbacks>> {
        let mut registry = self.registry.lock();
        let addr = *registry.name_map.get(symbol)?;
        let probe = registry.probes.get_mut(&addr)?;
        probe.hits += 1;
        Some(probe.callbacks.clone())
    }

    /// Run `body` as one call of `symbol`, surrounded by the probe's pre
    /// and post callbacks if the symbol is probed.
    pub fn invoke<T>(&self, symbol: &str, frame: &CallFrame, body: impl FnOnce() -> T) -> T {
        let callbacks = self.hit(symbol);
        if let Some(cb) = &callbacks {
            cb.pre(frame);
        }
        let ret = body();
        if let Some(cb) = &callbacks {
            cb.post(frame);
        }
        ret
    }

    /// Like [`invoke`](Self::invoke), with the body's result placed in the
    /// return register seen by the post callback.
    pub fn invoke_ret(&self, symbol: &str, frame: &CallFrame, body: impl FnOnce() -> u64) -> u64 {
        let callbacks = self.hit(symbol);
        if let Some(cb) = &callbacks {
            cb.pre(frame);
        }
        let ret = body();
        if let Some(cb) = &callbacks {
            let mut exit = frame.clone();
            exit.set_retval(ret);
            cb.post(&exit);
        }
        ret
    }

    /// Report a fault taken while the probe on `symbol` was active.
    ///
    /// Returns whether the probe handled it; `false` if not probed.
    pub fn raise_fault(&self, symbol: &str, frame: &CallFrame, trapnr: u32) -> bool {
        let callbacks = {
            let registry = self.registry.lock();
            registry
                .name_map
                .get(symbol)
                .and_then(|addr| registry.probes.get(addr))
                .map(|p| p.callbacks.clone())
        };
        match callbacks {
            Some(cb) => cb.fault(frame, trapnr),
            None => false,
        }
    }

    pub fn is_registered(&self, symbol: &str) -> bool {
        self.registry.lock().name_map.contains_key(symbol)
    }

    /// Number of installed probes.
    pub fn probe_count(&self) -> usize {
        self.registry.lock().probes.len()
    }

    /// Hit count of the probe on `symbol`.
    pub fn hits(&self, symbol: &str) -> Option<u64> {
        let registry = self.registry.lock();
        let addr = registry.name_map.get(symbol)?;
        registry.probes.get(addr).map(|p| p.hits)
    }

    /// `(name, addr, hits)` of every installed probe, by address.
    pub fn list(&self) -> Vec<(String, usize, u64)> {
        let registry = self.registry.lock();
        registry
            .probes
            .iter()
            .map(|(addr, p)| (p.name.clone(), *addr, p.hits))
            .collect()
    }
}

impl ProbeHost for SoftHost {
    type Handle = SoftHandle;

    fn register(&self, desc: ProbeDescriptor) -> Result<SoftHandle, HostError> {
        let mut registry = self.registry.lock();

        if registry.probes.contains_key(&desc.addr) || registry.name_map.contains_key(&desc.symbol)
        {
            return Err(HostError::Duplicate);
        }
        if registry.probes.len() >= self.capacity {
            return Err(HostError::Exhausted);
        }

        log::debug!(
            "soft_host: installing {} at {:#x} (maxactive={})",
            desc.symbol,
            desc.addr,
            desc.max_active
        );
        registry.name_map.insert(desc.symbol.clone(), desc.addr);
        registry.probes.insert(
            desc.addr,
            SoftProbe {
                name: desc.symbol,
                hits: 0,
                callbacks: desc.callbacks,
            },
        );

        Ok(SoftHandle { addr: desc.addr })
    }

    fn unregister(&self, handle: SoftHandle) {
        let mut registry = self.registry.lock();
        match registry.probes.remove(&handle.addr) {
            Some(probe) => {
                registry.name_map.remove(&probe.name);
                log::debug!(
                    "soft_host: removed {} at {:#x} after {} hits",
                    probe.name,
                    handle.addr,
                    probe.hits
                );
            }
            None => log::warn!("soft_host: no probe installed at {:#x}", handle.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationContext;
    use alloc::string::ToString;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        pre: AtomicU32,
        post: AtomicU32,
    }

    impl ProbeCallbacks for Counting {
        fn pre(&self, _ctx: &dyn InvocationContext) {
            self.pre.fetch_add(1, Ordering::SeqCst);
        }

        fn post(&self, _ctx: &dyn InvocationContext) {
            self.post.fetch_add(1, Ordering::SeqCst);
        }

        fn fault(&self, _ctx: &dyn InvocationContext, _trapnr: u32) -> bool {
            true
        }
    }

    fn desc(symbol: &str, addr: usize, cb: Arc<Counting>) -> ProbeDescriptor {
        ProbeDescriptor {
            symbol: symbol.to_string(),
            addr,
            max_active: 4,
            callbacks: cb,
        }
    }

    #[test]
    fn invoke_runs_callbacks_around_body() {
        let host = SoftHost::new();
        let cb = Arc::new(Counting::default());
        let handle = host.register(desc("f", 0x100, cb.clone())).unwrap();

        let frame = CallFrame::new("t", 1);
        let out = host.invoke("f", &frame, || {
            assert_eq!(cb.pre.load(Ordering::SeqCst), 1);
            assert_eq!(cb.post.load(Ordering::SeqCst), 0);
            7
        });
        assert_eq!(out, 7);
        assert_eq!(cb.post.load(Ordering::SeqCst), 1);
        assert_eq!(host.hits("f"), Some(1));
        assert!(host.raise_fault("f", &frame, 14));

        host.unregister(handle);
        host.invoke("f", &frame, || ());
        assert_eq!(cb.pre.load(Ordering::SeqCst), 1);
        assert!(!host.is_registered("f"));
        assert!(!host.raise_fault("f", &frame, 14));
    }

    #[test]
    fn duplicate_and_capacity() {
        let host = SoftHost::with_capacity(1);
        let cb = Arc::new(Counting::default());
        host.register(desc("f", 0x100, cb.clone())).unwrap();

        assert_eq!(
            host.register(desc("f", 0x100, cb.clone())).unwrap_err(),
            HostError::Duplicate
        );
        assert_eq!(
            host.register(desc("g", 0x200, cb)).unwrap_err(),
            HostError::Exhausted
        );
        assert_eq!(host.list(), alloc::vec![("f".to_string(), 0x100, 0)]);
    }
}
