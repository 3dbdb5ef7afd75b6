//! Probe lifecycle: arming and disarming sessions.

use alloc::string::ToString;

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::host::{HostError, ProbeDescriptor, ProbeHost};
use crate::session::{ProbeSession, SessionState};
use crate::symbols::{Resolution, SymbolResolver};

/// Arms and disarms [`ProbeSession`]s on one host.
///
/// The harness holds no per-session state, so any number of sessions may
/// be armed through it at once.
#[derive(Debug)]
pub struct ProbeHarness<H: ProbeHost, R: SymbolResolver> {
    host: H,
    resolver: R,
}

impl<H: ProbeHost, R: SymbolResolver> ProbeHarness<H, R> {
    pub fn new(host: H, resolver: R) -> Self {
        Self { host, resolver }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Resolve the session's target and install the probe.
    ///
    /// On error the session is left unregistered and nothing is installed.
    pub fn arm(&self, session: &mut ProbeSession<H::Handle>) -> Result<()> {
        let core = &session.core;
        let name = core.target().name();

        if name.is_empty() {
            warn!("axprobe: expected a valid kprobe_func=<func_name> parameter");
            return Err(Error::ConfigurationMissing);
        }
        if session.handle.is_some() {
            return Err(Error::AlreadyArmed(name.to_string()));
        }

        let addr = match self.resolver.resolve(name) {
            Resolution::Probeable(addr) => addr,
            Resolution::NotFound => {
                warn!(
                    "axprobe: '{}' not found; the function may be invalid, static, inline; or blacklisted?",
                    name
                );
                return Err(Error::TargetNotFound(name.to_string()));
            }
            Resolution::Blacklisted(addr) => {
                warn!("axprobe: '{}' ({:#x}) cannot be probed", name, addr);
                return Err(Error::TargetBlacklisted(name.to_string()));
            }
        };

        // Armed before the host can call in, so the first hit samples.
        core.set_addr(addr);
        core.set_state(SessionState::Armed);

        let desc = ProbeDescriptor {
            symbol: name.to_string(),
            addr,
            max_active: core.max_active(),
            callbacks: core.clone(),
        };
        match self.host.register(desc) {
            Ok(handle) => {
                info!(
                    "axprobe: registered probe @ '{}' ({:#x}), verbose {}",
                    name,
                    addr,
                    if core.is_verbose() { "Y" } else { "N" }
                );
                session.handle = Some(handle);
                Ok(())
            }
            Err(reason) => {
                core.set_state(SessionState::Unregistered);
                core.set_addr(0);
                warn!("axprobe: register probe @ '{}' failed: {}", name, reason);
                Err(match reason {
                    HostError::Duplicate => Error::AlreadyArmed(name.to_string()),
                    reason => Error::Registration {
                        symbol: name.to_string(),
                        reason,
                    },
                })
            }
        }
    }

    /// Build a session from `config` and arm it.
    pub fn attach(&self, config: ProbeConfig) -> Result<ProbeSession<H::Handle>> {
        let mut session = ProbeSession::new(config);
        self.arm(&mut session)?;
        Ok(session)
    }

    /// Remove the session's probe and wait for running callbacks.
    ///
    /// A no-op on a session that is not armed, so it is safe to call after
    /// a failed arm or twice in a row.
    pub fn disarm(&self, session: &mut ProbeSession<H::Handle>) {
        let Some(handle) = session.handle.take() else {
            debug!(
                "axprobe: '{}' not armed, nothing to unregister",
                session.target().name()
            );
            return;
        };
        let core = &session.core;

        core.set_state(SessionState::Disarming);
        self.host.unregister(handle);
        core.wait_quiescent();

        let stale = core.drop_outstanding();
        if stale > 0 {
            warn!(
                "axprobe: '{}' dropped {} invocations still in progress",
                core.target().name(),
                stale
            );
        }
        core.set_state(SessionState::Unregistered);

        let stats = core.stats();
        info!(
            "axprobe: unregistered probe @ '{}' ({} samples, avg {} ns)",
            core.target().name(),
            stats.samples,
            stats.avg_ns
        );
    }
}
