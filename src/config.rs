//! Probe configuration.
//!
//! A [`ProbeConfig`] is built either programmatically or from an
//! insmod-style parameter string such as
//! `"kprobe_func=do_sys_open verbose=1 filter_comm=vi fetch_arg=1:str"`.

use alloc::format;
use alloc::string::{String, ToString};

use crate::error::{Error, Result};
use crate::filter::ContextFilter;

/// Default capacity of the per-session invocation table.
pub const DEFAULT_MAX_ACTIVE: usize = 16;

/// Longest target name accepted, matching the source module parameter.
pub const MAX_FUNCNAME_LEN: usize = 64;

/// How a fetched argument is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Log the raw register value.
    Value,
    /// Treat the register as a pointer to a NUL-terminated string in
    /// foreign (caller) memory and copy it out without faulting.
    Str,
}

/// An argument of the target function to extract in the pre-callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgFetch {
    /// Zero-based argument index in ABI order.
    pub index: usize,
    pub kind: ArgKind,
}

/// Configuration of one probe session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Name of the function to probe.
    pub target: String,
    /// Emit per-invocation context lines.
    pub verbose: bool,
    pub filter: Option<ContextFilter>,
    pub fetch: Option<ArgFetch>,
    /// Maximum number of invocations tracked concurrently.
    pub max_active: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            verbose: false,
            filter: None,
            fetch: None,
            max_active: DEFAULT_MAX_ACTIVE,
        }
    }
}

impl ProbeConfig {
    /// Configuration probing `target` with defaults for everything else.
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Default::default()
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn filter(mut self, filter: ContextFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn fetch_arg(mut self, index: usize, kind: ArgKind) -> Self {
        self.fetch = Some(ArgFetch { index, kind });
        self
    }

    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Parse whitespace-separated `key=value` parameters.
    ///
    /// A missing target is not an error here; arming reports it as
    /// [`Error::ConfigurationMissing`].
    pub fn from_params(params: &str) -> Result<Self> {
        let mut config = Self::default();

        for word in params.split_whitespace() {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| Error::InvalidParameter(format!("expected key=value: {}", word)))?;

            match key {
                "kprobe_func" | "funcname" => {
                    if value.len() >= MAX_FUNCNAME_LEN {
                        return Err(Error::InvalidParameter(format!(
                            "{} longer than {} bytes",
                            key,
                            MAX_FUNCNAME_LEN - 1
                        )));
                    }
                    config.target = value.to_string();
                }
                "verbose" => config.verbose = parse_bool(key, value)?,
                "filter_comm" => config.filter = Some(ContextFilter::comm_prefix(value)),
                "filter_pid" => {
                    let pid = value.parse::<u32>().map_err(|_| bad_value(key, value))?;
                    config.filter = Some(ContextFilter::Pid(pid));
                }
                "fetch_arg" => config.fetch = Some(parse_fetch(value)?),
                "maxactive" => {
                    let n = value.parse::<usize>().map_err(|_| bad_value(key, value))?;
                    if n == 0 {
                        return Err(bad_value(key, value));
                    }
                    config.max_active = n;
                }
                _ => return Err(Error::InvalidParameter(format!("unknown parameter: {}", key))),
            }
        }

        Ok(config)
    }
}

fn bad_value(key: &str, value: &str) -> Error {
    Error::InvalidParameter(format!("bad value for {}: {}", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "y" | "Y" | "true" => Ok(true),
        "0" | "n" | "N" | "false" => Ok(false),
        _ => Err(bad_value(key, value)),
    }
}

fn parse_fetch(value: &str) -> Result<ArgFetch> {
    let (index, kind) = match value.split_once(':') {
        Some((index, "str")) => (index, ArgKind::Str),
        Some(_) => return Err(bad_value("fetch_arg", value)),
        None => (value, ArgKind::Value),
    };
    let index = index
        .parse::<usize>()
        .map_err(|_| bad_value("fetch_arg", value))?;
    Ok(ArgFetch { index, kind })
}
