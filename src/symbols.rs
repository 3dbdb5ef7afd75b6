//! Probe target resolution.
//!
//! Resolves a function name to its entry address and decides whether the
//! function may be instrumented at all. Functions the host marks as
//! non-probeable (the probe machinery itself, exception entry paths and
//! anything annotated as such) are listed in a [`Blacklist`].

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Outcome of resolving a probe target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The function exists and may be probed at this address.
    Probeable(usize),
    /// No function with this name is known.
    NotFound,
    /// The function exists but must not be instrumented.
    Blacklisted(usize),
}

/// Name-to-address resolution used when arming a probe.
pub trait SymbolResolver {
    /// Entry address of the function called `name`.
    fn lookup_addr(&self, name: &str) -> Option<usize>;

    /// Whether the function at `addr` is excluded from instrumentation.
    fn is_blacklisted(&self, _name: &str, _addr: usize) -> bool {
        false
    }

    /// Resolve `name` and apply the blacklist.
    fn resolve(&self, name: &str) -> Resolution {
        match self.lookup_addr(name) {
            None => Resolution::NotFound,
            Some(addr) if self.is_blacklisted(name, addr) => Resolution::Blacklisted(addr),
            Some(addr) => Resolution::Probeable(addr),
        }
    }
}

impl<R: SymbolResolver + ?Sized> SymbolResolver for &R {
    fn lookup_addr(&self, name: &str) -> Option<usize> {
        (**self).lookup_addr(name)
    }

    fn is_blacklisted(&self, name: &str, addr: usize) -> bool {
        (**self).is_blacklisted(name, addr)
    }
}

/// Names and address ranges that must never be probed.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    names: BTreeSet<String>,
    /// Half-open `[start, end)` ranges.
    ranges: Vec<(usize, usize)>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude one function by name.
    pub fn add_name(&mut self, name: &str) {
        self.names.insert(name.to_string());
    }

    /// Exclude every address in `[start, end)`, e.g. a `.kprobes.text`
    /// or `.entry.text` section.
    pub fn add_range(&mut self, start: usize, end: usize) {
        if start < end {
            self.ranges.push((start, end));
        }
    }

    pub fn contains(&self, name: &str, addr: usize) -> bool {
        self.names.contains(name)
            || self
                .ranges
                .iter()
                .any(|&(start, end)| addr >= start && addr < end)
    }
}

/// An explicit symbol table, for hosts that export their own symbols or
/// for simulation.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<String, usize>,
    blacklist: Blacklist,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function at `addr`.
    pub fn with_symbol(mut self, name: &str, addr: usize) -> Self {
        self.insert(name, addr);
        self
    }

    /// Add a function and mark it as non-probeable.
    pub fn with_blacklisted(mut self, name: &str, addr: usize) -> Self {
        self.insert(name, addr);
        self.blacklist.add_name(name);
        self
    }

    pub fn insert(&mut self, name: &str, addr: usize) {
        self.symbols.insert(name.to_string(), addr);
    }

    pub fn blacklist_mut(&mut self) -> &mut Blacklist {
        &mut self.blacklist
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for SymbolTable {
    fn lookup_addr(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }

    fn is_blacklisted(&self, name: &str, addr: usize) -> bool {
        self.blacklist.contains(name, addr)
    }
}

#[cfg(feature = "symbols")]
pub use kallsyms::{Error, KallsymsResolver, init, is_initialized, lookup_symbol};

/// Kernel symbol table backed by a kallsyms blob.
#[cfg(feature = "symbols")]
mod kallsyms {
    use alloc::string::String;
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, Ordering};
    use ksym::KallsymsMapped;

    use super::{Blacklist, SymbolResolver};

    static INITIALIZED: AtomicBool = AtomicBool::new(false);

    struct GlobalSymbolTable(UnsafeCell<Option<KallsymsMapped<'static>>>);
    unsafe impl Sync for GlobalSymbolTable {}
    static SYMBOL_TABLE: GlobalSymbolTable = GlobalSymbolTable(UnsafeCell::new(None));

    const KSYM_NAME_LEN: usize = 1024;

    /// Error types for symbol table initialization.
    #[derive(Debug)]
    pub enum Error {
        /// Symbol table has already been initialized.
        AlreadyInitialized,
        /// Failed to parse the symbol table blob.
        ParseError(&'static str),
    }

    impl core::fmt::Display for Error {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            match self {
                Self::AlreadyInitialized => write!(f, "Symbol table already initialized"),
                Self::ParseError(e) => write!(f, "Failed to parse symbol table: {}", e),
            }
        }
    }

    impl core::error::Error for Error {}

    /// Initialize the kernel symbol table from a binary blob.
    ///
    /// # Arguments
    /// * `data` - The binary blob containing compressed symbol data
    /// * `stext` - Start address of kernel text section
    /// * `etext` - End address of kernel text section
    ///
    /// Not thread-safe against concurrent init calls; call once during boot.
    pub fn init(data: &'static [u8], stext: u64, etext: u64) -> Result<(), Error> {
        load_once(|| {
            let table = KallsymsMapped::from_blob(data, stext, etext)
                .map_err(Error::ParseError)?;
            unsafe {
                *SYMBOL_TABLE.0.get() = Some(table);
            }
            Ok(())
        })?;

        log::info!("axprobe: symbol table loaded, text {:#x} - {:#x}", stext, etext);
        Ok(())
    }

    /// Run `load` unless a table is already in place. A failed load
    /// releases the claim so a corrected blob can be loaded later.
    fn load_once(load: impl FnOnce() -> Result<(), Error>) -> Result<(), Error> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }
        load().inspect_err(|_| INITIALIZED.store(false, Ordering::SeqCst))
    }

    /// Check if the symbol table has been initialized.
    pub fn is_initialized() -> bool {
        INITIALIZED.load(Ordering::SeqCst)
    }

    /// Lookup a symbol by address.
    ///
    /// Returns (name, size, offset, type) if found.
    pub fn lookup_symbol(addr: u64) -> Option<(String, u64, u64, char)> {
        let table = unsafe { (*SYMBOL_TABLE.0.get()).as_ref() }?;
        let mut name_buf = [0u8; KSYM_NAME_LEN];
        table
            .lookup_address(addr, &mut name_buf)
            .map(|(name, size, offset, ty)| (String::from(name), size, offset, ty))
    }

    /// Resolver over the global kallsyms table.
    ///
    /// Only text symbols (`T`/`t`) are probe targets; data symbols resolve
    /// as not found.
    #[derive(Debug, Default)]
    pub struct KallsymsResolver {
        blacklist: Blacklist,
    }

    impl KallsymsResolver {
        pub fn new(blacklist: Blacklist) -> Self {
            Self { blacklist }
        }
    }

    impl SymbolResolver for KallsymsResolver {
        fn lookup_addr(&self, name: &str) -> Option<usize> {
            let table = unsafe { (*SYMBOL_TABLE.0.get()).as_ref() }?;
            let addr = table.lookup_name(name)?;
            match lookup_symbol(addr) {
                Some((_, _, 0, 'T' | 't')) => Some(addr as usize),
                _ => None,
            }
        }

        fn is_blacklisted(&self, name: &str, addr: usize) -> bool {
            self.blacklist.contains(name, addr)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn failed_load_can_be_retried() {
            let first = load_once(|| Err(Error::ParseError("bad header")));
            assert!(matches!(first, Err(Error::ParseError("bad header"))));
            assert!(!is_initialized());

            let second = load_once(|| Err(Error::ParseError("truncated")));
            assert!(matches!(second, Err(Error::ParseError("truncated"))));
            assert!(!is_initialized());
            assert!(lookup_symbol(0x1000).is_none());
        }
    }
}
