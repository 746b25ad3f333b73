use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::packer::{ArgType, LogArgs};

/// Log-site registry for the binary logging system.
///
/// Every distinct log statement gets a dense numeric id the first time it
/// executes, together with its static metadata. Records only carry the id;
/// the background writer copies new registry entries into each log file's
/// dictionary before any record that references them.
///
/// # Thread Safety
///
/// Registration takes a write lock, but it happens once per call site. The
/// `nano_log!` macro caches the id in its per-site `static`, so the
/// steady-state cost of identifying a site is one acquire load and a short
/// signature compare.

/// Severity of a log statement, lowest first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug = 0,
    Notice = 1,
    Warning = 2,
    Error = 3,
}

impl Severity {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Severity::Debug),
            1 => Some(Severity::Notice),
            2 => Some(Severity::Warning),
            3 => Some(Severity::Error),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one log statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSiteMetadata {
    pub id: u32,
    pub format_string: String,
    pub arg_types: Vec<ArgType>,
    pub severity: Severity,
    pub source_location: String,
}

type SiteKey = (String, Vec<ArgType>, Severity, String);

#[derive(Default)]
struct Registry {
    sites: Vec<Arc<LogSiteMetadata>>,
    index: HashMap<SiteKey, u32>,
}

lazy_static! {
    /// Arena of registered sites; a site's id is its index.
    static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry::default());
}

static LEVEL: AtomicU8 = AtomicU8::new(Severity::Notice as u8);

/// Registers a log site and returns its id.
///
/// Registering identical metadata again returns the existing id, so the
/// same call site keeps one identity for the lifetime of the process.
///
/// ```
/// # use nanolog::log_site::{register_site, site, Severity};
/// # use nanolog::packer::ArgType;
/// let id = register_site("value=%d", vec![ArgType::I32], Severity::Notice, "main.rs:10");
/// let again = register_site("value=%d", vec![ArgType::I32], Severity::Notice, "main.rs:10");
/// assert_eq!(id, again);
/// assert_eq!(site(id).unwrap().format_string, "value=%d");
/// ```
pub fn register_site(
    format_string: &str,
    arg_types: Vec<ArgType>,
    severity: Severity,
    source_location: &str,
) -> u32 {
    let key: SiteKey = (
        format_string.to_string(),
        arg_types,
        severity,
        source_location.to_string(),
    );

    if let Some(&id) = REGISTRY.read().index.get(&key) {
        return id;
    }

    let mut registry = REGISTRY.write();
    if let Some(&id) = registry.index.get(&key) {
        return id;
    }

    let id = registry.sites.len() as u32;
    registry.sites.push(Arc::new(LogSiteMetadata {
        id,
        format_string: key.0.clone(),
        arg_types: key.1.clone(),
        severity,
        source_location: key.3.clone(),
    }));
    registry.index.insert(key, id);
    id
}

/// Looks up a registered site by id.
pub fn site(id: u32) -> Option<Arc<LogSiteMetadata>> {
    REGISTRY.read().sites.get(id as usize).cloned()
}

/// Number of sites registered so far. Ids below this are all valid.
pub fn site_count() -> usize {
    REGISTRY.read().sites.len()
}

/// Every site whose id is at least `start`, in id order.
pub fn sites_from(start: usize) -> Vec<Arc<LogSiteMetadata>> {
    let registry = REGISTRY.read();
    registry
        .sites
        .get(start..)
        .map(|s| s.to_vec())
        .unwrap_or_default()
}

/// The minimum severity that is currently recorded.
pub fn current_level() -> Severity {
    Severity::from_u8(LEVEL.load(Ordering::Relaxed)).unwrap_or(Severity::Notice)
}

/// Changes the threshold; effective for every subsequent log call.
pub fn set_level(level: Severity) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Whether a statement of `severity` passes the current threshold.
#[inline(always)]
pub fn is_enabled(severity: Severity) -> bool {
    severity as u8 >= LEVEL.load(Ordering::Relaxed)
}

/// Per-statement handle created by `nano_log!` as a `static`.
///
/// Holds the compile-time metadata and caches the registry id together with
/// the argument signature it was registered for. A `nano_log!` inside a
/// generic function shares one `static` across instantiations, so a call
/// with a different signature bypasses the cache and gets its own site.
pub struct CallSite {
    format_string: &'static str,
    severity: Severity,
    source_location: &'static str,
    cached: OnceLock<(u32, &'static [ArgType])>,
}

impl CallSite {
    pub const fn new(
        format_string: &'static str,
        severity: Severity,
        source_location: &'static str,
    ) -> Self {
        Self {
            format_string,
            severity,
            source_location,
            cached: OnceLock::new(),
        }
    }

    #[inline(always)]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn format_string(&self) -> &'static str {
        self.format_string
    }

    pub fn source_location(&self) -> &'static str {
        self.source_location
    }

    /// The site's id, registering it with `A`'s signature on first use.
    #[inline(always)]
    pub fn id<A: LogArgs>(&self) -> u32 {
        match self.cached.get() {
            Some(&(id, signature)) if signature == A::SIGNATURE => id,
            _ => self.register::<A>(),
        }
    }

    #[cold]
    fn register<A: LogArgs>(&self) -> u32 {
        let id = register_site(
            self.format_string,
            A::SIGNATURE.to_vec(),
            self.severity,
            self.source_location,
        );
        // First signature wins the cache; others resolve through the registry.
        let _ = self.cached.set((id, A::SIGNATURE));
        id
    }
}
