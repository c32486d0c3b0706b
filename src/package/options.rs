use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::Package;
use crate::error::Result;

pub const DEFAULT_MAX_INDEX_COUNT: u32 = 16 * 1024 * 1024;
/// Ceiling for a single resource's declared size (1 GiB).
pub const DEFAULT_MAX_RESOURCE_SIZE: u32 = 1024 * 1024 * 1024;

/// Allocation ceilings applied to values read from a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_index_count: u32,
    pub max_resource_size: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_index_count: DEFAULT_MAX_INDEX_COUNT,
            max_resource_size: DEFAULT_MAX_RESOURCE_SIZE,
        }
    }
}

/// Builder for opening packages with non-default settings.
///
/// ```no_run
/// use dbpf_core::OpenOptions;
///
/// let pkg = OpenOptions::new()
///     .writable(true)
///     .max_resource_size(64 * 1024 * 1024)
///     .open("Mods/example.package")?;
/// # Ok::<(), dbpf_core::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub(crate) writable: bool,
    pub(crate) limits: Limits,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn max_index_count(mut self, count: u32) -> Self {
        self.limits.max_index_count = count;
        self
    }

    pub fn max_resource_size(mut self, size: u32) -> Self {
        self.limits.max_resource_size = size;
        self
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Package> {
        Package::open_with(path.as_ref(), self)
    }

    pub fn open_bytes(&self, bytes: Vec<u8>) -> Result<Package> {
        Package::from_bytes_with(bytes, self)
    }
}

/// Cooperative cancellation flag shared between a save and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
