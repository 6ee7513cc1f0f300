//! Weight placement and accelerator cache handling

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where a model's weights are loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePlacement {
    /// Let the backend choose (accelerator when available)
    Auto,
    /// Force host memory
    Cpu,
}

impl fmt::Display for DevicePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePlacement::Auto => write!(f, "auto"),
            DevicePlacement::Cpu => write!(f, "cpu"),
        }
    }
}

/// Releasable accelerator memory pool
pub trait DeviceCache: Send + Sync {
    fn empty_cache(&self);
}

/// Cache of the host backend: nothing to free, releases are only counted
#[derive(Debug, Default)]
pub struct HostCache {
    releases: AtomicUsize,
}

impl HostCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the cache was emptied
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl DeviceCache for HostCache {
    fn empty_cache(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Empties the cache when created and again when dropped, on every exit path
pub struct CacheScope<'a> {
    cache: &'a dyn DeviceCache,
}

impl<'a> CacheScope<'a> {
    pub fn enter(cache: &'a dyn DeviceCache) -> Self {
        cache.empty_cache();
        Self { cache }
    }
}

impl Drop for CacheScope<'_> {
    fn drop(&mut self) {
        self.cache.empty_cache();
    }
}
