//! Render cache configuration.
//!
//! Populated from the `[cache]` table of `render-cache.toml`.

use std::num::NonZeroUsize;

use serde::Deserialize;

/// Tag added to every entry the render cache writes, so that a single
/// invalidation flushes all rendered output in a shared bin.
pub const RENDERED_TAG: &str = "rendered";

const DEFAULT_BIN: &str = "render";
const DEFAULT_MAX_REDIRECT_HOPS: usize = 5;
const DEFAULT_MEMORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable render caching. When off, every lookup misses and writes are
    /// dropped.
    pub enabled: bool,
    /// Bin used by identities that do not name one.
    pub default_bin: String,
    /// Maximum redirect records followed by a single lookup.
    pub max_redirect_hops: usize,
    /// Maximum entries per in-memory bin.
    pub memory_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_bin: DEFAULT_BIN.to_string(),
            max_redirect_hops: DEFAULT_MAX_REDIRECT_HOPS,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            default_bin: settings.default_bin.clone(),
            max_redirect_hops: settings.max_redirect_hops.get(),
            memory_capacity: settings.memory_capacity.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
