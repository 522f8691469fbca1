//! Cache configuration.
//!
//! Controls reload behaviour, precaching and refresh exclusions for every
//! dataset cache owned by a registry.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_PRECACHE_CHUNK_SIZE: usize = 500;
const DEFAULT_REFRESH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve entries older than this stale and reload them in the background.
    /// `None` keeps entries until they are refreshed or invalidated.
    pub reload_after_write_ms: Option<u64>,
    /// Load every key of a dataset when its cache is built.
    pub precache: bool,
    /// Keys per bulk read while precaching.
    pub precache_chunk_size: usize,
    /// Concurrent per-key reloads during a full dataset refresh.
    pub refresh_concurrency: usize,
    /// Dataset names skipped by full refresh and reported with hash 0.
    pub exclude_from_refresh: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reload_after_write_ms: None,
            precache: false,
            precache_chunk_size: DEFAULT_PRECACHE_CHUNK_SIZE,
            refresh_concurrency: DEFAULT_REFRESH_CONCURRENCY,
            exclude_from_refresh: Vec::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            reload_after_write_ms: settings
                .reload_after_write
                .map(|duration| duration.as_millis() as u64),
            precache: settings.precache,
            precache_chunk_size: settings.precache_chunk_size.get(),
            refresh_concurrency: settings.refresh_concurrency.get(),
            exclude_from_refresh: settings.exclude_from_refresh.clone(),
        }
    }
}

impl CacheConfig {
    pub fn reload_after_write(&self) -> Option<Duration> {
        self.reload_after_write_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Returns the precache chunk size as NonZeroUsize, clamping to 1 if zero.
    pub fn precache_chunk_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.precache_chunk_size).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn refresh_concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.refresh_concurrency).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn is_excluded(&self, dataset: &str) -> bool {
        self.exclude_from_refresh.iter().any(|name| name == dataset)
    }
}
