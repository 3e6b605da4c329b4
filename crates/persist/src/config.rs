use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the parent directory of temporary caches.
pub const CACHE_DIR_ENV: &str = "WORLDSTORE_CACHE_DIR";
/// Environment variable overriding the RAM budget of a temporary cache, in bytes.
pub const CACHE_SIZE_ENV: &str = "WORLDSTORE_CACHE_SIZE";

/// Configuration for a temporary, directory-backed [`DiskCache`](crate::DiskCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum bytes of values kept in RAM before eviction.
    pub max_size: usize,
    /// Bytes per sector in the backing file store.
    pub sector_size: u64,
    /// Parent directory for cache directories. `None` uses the working directory.
    pub cache_dir: Option<PathBuf>,
    /// Cache directories older than this are removed by the stale sweep.
    pub stale_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100_000_000,
            sector_size: 4096,
            cache_dir: None,
            stale_after: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by `WORLDSTORE_CACHE_DIR` and `WORLDSTORE_CACHE_SIZE`.
    ///
    /// An unparsable size is ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var_os(name))
    }

    fn from_vars(var: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = var(CACHE_DIR_ENV).filter(|dir| !dir.is_empty()) {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = var(CACHE_SIZE_ENV) {
            let raw = raw.to_string_lossy();
            match raw.trim().parse::<usize>() {
                Ok(size) => config.max_size = size,
                Err(e) => tracing::warn!(value = %raw, error = %e, "ignoring invalid cache size"),
            }
        }
        config
    }

    /// Parent directory that cache directories are created under.
    pub fn parent_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}
