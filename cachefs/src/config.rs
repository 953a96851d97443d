//! Cache configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the chunk cache picks a victim once `chunk_total_size` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict the least recently used chunk.
    #[default]
    Lru,
    /// moka's admission-aware TinyLFU; better hit ratio on scan-heavy loads.
    TinyLfu,
}

/// What the upload worker does with an upload that keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Reset the entry to staged and retry on the next sweep, forever.
    #[default]
    Forever,
    /// Give up after this many failed attempts; the staged copy is dropped.
    MaxAttempts(u32),
}

impl RetryPolicy {
    pub fn should_abandon(&self, attempts: u32) -> bool {
        match self {
            RetryPolicy::Forever => false,
            RetryPolicy::MaxAttempts(max) => attempts >= *max,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long object and directory records stay fresh without a
    /// notification.
    pub info_age: Duration,
    /// Size of one cached chunk in bytes.
    pub chunk_size: u64,
    /// Upper bound of the chunk cache on disk, in bytes.
    pub chunk_total_size: u64,
    pub eviction: EvictionPolicy,
    /// Minimum time a file sits in staging before the worker uploads it.
    pub upload_wait: Duration,
    /// How often the worker scans the ledger when nothing wakes it.
    pub upload_poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Idle path locks are collected once the table grows past this size.
    pub lock_gc_threshold: usize,
    /// SQLite database holding records and the upload ledger.
    pub db_path: PathBuf,
    /// Root directory of the chunk files.
    pub chunk_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cachefs");
        Self {
            info_age: Duration::from_secs(6 * 60 * 60),
            chunk_size: 5 * 1024 * 1024,         // 5MiB
            chunk_total_size: 10 * 1024 * 1024 * 1024, // 10GiB
            eviction: EvictionPolicy::Lru,
            upload_wait: Duration::from_secs(15),
            upload_poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::Forever,
            lock_gc_threshold: 4096,
            db_path: root.join("meta.db"),
            chunk_dir: root.join("chunks"),
        }
    }
}

impl CacheConfig {
    /// Default configuration with every on-disk location placed under `root`.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            db_path: root.join("meta.db"),
            chunk_dir: root.join("chunks"),
            ..Self::default()
        }
    }
}
