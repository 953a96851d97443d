//! On-disk chunk store with a bounded in-memory index.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<digest[..2]>/<digest>/<generation>-<chunk_size>-<index>-<uuid>
//! ```
//!
//! where `digest` is the hex sha256 of the file path. The moka index owns
//! the size accounting: when the total weight passes the configured budget an
//! entry is evicted and its file is deleted by the eviction listener. Every
//! write gets a fresh uuid, so a late eviction never deletes a refill. Files
//! are written to a `.partial` sibling and renamed into place, so a crash
//! leaves at worst a stray `.partial` that the next [`ChunkCache::open`]
//! deletes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use moka::future::Cache;
use moka::notification::RemovalCause;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use super::Generation;
use crate::config::EvictionPolicy;
use crate::error::{Error, Result};

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub path_digest: String,
    pub generation: Generation,
    pub chunk_size: u64,
    pub index: u64,
}

impl ChunkKey {
    pub fn new(path: &str, generation: Generation, chunk_size: u64, index: u64) -> Self {
        Self {
            path_digest: path_digest(path),
            generation,
            chunk_size,
            index,
        }
    }

    fn fresh_file_name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.generation.token(),
            self.chunk_size,
            self.index,
            uuid::Uuid::new_v4().simple()
        )
    }

    fn parse(path_digest: &str, file_name: &str) -> Option<Self> {
        let mut parts = file_name.split('-');
        let generation = Generation::parse_token(parts.next()?)?;
        let chunk_size = parts.next()?.parse().ok()?;
        let index = parts.next()?.parse().ok()?;
        uuid::Uuid::try_parse(parts.next()?).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            path_digest: path_digest.to_string(),
            generation,
            chunk_size,
            index,
        })
    }
}

#[derive(Debug, Clone)]
struct ChunkEntry {
    file: PathBuf,
    len: u64,
}

pub fn path_digest(path: &str) -> String {
    hex::encode(Sha256::digest(path.as_bytes()))
}

#[derive(Debug)]
pub struct ChunkCache {
    root: PathBuf,
    index: Cache<ChunkKey, ChunkEntry>,
}

impl ChunkCache {
    /// Open (or create) the chunk store at `root`, indexing whatever chunk
    /// files survived the previous run.
    pub async fn open<P: AsRef<Path>>(
        root: P,
        total_size: u64,
        policy: EvictionPolicy,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let eviction = match policy {
            EvictionPolicy::Lru => moka::policy::EvictionPolicy::lru(),
            EvictionPolicy::TinyLfu => moka::policy::EvictionPolicy::tiny_lfu(),
        };
        let index = Cache::builder()
            .max_capacity(total_size)
            .eviction_policy(eviction)
            .weigher(|_key: &ChunkKey, entry: &ChunkEntry| {
                entry.len.clamp(1, u32::MAX as u64) as u32
            })
            .eviction_listener(|key: Arc<ChunkKey>, entry: ChunkEntry, cause: RemovalCause| {
                if let Err(e) = std::fs::remove_file(&entry.file) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(chunk = ?key, ?cause, error = %e, "failed to delete chunk file");
                    }
                }
            })
            .build();

        let cache = Self { root, index };
        cache.rescan().await?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, digest: &str) -> PathBuf {
        self.root.join(&digest[..2]).join(digest)
    }

    async fn rescan(&self) -> Result<()> {
        let mut indexed = 0usize;
        let mut partials = 0usize;
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut digests = fs::read_dir(shard.path()).await?;
            while let Some(digest_dir) = digests.next_entry().await? {
                if !digest_dir.file_type().await?.is_dir() {
                    continue;
                }
                let Some(digest) = digest_dir.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let mut files = fs::read_dir(digest_dir.path()).await?;
                while let Some(file) = files.next_entry().await? {
                    let Some(name) = file.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if name.ends_with(PARTIAL_SUFFIX) {
                        let _ = fs::remove_file(file.path()).await;
                        partials += 1;
                        continue;
                    }
                    let Some(key) = ChunkKey::parse(&digest, &name) else {
                        debug!(file = %file.path().display(), "ignoring unknown file in chunk dir");
                        continue;
                    };
                    let len = file.metadata().await?.len();
                    self.index
                        .insert(
                            key,
                            ChunkEntry {
                                file: file.path(),
                                len,
                            },
                        )
                        .await;
                    indexed += 1;
                }
            }
        }
        self.index.run_pending_tasks().await;
        info!(
            root = %self.root.display(),
            indexed, partials, "chunk cache opened"
        );
        Ok(())
    }

    /// Return chunk `index` of `path`, calling `fetch` on a miss. Concurrent
    /// misses on the same chunk share one fetch. When `expected_len` is given
    /// a fetch that returns a different length is rejected rather than
    /// cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        path: &str,
        generation: Generation,
        chunk_size: u64,
        index: u64,
        expected_len: Option<u64>,
        fetch: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let key = ChunkKey::new(path, generation, chunk_size, index);
        if let Some(entry) = self.index.get(&key).await {
            match fs::read(&entry.file).await {
                Ok(data) if data.len() as u64 == entry.len => {
                    debug!(path, index, "chunk hit");
                    return Ok(Bytes::from(data));
                }
                _ => {
                    warn!(path, index, "chunk file missing or truncated, refetching");
                    self.index.invalidate(&key).await;
                }
            }
        }

        let mut fetched: Option<Bytes> = None;
        let init = async {
            let data = fetch().await?;
            if let Some(want) = expected_len {
                if data.len() as u64 != want {
                    return Err(Error::Backend(format!(
                        "short read of {path} chunk {index}: want {want} bytes, got {}",
                        data.len()
                    )));
                }
            }
            let entry = self.write_chunk(&key, &data).await?;
            fetched = Some(data);
            Ok::<_, Error>(entry)
        };
        let entry = self
            .index
            .try_get_with(key.clone(), init)
            .await
            .map_err(|e| unshare(path, e))?;

        if let Some(data) = fetched {
            debug!(path, index, len = data.len(), "chunk fetched");
            return Ok(data);
        }
        // Another caller did the fetch.
        match fs::read(&entry.file).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) => {
                self.index.invalidate(&key).await;
                Err(Error::from_io(path, e))
            }
        }
    }

    async fn write_chunk(&self, key: &ChunkKey, data: &[u8]) -> Result<ChunkEntry> {
        let dir = self.dir_for(&key.path_digest);
        fs::create_dir_all(&dir).await?;
        let name = key.fresh_file_name();
        let file = dir.join(&name);
        let tmp = dir.join(format!("{name}{PARTIAL_SUFFIX}"));
        fs::write(&tmp, data).await?;
        if let Err(e) = fs::rename(&tmp, &file).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(ChunkEntry {
            file,
            len: data.len() as u64,
        })
    }

    /// Whether chunk `index` of `path` at `generation` is cached.
    pub fn contains(&self, path: &str, generation: Generation, chunk_size: u64, index: u64) -> bool {
        self.index
            .contains_key(&ChunkKey::new(path, generation, chunk_size, index))
    }

    /// Number of cached chunks of `path`, any generation.
    pub fn chunk_count(&self, path: &str) -> usize {
        let digest = path_digest(path);
        self.index
            .iter()
            .filter(|(key, _)| key.path_digest == digest)
            .count()
    }

    /// Drop every cached chunk of `path`.
    pub async fn purge(&self, path: &str) -> Result<()> {
        let digest = path_digest(path);
        let keys: Vec<Arc<ChunkKey>> = self
            .index
            .iter()
            .filter(|(key, _)| key.path_digest == digest)
            .map(|(key, _)| key)
            .collect();
        let purged = keys.len();
        for key in keys {
            self.index.invalidate(key.as_ref()).await;
        }
        match fs::remove_dir_all(self.dir_for(&digest)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if purged > 0 {
            debug!(path, purged, "purged chunks");
        }
        Ok(())
    }

    /// Flush moka's pending maintenance, including evictions.
    pub async fn run_pending_tasks(&self) {
        self.index.run_pending_tasks().await;
    }

    /// Bytes accounted to cached chunks.
    pub fn weighted_size(&self) -> u64 {
        self.index.weighted_size()
    }

    pub fn entry_count(&self) -> u64 {
        self.index.entry_count()
    }
}

fn unshare(path: &str, e: Arc<Error>) -> Error {
    match Arc::try_unwrap(e) {
        Ok(e) => e,
        Err(shared) if shared.is_not_found() => Error::NotFound(path.to_string()),
        Err(shared) => match shared.as_ref() {
            Error::Offline(msg) => Error::Offline(msg.clone()),
            other => Error::Backend(other.to_string()),
        },
    }
}
