//! Storage backends the cache sits on top of.
//!
//! The origin (authoritative remote) and the staging area (fast local disk
//! absorbing writes) implement the same [`Backend`] contract. Paths handed to
//! a backend are always cleaned absolute paths (see [`crate::path`]).
//!
//! Submodules:
//! - `localfs`: a directory on local disk, the default staging backend
//! - `memory`: an in-process backend with call counters and fault injection

pub mod localfs;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::path;

pub use localfs::LocalFsBackend;
pub use memory::{MemoryBackend, Op};

/// Size reported for entries whose size is not known.
pub const UNKNOWN_SIZE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Md5,
    Sha256,
}

impl HashKind {
    pub fn all() -> [HashKind; 2] {
        [HashKind::Md5, HashKind::Sha256]
    }

    /// Hex digest of `data`.
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            HashKind::Md5 => format!("{:x}", md5::compute(data)),
            HashKind::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

pub type Hashes = BTreeMap<HashKind, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// What a backend knows about one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub path: String,
    pub kind: EntryKind,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub storable: bool,
}

impl EntryInfo {
    pub fn name(&self) -> String {
        path::split(&self.path).1
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A path that changed, as seen by whoever reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: EntryKind,
}

#[async_trait]
pub trait Backend: Send + Sync + Debug {
    /// Human readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Look up a single path. Missing paths yield `Error::NotFound`.
    async fn stat(&self, path: &str) -> Result<EntryInfo>;

    /// Direct children of `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<EntryInfo>>;

    /// Read at most `len` bytes starting at `offset`. Reading past the end
    /// returns the available bytes, possibly none.
    async fn read(&self, path: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Create or replace `path`, creating missing parent directories.
    async fn write(&self, path: &str, data: Bytes, mod_time: DateTime<Utc>) -> Result<EntryInfo>;

    async fn remove(&self, path: &str) -> Result<()>;

    async fn set_mod_time(&self, path: &str, mod_time: DateTime<Utc>) -> Result<()>;

    async fn hash(&self, path: &str, kind: HashKind) -> Result<String>;

    async fn mkdir(&self, dir: &str) -> Result<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, dir: &str) -> Result<()>;

    /// Move a file. Backends without a native move get copy + remove.
    async fn rename(&self, from: &str, to: &str) -> Result<EntryInfo> {
        let info = self.stat(from).await?;
        let data = self.read(from, 0, u64::MAX).await?;
        let moved = self.write(to, data, info.mod_time).await?;
        self.remove(from).await?;
        Ok(moved)
    }

    /// Whether this backend tells its own listeners about changes, in which
    /// case the cache does not repeat them upstream.
    fn supports_change_notify(&self) -> bool {
        false
    }

    /// Feed of out-of-band changes, if the backend has one.
    fn change_events(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digests() {
        assert_eq!(
            HashKind::Md5.digest(b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            HashKind::Sha256.digest(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hashes_serialize_with_lowercase_keys() {
        let mut hashes = Hashes::new();
        hashes.insert(HashKind::Md5, "abc".into());
        let json = serde_json::to_string(&hashes).unwrap();
        assert_eq!(json, r#"{"md5":"abc"}"#);
        let back: Hashes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hashes);
    }
}
