//! Persisted records and their SQLite row forms.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::backend::{EntryInfo, Hashes};
use crate::chunk::Generation;
use crate::clock::{from_nanos, to_nanos};
use crate::error::{Error, Result};
use crate::path;

/// Whether the authoritative copy of an object is the origin or staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    /// Mirrors the origin.
    InCache,
    /// Written locally, not yet uploaded.
    PendingUpload,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::InCache => "in_cache",
            CacheType::PendingUpload => "pending_upload",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_cache" => Ok(CacheType::InCache),
            "pending_upload" => Ok(CacheType::PendingUpload),
            other => Err(Error::Backend(format!("unknown cache type {other:?}"))),
        }
    }
}

/// Time stamp marking a record as expired regardless of the clock.
pub fn expired_ts() -> DateTime<Utc> {
    from_nanos(i64::MIN)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub dir: String,
    pub name: String,
    /// Modification time in nanoseconds since the epoch.
    pub mod_time: i64,
    pub size: i64,
    pub storable: bool,
    pub cache_type: CacheType,
    /// When this record was last confirmed against its source.
    pub cache_ts: DateTime<Utc>,
    pub hashes: Hashes,
}

impl ObjectRecord {
    pub fn from_entry(info: &EntryInfo, cache_type: CacheType, now: DateTime<Utc>) -> Self {
        let (dir, name) = path::split(&info.path);
        Self {
            dir,
            name,
            mod_time: to_nanos(info.mod_time),
            size: info.size,
            storable: info.storable,
            cache_type,
            cache_ts: now,
            hashes: Hashes::new(),
        }
    }

    pub fn path(&self) -> String {
        path::join(&self.dir, &self.name)
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        from_nanos(self.mod_time)
    }

    pub fn generation(&self) -> Generation {
        Generation::new(self.mod_time, self.size)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        is_expired(self.cache_ts, now, ttl)
    }

    /// Take over size, time and storable from a fresh stat. Cached hashes
    /// survive only if the contents look unchanged. Returns whether the
    /// generation moved.
    pub fn apply(&mut self, info: &EntryInfo, now: DateTime<Utc>) -> bool {
        let before = self.generation();
        self.mod_time = to_nanos(info.mod_time);
        self.size = info.size;
        self.storable = info.storable;
        self.cache_ts = now;
        let changed = before != self.generation();
        if changed {
            self.hashes.clear();
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryRecord {
    pub dir: String,
    pub name: String,
    pub mod_time: i64,
    pub size: i64,
    pub cache_ts: DateTime<Utc>,
    /// Last listing; `None` until the directory has been listed.
    pub entries: Option<Vec<EntryInfo>>,
}

impl DirectoryRecord {
    pub fn new(dir_path: &str, mod_time: DateTime<Utc>, size: i64, now: DateTime<Utc>) -> Self {
        let (dir, name) = path::split(dir_path);
        Self {
            dir,
            name,
            mod_time: to_nanos(mod_time),
            size,
            cache_ts: now,
            entries: None,
        }
    }

    pub fn path(&self) -> String {
        path::join(&self.dir, &self.name)
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        from_nanos(self.mod_time)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        is_expired(self.cache_ts, now, ttl)
    }
}

fn is_expired(cache_ts: DateTime<Utc>, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(cache_ts) > ttl
}

#[derive(Debug, FromRow)]
pub(crate) struct ObjectRow {
    pub dir: String,
    pub name: String,
    pub mod_time: i64,
    pub size: i64,
    pub storable: bool,
    pub cache_type: String,
    pub cache_ts: i64,
    pub hashes: String,
}

impl TryFrom<ObjectRow> for ObjectRecord {
    type Error = Error;

    fn try_from(row: ObjectRow) -> Result<Self> {
        Ok(Self {
            dir: row.dir,
            name: row.name,
            mod_time: row.mod_time,
            size: row.size,
            storable: row.storable,
            cache_type: CacheType::parse(&row.cache_type)?,
            cache_ts: from_nanos(row.cache_ts),
            hashes: serde_json::from_str(&row.hashes)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DirectoryRow {
    pub dir: String,
    pub name: String,
    pub mod_time: i64,
    pub size: i64,
    pub cache_ts: i64,
    pub entries: Option<String>,
}

impl TryFrom<DirectoryRow> for DirectoryRecord {
    type Error = Error;

    fn try_from(row: DirectoryRow) -> Result<Self> {
        let entries = match row.entries {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Self {
            dir: row.dir,
            name: row.name,
            mod_time: row.mod_time,
            size: row.size,
            cache_ts: from_nanos(row.cache_ts),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EntryKind, HashKind};
    use std::time::Duration;

    fn entry(size: i64, secs: i64) -> EntryInfo {
        EntryInfo {
            path: "/a/b.txt".into(),
            kind: EntryKind::File,
            size,
            mod_time: DateTime::from_timestamp(secs, 0).unwrap(),
            storable: true,
        }
    }

    #[test]
    fn test_apply_keeps_hashes_for_same_generation() {
        let now = DateTime::from_timestamp(2_000_000_000, 0).unwrap();
        let mut rec = ObjectRecord::from_entry(&entry(3, 100), CacheType::InCache, now);
        assert_eq!(rec.path(), "/a/b.txt");
        rec.hashes.insert(HashKind::Md5, "x".into());

        assert!(!rec.apply(&entry(3, 100), now));
        assert_eq!(rec.hashes.len(), 1);

        assert!(rec.apply(&entry(4, 100), now));
        assert!(rec.hashes.is_empty());
    }

    #[test]
    fn test_expiry() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let rec = ObjectRecord::from_entry(&entry(1, 1), CacheType::InCache, now);
        let ttl = Duration::from_secs(60);
        assert!(!rec.is_expired(now + chrono::Duration::seconds(60), ttl));
        assert!(rec.is_expired(now + chrono::Duration::seconds(61), ttl));

        let mut dir = DirectoryRecord::new("/", now, 0, now);
        assert_eq!(dir.path(), "/");
        dir.cache_ts = expired_ts();
        assert!(dir.is_expired(from_nanos(0), ttl));
    }
}
