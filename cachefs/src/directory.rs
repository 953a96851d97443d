//! Directory proxy backed by a directory record holding the last listing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::backend::{EntryInfo, EntryKind};
use crate::clock::to_nanos;
use crate::error::Result;
use crate::fs::{Shared, Source};
use crate::meta::{DirectoryRecord, ObjectRecord, expired_ts};
use crate::path;

pub struct CachedDirectory {
    shared: Arc<Shared>,
    path: String,
    record: Mutex<Option<DirectoryRecord>>,
}

impl std::fmt::Debug for CachedDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDirectory")
            .field("path", &self.path)
            .finish()
    }
}

impl CachedDirectory {
    pub(crate) fn new(shared: Arc<Shared>, path: String) -> Self {
        Self {
            shared,
            path,
            record: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn record(&self) -> Option<DirectoryRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_record(&self, rec: Option<DirectoryRecord>) {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = rec;
    }

    async fn load(&self) -> Option<DirectoryRecord> {
        match self.shared.store.get_dir(&self.path).await {
            Ok(Some(rec)) => {
                self.set_record(Some(rec.clone()));
                Some(rec)
            }
            Ok(None) => self.record(),
            Err(e) => {
                warn!(path = %self.path, error = %e, "failed to load directory record");
                self.record()
            }
        }
    }

    fn is_fresh(&self, rec: &DirectoryRecord) -> bool {
        rec.entries.is_some()
            && !rec.is_expired(self.shared.now(), self.shared.config.info_age)
            && !self.shared.notifier.is_notified(&self.path)
    }

    /// Children of this directory, from the cached listing while it is fresh.
    pub async fn read_dir_all(&self) -> Result<Vec<EntryInfo>> {
        let rec = self.load().await;
        if let Some(rec) = &rec {
            if self.is_fresh(rec) {
                debug!(path = %self.path, "listing hit");
                return Ok(rec.entries.clone().unwrap_or_default());
            }
        }
        self.refresh(rec.map(|r| r.cache_ts)).await
    }

    async fn refresh(&self, observed: Option<DateTime<Utc>>) -> Result<Vec<EntryInfo>> {
        let _guard = self.shared.locks.lock(&self.path).await;
        let stored = match self.shared.store.get_dir(&self.path).await {
            Ok(rec) => rec,
            Err(e) => {
                warn!(path = %self.path, error = %e, "failed to load directory record");
                self.record()
            }
        };
        if let Some(rec) = &stored {
            if observed.is_none_or(|ts| rec.cache_ts > ts) && self.is_fresh(rec) {
                debug!(path = %self.path, "adopting concurrent listing");
                self.set_record(stored.clone());
                return Ok(rec.entries.clone().unwrap_or_default());
            }
        }

        let started = self.shared.now();
        let mark = self.shared.notifier.watermark();
        let origin_listing = self.shared.origin.list(&self.path).await;
        let staged = self.staged_children().await;
        let mut by_name: BTreeMap<String, EntryInfo> = BTreeMap::new();
        match origin_listing {
            Ok(entries) => {
                for entry in entries {
                    by_name.insert(entry.name(), entry);
                }
            }
            // A directory created only by staged writes is not on the origin yet.
            Err(e) if e.is_not_found() && !staged.is_empty() => {}
            Err(e) => {
                if let Some(entries) = stored.and_then(|r| r.entries) {
                    warn!(path = %self.path, error = %e, "listing failed, serving cached listing");
                    return Ok(entries);
                }
                return Err(e);
            }
        }
        for entry in staged {
            by_name.insert(entry.name(), entry);
        }
        let entries: Vec<EntryInfo> = by_name.into_values().collect();

        self.record_children(&entries, started).await;

        let mut rec =
            stored.unwrap_or_else(|| DirectoryRecord::new(&self.path, started, 0, started));
        if let Ok(info) = self.shared.origin.stat(&self.path).await {
            rec.mod_time = to_nanos(info.mod_time);
            rec.size = info.size;
        }
        rec.cache_ts = started;
        rec.entries = Some(entries.clone());
        if let Err(e) = self.shared.store.put_dir(&rec).await {
            error!(path = %self.path, error = %e, "failed to persist listing");
        }
        self.shared.notifier.consume(&self.path, mark);
        self.set_record(Some(rec));
        debug!(path = %self.path, entries = entries.len(), "listing refreshed");
        Ok(entries)
    }

    /// Entries of staged files directly below this directory, plus
    /// directories that only exist because of deeper staged files.
    async fn staged_children(&self) -> Vec<EntryInfo> {
        let Ok(staging) = self.shared.staging() else {
            return Vec::new();
        };
        let pending = match self.shared.ledger.list().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(path = %self.path, error = %e, "failed to read pending uploads");
                return Vec::new();
            }
        };
        let mut out: BTreeMap<String, EntryInfo> = BTreeMap::new();
        for entry in pending {
            if !path::is_descendant(&entry.path, &self.path) {
                continue;
            }
            let rest = if self.path == "/" {
                &entry.path[1..]
            } else {
                &entry.path[self.path.len() + 1..]
            };
            match rest.split_once('/') {
                None => match staging.stat(&entry.path).await {
                    Ok(info) => {
                        out.insert(info.name(), info);
                    }
                    Err(e) => debug!(path = %entry.path, error = %e, "staged file unreadable"),
                },
                Some((dir, _)) => {
                    let child = path::join(&self.path, dir);
                    out.entry(dir.to_string()).or_insert_with(|| EntryInfo {
                        path: child,
                        kind: EntryKind::Directory,
                        size: 0,
                        mod_time: entry.staged_at,
                        storable: true,
                    });
                }
            }
        }
        out.into_values().collect()
    }

    /// Persist a record for every file child so a lookup after a listing is
    /// a cache hit. Records written at or after `started` may be newer than
    /// this listing and are left alone.
    async fn record_children(&self, entries: &[EntryInfo], started: DateTime<Utc>) {
        for entry in entries.iter().filter(|e| !e.is_dir()) {
            let _guard = self.shared.locks.lock(&entry.path).await;
            let source = match self.shared.pending(&entry.path).await {
                Ok(Some(_)) => Source::Staging,
                Ok(None) => Source::Origin,
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "failed to read pending upload");
                    continue;
                }
            };
            let rec = match self.shared.store.get_object(&entry.path).await {
                Ok(Some(rec)) if rec.cache_ts >= started => continue,
                Ok(Some(mut rec)) => {
                    if rec.apply(entry, started) {
                        if let Err(e) = self.shared.chunks.purge(&entry.path).await {
                            warn!(path = %entry.path, error = %e, "failed to purge chunks");
                        }
                    }
                    rec.cache_type = source.cache_type();
                    rec
                }
                Ok(None) => ObjectRecord::from_entry(entry, source.cache_type(), started),
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "failed to load object record");
                    continue;
                }
            };
            self.shared.persist_object(&rec).await;
        }
    }

    /// Force the next listing to go to the origin.
    pub async fn expire(&self) -> Result<()> {
        self.shared
            .notifier
            .notify(&self.path, EntryKind::Directory);
        self.shared.store.expire_dir(&self.path).await?;
        if let Some(rec) = self.record.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            rec.cache_ts = expired_ts();
        }
        debug!(path = %self.path, "listing expired");
        Ok(())
    }

    async fn attributes(&self) -> Option<DirectoryRecord> {
        if let Err(e) = self.read_dir_all().await {
            warn!(path = %self.path, error = %e, "refresh failed, serving cached attributes");
        }
        self.record()
    }

    pub async fn mod_time(&self) -> DateTime<Utc> {
        self.attributes()
            .await
            .map(|r| r.mod_time())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub async fn size(&self) -> i64 {
        self.attributes().await.map(|r| r.size).unwrap_or(0)
    }
}
