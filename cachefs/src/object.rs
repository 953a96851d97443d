//! File proxy backed by an object record.
//!
//! Attribute accessors answer from the record and refresh it lazily: only
//! when it is older than `info_age` or the path was notified. Every refresh
//! and mutation of one path runs under that path's lock; a caller that waited
//! on the lock while another refreshed adopts the stored result instead of
//! asking the source again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::{EntryKind, HashKind, UNKNOWN_SIZE};
use crate::chunk::{CachedReader, OpenOption};
use crate::clock::to_nanos;
use crate::error::{Error, Result};
use crate::fs::{Shared, Source};
use crate::meta::ObjectRecord;
use crate::path;

pub struct CachedObject {
    shared: Arc<Shared>,
    path: String,
    record: Mutex<Option<ObjectRecord>>,
    /// Set once this proxy resolved the path against its source.
    live: AtomicBool,
}

impl std::fmt::Debug for CachedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedObject")
            .field("path", &self.path)
            .field("record", &self.record())
            .finish()
    }
}

impl CachedObject {
    pub(crate) fn with_record(shared: Arc<Shared>, rec: ObjectRecord, live: bool) -> Self {
        Self {
            shared,
            path: rec.path(),
            record: Mutex::new(Some(rec)),
            live: AtomicBool::new(live),
        }
    }

    pub(crate) fn unresolved(shared: Arc<Shared>, path: String) -> Self {
        Self {
            shared,
            path,
            record: Mutex::new(None),
            live: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> String {
        path::split(&self.path).1
    }

    /// Last record this proxy saw, without refreshing.
    pub fn record(&self) -> Option<ObjectRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_record(&self, rec: Option<ObjectRecord>) {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = rec;
    }

    /// Current record from the store; the last seen one if the store fails.
    async fn load(&self) -> Option<ObjectRecord> {
        match self.shared.store.get_object(&self.path).await {
            Ok(rec) => {
                if rec.is_some() {
                    self.set_record(rec.clone());
                }
                rec.or_else(|| self.record())
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "failed to load object record");
                self.record()
            }
        }
    }

    async fn refresh_quietly(&self) -> Option<ObjectRecord> {
        if let Err(e) = self.refresh().await {
            warn!(path = %self.path, error = %e, "refresh failed, serving cached attributes");
        }
        self.record()
    }

    pub async fn mod_time(&self) -> DateTime<Utc> {
        self.refresh_quietly()
            .await
            .map(|r| r.mod_time())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub async fn size(&self) -> i64 {
        self.refresh_quietly()
            .await
            .map(|r| r.size)
            .unwrap_or(UNKNOWN_SIZE)
    }

    pub async fn storable(&self) -> bool {
        self.refresh_quietly()
            .await
            .map(|r| r.storable)
            .unwrap_or(false)
    }

    /// Refresh from the source if the record expired or the path was
    /// notified; otherwise a no-op.
    pub async fn refresh(&self) -> Result<()> {
        let rec = self.load().await;
        let expired = rec
            .as_ref()
            .is_none_or(|r| r.is_expired(self.shared.now(), self.shared.config.info_age));
        let notified = self.shared.notifier.is_notified(&self.path);
        if !expired && !notified {
            return Ok(());
        }
        self.refresh_inner(true, rec.map(|r| r.cache_ts)).await
    }

    /// Re-resolve the path against its source. Without `force`, a proxy that
    /// already resolved it returns at once.
    pub async fn refresh_from_source(&self, force: bool) -> Result<()> {
        let observed = self.record().map(|r| r.cache_ts);
        self.refresh_inner(force, observed).await
    }

    async fn refresh_inner(&self, force: bool, observed: Option<DateTime<Utc>>) -> Result<()> {
        let _guard = self.shared.locks.lock(&self.path).await;
        if !force && self.live.load(Ordering::SeqCst) {
            return Ok(());
        }

        let now = self.shared.now();
        let stored = match self.shared.store.get_object(&self.path).await {
            Ok(rec) => rec,
            Err(e) => {
                warn!(path = %self.path, error = %e, "failed to load object record");
                self.record()
            }
        };
        if let Some(rec) = &stored {
            let newer = observed.is_none_or(|ts| rec.cache_ts > ts);
            if newer
                && !rec.is_expired(now, self.shared.config.info_age)
                && !self.shared.notifier.is_notified(&self.path)
            {
                debug!(path = %self.path, "adopting concurrent refresh");
                self.set_record(stored);
                self.live.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }

        let mark = self.shared.notifier.watermark();
        let (source, _) = self.shared.source_of(&self.path).await?;
        match self.shared.backend(source).stat(&self.path).await {
            Ok(info) if info.is_dir() => Err(Error::IsADirectory(self.path.clone())),
            Ok(info) => {
                let mut rec = stored
                    .unwrap_or_else(|| ObjectRecord::from_entry(&info, source.cache_type(), now));
                if rec.apply(&info, now) {
                    debug!(path = %self.path, "contents changed, dropping chunks");
                    if let Err(e) = self.shared.chunks.purge(&self.path).await {
                        warn!(path = %self.path, error = %e, "failed to purge chunks");
                    }
                }
                rec.cache_type = source.cache_type();
                self.shared.persist_object(&rec).await;
                self.shared.notifier.consume(&self.path, mark);
                self.set_record(Some(rec));
                self.live.store(true, Ordering::SeqCst);
                debug!(path = %self.path, ?source, "refreshed");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(path = %self.path, "gone from source, purging");
                self.shared.forget_object(&self.path).await;
                self.shared.notifier.consume(&self.path, mark);
                self.live.store(false, Ordering::SeqCst);
                Err(Error::NotFound(self.path.clone()))
            }
            Err(e) => {
                warn!(path = %self.path, ?source, error = %e, "refresh failed");
                Err(e)
            }
        }
    }

    /// Reader over the current contents. Origin content goes through the
    /// chunk cache; staged content is read from staging directly.
    pub async fn open(&self, options: &[OpenOption]) -> Result<CachedReader> {
        self.refresh_from_source(true).await?;
        let rec = self
            .record()
            .ok_or_else(|| Error::NotFound(self.path.clone()))?;
        let (source, _) = self.shared.source_of(&self.path).await?;
        let chunks = match source {
            Source::Origin => Some(self.shared.chunks.clone()),
            Source::Staging => None,
        };
        Ok(CachedReader::new(
            self.path.clone(),
            self.shared.backend(source).clone(),
            chunks,
            self.shared.layout,
            rec.generation(),
            rec.size,
        )
        .with_options(options))
    }

    /// Replace the contents, writing to wherever the path currently lives.
    pub async fn update(&self, data: Bytes, mod_time: DateTime<Utc>) -> Result<()> {
        self.write(data, mod_time, None).await
    }

    /// Write `data` to `target`, or to the path's current source if `None`.
    pub(crate) async fn write(
        &self,
        data: Bytes,
        mod_time: DateTime<Utc>,
        target: Option<Source>,
    ) -> Result<()> {
        let _pause = self.shared.pause().await;
        let _guard = self.shared.locks.lock(&self.path).await;
        let (current, pending) = self.shared.source_of(&self.path).await?;
        Shared::ensure_idle(&self.path, pending.as_ref())?;
        let target = target.unwrap_or(current);

        let len = data.len();
        let info = self
            .shared
            .backend(target)
            .write(&self.path, data, mod_time)
            .await?;
        let now = self.shared.now();
        if target == Source::Staging {
            self.shared.ledger.add(&self.path, now).await?;
        }

        if let Err(e) = self.shared.chunks.purge(&self.path).await {
            warn!(path = %self.path, error = %e, "failed to purge chunks");
        }
        let mut rec = ObjectRecord::from_entry(&info, target.cache_type(), now);
        (rec.dir, rec.name) = path::split(&self.path);
        self.shared.persist_object(&rec).await;
        self.set_record(Some(rec));
        self.live.store(true, Ordering::SeqCst);
        self.shared.expire_parent(&self.path).await;
        if target == Source::Staging {
            self.shared.wake.notify_one();
        }
        info!(path = %self.path, size = len, ?target, "contents written");
        Ok(())
    }

    /// Delete the file from its source and from the cache.
    pub async fn remove(&self) -> Result<()> {
        self.refresh_from_source(false).await?;
        let _pause = self.shared.pause().await;
        let _guard = self.shared.locks.lock(&self.path).await;
        let pending = self.shared.pending(&self.path).await?;
        Shared::ensure_idle(&self.path, pending.as_ref())?;

        if pending.is_some() {
            self.shared.staging()?.remove(&self.path).await?;
            // A replaced file may still have an older copy on the origin.
            self.shared
                .remove_quietly(&self.shared.origin, &self.path)
                .await;
            self.shared.ledger.remove(&self.path).await?;
        } else {
            self.shared.origin.remove(&self.path).await?;
        }

        self.shared.forget_object(&self.path).await;
        self.set_record(None);
        self.live.store(false, Ordering::SeqCst);
        let parent = path::parent(&self.path);
        self.shared.expire_dir(&parent).await;
        self.shared.announce(&parent, EntryKind::Directory);
        info!(path = %self.path, "removed");
        Ok(())
    }

    /// Digest of the contents, computed by the source once per generation.
    pub async fn hash(&self, kind: HashKind) -> Result<String> {
        if let Some(rec) = self.refresh_quietly().await {
            if let Some(value) = rec.hashes.get(&kind) {
                return Ok(value.clone());
            }
        }
        self.refresh_from_source(false).await?;
        let (source, _) = self.shared.source_of(&self.path).await?;
        let value = self.shared.backend(source).hash(&self.path, kind).await?;

        let _guard = self.shared.locks.lock(&self.path).await;
        let seen = self.record().map(|r| r.generation());
        let stored = match self.shared.store.get_object(&self.path).await {
            Ok(rec) => rec,
            Err(e) => {
                warn!(path = %self.path, error = %e, "failed to load object record");
                self.record()
            }
        };
        if let Some(mut rec) = stored {
            // Only keep the digest if the contents did not move meanwhile.
            if Some(rec.generation()) == seen {
                rec.hashes.insert(kind, value.clone());
                self.shared.persist_object(&rec).await;
                self.set_record(Some(rec));
                debug!(path = %self.path, ?kind, "hash cached");
            }
        }
        Ok(value)
    }

    pub async fn set_mod_time(&self, mod_time: DateTime<Utc>) -> Result<()> {
        self.refresh_from_source(false).await?;
        let _pause = self.shared.pause().await;
        let _guard = self.shared.locks.lock(&self.path).await;
        let (source, pending) = self.shared.source_of(&self.path).await?;
        Shared::ensure_idle(&self.path, pending.as_ref())?;

        self.shared
            .backend(source)
            .set_mod_time(&self.path, mod_time)
            .await?;

        let now = self.shared.now();
        let stored = self.shared.store.get_object(&self.path).await.ok().flatten();
        if let Some(mut rec) = stored.or_else(|| self.record()) {
            rec.mod_time = to_nanos(mod_time);
            rec.cache_ts = now;
            if let Err(e) = self.shared.chunks.purge(&self.path).await {
                warn!(path = %self.path, error = %e, "failed to purge chunks");
            }
            self.shared.persist_object(&rec).await;
            self.set_record(Some(rec));
        }
        self.shared.expire_parent(&self.path).await;
        debug!(path = %self.path, %mod_time, "mod time set");
        Ok(())
    }

    /// Whether the path is waiting in staging.
    pub async fn is_pending_upload(&self) -> Result<bool> {
        Ok(self.shared.pending(&self.path).await?.is_some())
    }
}
