//! The cache front: one instance owns the store, chunk cache, ledger,
//! notifier, lock table and background tasks, and hands out proxies.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, ChangeEvent, EntryKind};
use crate::chunk::{ChunkCache, ChunkLayout};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::directory::CachedDirectory;
use crate::error::{Error, Result};
use crate::locks::PathLocks;
use crate::meta::{CacheType, MetaStore, ObjectRecord};
use crate::notify::ChangeNotifier;
use crate::object::CachedObject;
use crate::path;
use crate::upload::{PauseGate, PauseGuard, PendingUpload, UploadLedger, UploadWorker};

/// Which backend currently holds the authoritative copy of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Origin,
    Staging,
}

impl Source {
    pub fn cache_type(&self) -> CacheType {
        match self {
            Source::Origin => CacheType::InCache,
            Source::Staging => CacheType::PendingUpload,
        }
    }
}

/// State shared by the front, the proxies and the background tasks.
#[derive(Debug)]
pub(crate) struct Shared {
    pub origin: Arc<dyn Backend>,
    pub staging: Option<Arc<dyn Backend>>,
    pub store: MetaStore,
    pub ledger: UploadLedger,
    pub chunks: Arc<ChunkCache>,
    pub notifier: ChangeNotifier,
    pub locks: PathLocks,
    pub gate: Arc<PauseGate>,
    pub clock: Arc<dyn Clock>,
    pub config: CacheConfig,
    pub layout: ChunkLayout,
    pub wake: Notify,
    pub cancel: CancellationToken,
}

impl Shared {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn write_back(&self) -> bool {
        self.staging.is_some()
    }

    pub fn staging(&self) -> Result<&Arc<dyn Backend>> {
        self.staging
            .as_ref()
            .ok_or_else(|| Error::Backend("write-back is not enabled".to_string()))
    }

    pub fn backend(&self, source: Source) -> &Arc<dyn Backend> {
        match (source, &self.staging) {
            (Source::Staging, Some(staging)) => staging,
            _ => &self.origin,
        }
    }

    /// Ledger entry of `path`, if write-back is on and the path is staged.
    pub async fn pending(&self, p: &str) -> Result<Option<PendingUpload>> {
        if !self.write_back() {
            return Ok(None);
        }
        self.ledger.get(p).await
    }

    pub async fn source_of(&self, p: &str) -> Result<(Source, Option<PendingUpload>)> {
        let pending = self.pending(p).await?;
        let source = if pending.is_some() {
            Source::Staging
        } else {
            Source::Origin
        };
        Ok((source, pending))
    }

    /// Refuse to touch a path whose upload is in flight.
    pub fn ensure_idle(p: &str, pending: Option<&PendingUpload>) -> Result<()> {
        if pending.is_some_and(|e| e.started) {
            return Err(Error::Busy(p.to_string()));
        }
        Ok(())
    }

    /// Pause the worker if write-back is on.
    pub async fn pause(&self) -> Option<PauseGuard> {
        if self.write_back() {
            Some(self.gate.pause().await)
        } else {
            None
        }
    }

    /// Force the next listing of `dir` to go to the source. The notification
    /// outlives a listing that is already in flight.
    pub async fn expire_dir(&self, dir: &str) {
        self.notifier.notify(dir, EntryKind::Directory);
        if let Err(e) = self.store.expire_dir(dir).await {
            error!(dir, error = %e, "failed to expire directory");
        }
    }

    pub async fn expire_parent(&self, p: &str) {
        self.expire_dir(&path::parent(p)).await;
    }

    /// Drop the record and every cached chunk of `path`.
    pub async fn forget_object(&self, p: &str) {
        if let Err(e) = self.store.remove_object(p).await {
            error!(path = p, error = %e, "failed to remove object record");
        }
        if let Err(e) = self.chunks.purge(p).await {
            error!(path = p, error = %e, "failed to purge chunks");
        }
    }

    pub async fn persist_object(&self, rec: &ObjectRecord) {
        if let Err(e) = self.store.put_object(rec).await {
            error!(path = %rec.path(), error = %e, "failed to persist object record");
        }
    }

    /// Tell upstream listeners about a local mutation, unless the origin
    /// reports its own changes.
    pub fn announce(&self, p: &str, kind: EntryKind) {
        if !self.origin.supports_change_notify() {
            self.notifier.notify_upstream(p, kind);
        }
    }

    /// Out-of-band change of `path`.
    pub async fn invalidate(&self, p: &str, kind: EntryKind) {
        match kind {
            EntryKind::File => {
                self.notifier.notify(p, kind);
                self.expire_parent(p).await;
            }
            EntryKind::Directory => self.expire_dir(p).await,
        }
    }

    /// Remove `path` from `backend`, ignoring a missing file.
    pub async fn remove_quietly(&self, backend: &Arc<dyn Backend>, p: &str) {
        match backend.remove(p).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(path = p, backend = backend.name(), error = %e, "remove failed"),
        }
    }
}

pub struct CacheFsBuilder {
    origin: Arc<dyn Backend>,
    staging: Option<Arc<dyn Backend>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    start_worker: bool,
}

impl CacheFsBuilder {
    /// Enable write-back through `staging`.
    pub fn staging(mut self, staging: Arc<dyn Backend>) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Do not spawn the upload worker; uploads then only happen through
    /// [`CacheFs::flush_uploads`].
    pub fn without_worker(mut self) -> Self {
        self.start_worker = false;
        self
    }

    pub async fn build(self) -> Result<CacheFs> {
        let config = self.config;
        let store = MetaStore::open(&config.db_path).await?;
        let ledger = UploadLedger::new(&store);
        let reset = ledger.reset_all_started().await?;
        if reset > 0 {
            info!(reset, "resuming interrupted uploads");
        }
        let chunks = Arc::new(
            ChunkCache::open(&config.chunk_dir, config.chunk_total_size, config.eviction).await?,
        );

        let shared = Arc::new(Shared {
            notifier: ChangeNotifier::new(self.clock.clone(), config.info_age),
            locks: PathLocks::new(config.lock_gc_threshold),
            layout: ChunkLayout::new(config.chunk_size),
            origin: self.origin,
            staging: self.staging,
            store,
            ledger,
            chunks,
            gate: Arc::new(PauseGate::new()),
            clock: self.clock,
            config,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });

        let mut tasks = Vec::new();
        if let Some(events) = shared.origin.change_events() {
            tasks.push(tokio::spawn(forward_changes(shared.clone(), events)));
        }
        if shared.write_back() && self.start_worker {
            tasks.push(tokio::spawn(UploadWorker::new(shared.clone()).run()));
        }
        info!(
            origin = shared.origin.name(),
            staging = shared.staging.as_ref().map(|s| s.name()),
            db = %shared.config.db_path.display(),
            "cache ready"
        );
        Ok(CacheFs {
            shared,
            tasks: Mutex::new(tasks),
        })
    }
}

async fn forward_changes(shared: Arc<Shared>, mut events: broadcast::Receiver<ChangeEvent>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            ev = events.recv() => match ev {
                Ok(ev) => {
                    debug!(path = %ev.path, kind = ?ev.kind, "origin change");
                    shared.invalidate(&path::clean(&ev.path), ev.kind).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "change feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

pub struct CacheFs {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CacheFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFs")
            .field("origin", &self.shared.origin.name())
            .field("write_back", &self.shared.write_back())
            .finish()
    }
}

impl CacheFs {
    pub fn builder(origin: Arc<dyn Backend>) -> CacheFsBuilder {
        CacheFsBuilder {
            origin,
            staging: None,
            config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
            start_worker: true,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &MetaStore {
        &self.shared.store
    }

    pub fn chunks(&self) -> &Arc<ChunkCache> {
        &self.shared.chunks
    }

    pub fn origin(&self) -> &Arc<dyn Backend> {
        &self.shared.origin
    }

    /// Proxy for the file at `path`. A path without a record is looked up
    /// (in staging if it is a pending upload) and recorded.
    pub async fn object(&self, p: &str) -> Result<CachedObject> {
        let p = path::clean_file(p)?;
        match self.shared.store.get_object(&p).await {
            Ok(Some(rec)) => return Ok(CachedObject::with_record(self.shared.clone(), rec, false)),
            Ok(None) => {}
            Err(e) => error!(path = %p, error = %e, "failed to read object record"),
        }

        let _guard = self.shared.locks.lock(&p).await;
        if let Ok(Some(rec)) = self.shared.store.get_object(&p).await {
            return Ok(CachedObject::with_record(self.shared.clone(), rec, false));
        }
        let (source, _) = self.shared.source_of(&p).await?;
        let info = self.shared.backend(source).stat(&p).await?;
        if info.is_dir() {
            return Err(Error::IsADirectory(p));
        }
        let rec = ObjectRecord::from_entry(&info, source.cache_type(), self.shared.now());
        self.shared.persist_object(&rec).await;
        debug!(path = %p, ?source, "object recorded");
        Ok(CachedObject::with_record(self.shared.clone(), rec, true))
    }

    /// Proxy for the directory at `path`; nothing is fetched until it is used.
    pub async fn directory(&self, p: &str) -> Result<CachedDirectory> {
        Ok(CachedDirectory::new(self.shared.clone(), path::clean(p)))
    }

    /// Create or replace the file at `path`. With write-back the content
    /// lands in staging and is uploaded later.
    pub async fn put(&self, p: &str, data: Bytes, mod_time: DateTime<Utc>) -> Result<CachedObject> {
        let p = path::clean_file(p)?;
        let target = if self.shared.write_back() {
            Source::Staging
        } else {
            Source::Origin
        };
        let obj = CachedObject::unresolved(self.shared.clone(), p);
        obj.write(data, mod_time, Some(target)).await?;
        Ok(obj)
    }

    pub async fn mkdir(&self, p: &str) -> Result<CachedDirectory> {
        let p = path::clean(p);
        self.shared.origin.mkdir(&p).await?;
        if p != "/" {
            self.shared.expire_parent(&p).await;
            self.shared
                .announce(&path::parent(&p), EntryKind::Directory);
        }
        Ok(CachedDirectory::new(self.shared.clone(), p))
    }

    /// Remove an empty directory. Staged files below it count as content.
    pub async fn rmdir(&self, p: &str) -> Result<()> {
        let p = path::clean_file(p)?;
        if self.shared.write_back() {
            let staged = self
                .shared
                .ledger
                .list()
                .await?
                .into_iter()
                .any(|e| path::is_descendant(&e.path, &p));
            if staged {
                return Err(Error::DirectoryNotEmpty(p));
            }
        }
        let _guard = self.shared.locks.lock(&p).await;
        self.shared.origin.rmdir(&p).await?;
        if let Some(staging) = &self.shared.staging {
            if let Err(e) = staging.rmdir(&p).await {
                if !e.is_not_found() {
                    warn!(path = %p, error = %e, "failed to remove staged directory");
                }
            }
        }
        if let Err(e) = self.shared.store.remove_dir(&p).await {
            error!(path = %p, error = %e, "failed to remove directory records");
        }
        self.shared.expire_parent(&p).await;
        self.shared.announce(&path::parent(&p), EntryKind::Directory);
        Ok(())
    }

    /// Move a file. Both parent listings are expired.
    pub async fn rename(&self, from: &str, to: &str) -> Result<CachedObject> {
        let from = path::clean_file(from)?;
        let to = path::clean_file(to)?;
        if from == to {
            return self.object(&to).await;
        }

        let _pause = self.shared.pause().await;
        let (first, second) = if from < to { (&from, &to) } else { (&to, &from) };
        let _g1 = self.shared.locks.lock(first).await;
        let _g2 = self.shared.locks.lock(second).await;

        let from_pending = self.shared.pending(&from).await?;
        let to_pending = self.shared.pending(&to).await?;
        Shared::ensure_idle(&from, from_pending.as_ref())?;
        Shared::ensure_idle(&to, to_pending.as_ref())?;

        let now = self.shared.now();
        let (info, source) = if from_pending.is_some() {
            let staging = self.shared.staging()?;
            let info = staging.rename(&from, &to).await?;
            self.shared.ledger.remove(&from).await?;
            self.shared.ledger.add(&to, now).await?;
            // An older copy of the source may already be on the origin.
            self.shared
                .remove_quietly(&self.shared.origin, &from)
                .await;
            (info, Source::Staging)
        } else {
            let info = self.shared.origin.rename(&from, &to).await?;
            if to_pending.is_some() {
                self.shared.ledger.remove(&to).await?;
                if let Ok(staging) = self.shared.staging() {
                    self.shared.remove_quietly(staging, &to).await;
                }
            }
            (info, Source::Origin)
        };

        self.shared.forget_object(&from).await;
        self.shared.forget_object(&to).await;
        let mut rec = ObjectRecord::from_entry(&info, source.cache_type(), now);
        (rec.dir, rec.name) = path::split(&to);
        self.shared.persist_object(&rec).await;

        let from_dir = path::parent(&from);
        let to_dir = path::parent(&to);
        self.shared.expire_dir(&from_dir).await;
        self.shared.notifier.notify(&from, EntryKind::File);
        self.shared.announce(&from_dir, EntryKind::Directory);
        if to_dir != from_dir {
            self.shared.expire_dir(&to_dir).await;
            self.shared.announce(&to_dir, EntryKind::Directory);
        }
        if source == Source::Staging {
            self.shared.wake.notify_one();
        }
        info!(from = %from, to = %to, "renamed");
        Ok(CachedObject::with_record(self.shared.clone(), rec, true))
    }

    /// Feed an out-of-band change into the cache, forcing the next access
    /// of `path` to go to the source.
    pub async fn invalidate(&self, p: &str, kind: EntryKind) {
        self.shared.invalidate(&path::clean(p), kind).await;
    }

    pub fn is_notified(&self, p: &str) -> bool {
        self.shared.notifier.is_notified(&path::clean(p))
    }

    /// Changes made through this cache, for layers above it.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.shared.notifier.subscribe()
    }

    /// Keep the upload worker from starting new uploads while the guard lives.
    pub async fn pause(&self) -> PauseGuard {
        self.shared.gate.pause().await
    }

    pub async fn pending_uploads(&self) -> Result<Vec<PendingUpload>> {
        self.shared.ledger.list().await
    }

    pub async fn pending_upload(&self, p: &str) -> Result<Option<PendingUpload>> {
        self.shared.ledger.get(&path::clean(p)).await
    }

    /// Nudge the worker to look at the ledger now.
    pub fn wake_uploader(&self) {
        self.shared.wake.notify_one();
    }

    /// Upload every staged file right away, ignoring `upload_wait`.
    /// Returns how many were delivered.
    pub async fn flush_uploads(&self) -> Result<usize> {
        UploadWorker::new(self.shared.clone())
            .sweep_ready(DateTime::<Utc>::MAX_UTC)
            .await
    }

    /// Resolve once the ledger is empty. Never resolves while an upload keeps
    /// failing under [`crate::RetryPolicy::Forever`]; wrap it in a timeout.
    pub async fn wait_for_uploads(&self) -> Result<()> {
        loop {
            if self.shared.ledger.is_empty().await? {
                return Ok(());
            }
            self.shared.wake.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Record every file in staging that has no ledger entry, e.g. left by a
    /// process that died between writing and recording. Returns how many
    /// were added.
    pub async fn reconcile_staging(&self) -> Result<usize> {
        let Some(staging) = self.shared.staging.clone() else {
            return Ok(0);
        };
        let mut added = 0;
        let mut dirs = vec!["/".to_string()];
        while let Some(dir) = dirs.pop() {
            let entries = match staging.list(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                if entry.is_dir() {
                    dirs.push(entry.path);
                    continue;
                }
                let _guard = self.shared.locks.lock(&entry.path).await;
                if self.shared.ledger.contains(&entry.path).await? {
                    continue;
                }
                let now = self.shared.now();
                self.shared.ledger.add(&entry.path, now).await?;
                self.shared.chunks.purge(&entry.path).await?;
                self.shared
                    .persist_object(&ObjectRecord::from_entry(
                        &entry,
                        CacheType::PendingUpload,
                        now,
                    ))
                    .await;
                self.shared.expire_parent(&entry.path).await;
                info!(path = %entry.path, "recovered staged file");
                added += 1;
            }
        }
        if added > 0 {
            self.shared.wake.notify_one();
        }
        Ok(added)
    }

    /// Stop background tasks and close the database.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.shared.store.pool().close().await;
        info!("cache shut down");
    }
}

impl Drop for CacheFs {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
