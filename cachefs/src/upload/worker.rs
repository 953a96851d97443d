//! Background write-back: drains the ledger into the origin.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::backend::{EntryInfo, EntryKind};
use crate::error::{Error, Result};
use crate::fs::Shared;
use crate::meta::{CacheType, ObjectRecord};

/// Single task uploading staged files once they have waited `upload_wait`.
pub struct UploadWorker {
    shared: Arc<Shared>,
}

impl UploadWorker {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub async fn run(self) {
        let poll = self.shared.config.upload_poll_interval;
        info!(origin = self.shared.origin.name(), "upload worker started");
        loop {
            if let Err(e) = self.sweep().await {
                error!(error = %e, "upload sweep failed");
            }
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                _ = self.shared.wake.notified() => {},
                _ = tokio::time::sleep(poll) => {},
            }
        }
        info!("upload worker stopped");
    }

    /// Try every entry that has waited long enough, once. Returns how many
    /// were delivered.
    pub async fn sweep(&self) -> Result<usize> {
        let wait = chrono::Duration::from_std(self.shared.config.upload_wait)
            .unwrap_or(chrono::Duration::MAX);
        let now = self.shared.now();
        let ready_before = now.checked_sub_signed(wait).unwrap_or(now);
        self.sweep_ready(ready_before).await
    }

    /// Try every entry staged no later than `ready_before`, once.
    pub async fn sweep_ready(&self, ready_before: DateTime<Utc>) -> Result<usize> {
        let mut delivered = 0;
        for entry in self.shared.ledger.ready(ready_before).await? {
            if self.shared.cancel.is_cancelled() {
                break;
            }
            if self.upload_one(&entry.path).await? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn upload_one(&self, path: &str) -> Result<bool> {
        let claimed = {
            let _claim = tokio::select! {
                claim = self.shared.gate.claim() => claim,
                _ = self.shared.cancel.cancelled() => return Ok(false),
            };
            self.shared.ledger.mark_started(path).await?
        };
        if !claimed {
            return Ok(false);
        }

        debug!(path, "uploading");
        match self.transfer(path).await {
            Ok(Some(info)) => {
                self.finish(path, &info).await;
                Ok(true)
            }
            Ok(None) => {
                warn!(path, "staged copy vanished, dropping pending upload");
                self.discard(path).await;
                Ok(false)
            }
            Err(e) => {
                self.failed(path, e).await?;
                Ok(false)
            }
        }
    }

    /// Copy the staged file to the origin. `None` if there is no staged copy.
    async fn transfer(&self, path: &str) -> Result<Option<EntryInfo>> {
        let staging = self.shared.staging()?;
        let staged = match staging.stat(path).await {
            Ok(info) => info,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let data = match staging.read(path, 0, u64::MAX).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let info = self
            .shared
            .origin
            .write(path, data, staged.mod_time)
            .await?;
        Ok(Some(info))
    }

    async fn finish(&self, path: &str, info: &EntryInfo) {
        let _guard = self.shared.locks.lock(path).await;
        if let Err(e) = self.shared.ledger.remove(path).await {
            error!(path, error = %e, "failed to clear pending upload");
        }
        if let Ok(staging) = self.shared.staging() {
            match staging.remove(path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(path, error = %e, "failed to delete staged copy"),
            }
        }

        let now = self.shared.now();
        let record = match self.shared.store.get_object(path).await {
            Ok(Some(mut rec)) => {
                rec.apply(info, now);
                rec.cache_type = CacheType::InCache;
                rec
            }
            Ok(None) => ObjectRecord::from_entry(info, CacheType::InCache, now),
            Err(e) => {
                error!(path, error = %e, "failed to load record after upload");
                ObjectRecord::from_entry(info, CacheType::InCache, now)
            }
        };
        if let Err(e) = self.shared.store.put_object(&record).await {
            error!(path, error = %e, "failed to persist record after upload");
        }
        self.shared.expire_parent(path).await;
        self.shared.notifier.notify(path, EntryKind::File);
        info!(path, size = info.size, "upload complete");
    }

    async fn failed(&self, path: &str, err: Error) -> Result<()> {
        let Some(attempts) = self.shared.ledger.mark_failed(path).await? else {
            return Ok(());
        };
        if self.shared.config.retry.should_abandon(attempts) {
            let abandoned = Error::UploadAbandoned {
                path: path.to_string(),
                attempts,
            };
            error!(path, cause = %err, "{abandoned}");
            self.discard(path).await;
        } else {
            warn!(path, attempts, error = %err, "upload failed, will retry");
        }
        Ok(())
    }

    /// Forget a staged file entirely: ledger, staged copy, record, chunks.
    async fn discard(&self, path: &str) {
        let _guard = self.shared.locks.lock(path).await;
        if let Err(e) = self.shared.ledger.remove(path).await {
            error!(path, error = %e, "failed to clear pending upload");
        }
        if let Ok(staging) = self.shared.staging() {
            if let Err(e) = staging.remove(path).await {
                if !e.is_not_found() {
                    warn!(path, error = %e, "failed to delete staged copy");
                }
            }
        }
        self.shared.forget_object(path).await;
        self.shared.expire_parent(path).await;
        self.shared.notifier.notify(path, EntryKind::File);
        debug!(path, "pending upload discarded");
    }
}
