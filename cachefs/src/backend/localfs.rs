//! Backend over a directory on local disk. Serves as the staging area for
//! write-back and, in the CLI, as the origin.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use super::{Backend, EntryInfo, EntryKind, HashKind};
use crate::error::{Error, Result};
use crate::path;

#[derive(Debug)]
pub struct LocalFsBackend {
    name: String,
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            name: format!("local:{}", root.display()),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, p: &str) -> PathBuf {
        self.root.join(p.trim_start_matches('/'))
    }

    fn info_from_meta(p: &str, meta: &std::fs::Metadata) -> EntryInfo {
        let mod_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        EntryInfo {
            path: p.to_string(),
            kind,
            size: if meta.is_dir() { 0 } else { meta.len() as i64 },
            mod_time,
            storable: true,
        }
    }

    async fn set_modified(target: PathBuf, mod_time: DateTime<Utc>) -> io::Result<()> {
        tokio::task::spawn_blocking(move || {
            let f = std::fs::File::options().write(true).open(target)?;
            f.set_modified(SystemTime::from(mod_time))
        })
        .await
        .map_err(io::Error::other)?
    }
}

#[async_trait]
impl Backend for LocalFsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, p: &str) -> Result<EntryInfo> {
        let meta = fs::metadata(self.path_for(p))
            .await
            .map_err(|e| Error::from_io(p, e))?;
        Ok(Self::info_from_meta(p, &meta))
    }

    async fn list(&self, dir: &str) -> Result<Vec<EntryInfo>> {
        let target = self.path_for(dir);
        let meta = fs::metadata(&target)
            .await
            .map_err(|e| Error::from_io(dir, e))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(dir.to_string()));
        }
        let mut out = Vec::new();
        let mut rd = fs::read_dir(&target).await?;
        while let Some(entry) = rd.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // Temporary files of an in-flight write are not entries.
            if name.ends_with(".cachefs-tmp") {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            out.push(Self::info_from_meta(&path::join(dir, &name), &meta));
        }
        Ok(out)
    }

    async fn read(&self, p: &str, offset: u64, len: u64) -> Result<Bytes> {
        let mut f = fs::File::open(self.path_for(p))
            .await
            .map_err(|e| Error::from_io(p, e))?;
        f.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        f.take(len).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, p: &str, data: Bytes, mod_time: DateTime<Utc>) -> Result<EntryInfo> {
        let target = self.path_for(p);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).await?;
        }
        // Write aside and rename so readers never see a half-written file.
        let tmp = target.with_file_name(format!(
            "{}.{}.cachefs-tmp",
            target
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file"),
            uuid::Uuid::new_v4().simple()
        ));
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        f.sync_all().await?;
        drop(f);
        Self::set_modified(tmp.clone(), mod_time).await?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        self.stat(p).await
    }

    async fn remove(&self, p: &str) -> Result<()> {
        fs::remove_file(self.path_for(p))
            .await
            .map_err(|e| Error::from_io(p, e))
    }

    async fn set_mod_time(&self, p: &str, mod_time: DateTime<Utc>) -> Result<()> {
        Self::set_modified(self.path_for(p), mod_time)
            .await
            .map_err(|e| Error::from_io(p, e))
    }

    async fn hash(&self, p: &str, kind: HashKind) -> Result<String> {
        let data = fs::read(self.path_for(p))
            .await
            .map_err(|e| Error::from_io(p, e))?;
        Ok(kind.digest(&data))
    }

    async fn mkdir(&self, dir: &str) -> Result<()> {
        fs::create_dir_all(self.path_for(dir))
            .await
            .map_err(|e| Error::from_io(dir, e))
    }

    async fn rmdir(&self, dir: &str) -> Result<()> {
        let target = self.path_for(dir);
        let mut rd = fs::read_dir(&target)
            .await
            .map_err(|e| Error::from_io(dir, e))?;
        if rd.next_entry().await?.is_some() {
            return Err(Error::DirectoryNotEmpty(dir.to_string()));
        }
        fs::remove_dir(&target)
            .await
            .map_err(|e| Error::from_io(dir, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<EntryInfo> {
        let target = self.path_for(to);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::rename(self.path_for(from), &target)
            .await
            .map_err(|e| Error::from_io(from, e))?;
        self.stat(to).await
    }
}
