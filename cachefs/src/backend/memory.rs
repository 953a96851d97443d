//! In-process backend. Counts every call, can be slowed down, taken
//! offline or have its writes held, which is what the cache tests need to
//! observe origin round trips and races.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, broadcast};

use super::{Backend, ChangeEvent, EntryInfo, EntryKind, HashKind};
use crate::error::{Error, Result};
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Stat,
    List,
    Read,
    Write,
    Remove,
    SetModTime,
    Hash,
    Mkdir,
    Rmdir,
    Rename,
}

#[derive(Debug, Clone)]
struct MemFile {
    data: Bytes,
    mod_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<String, MemFile>,
    dirs: BTreeMap<String, DateTime<Utc>>,
}

impl MemState {
    fn ensure_dirs(&mut self, dir: &str, now: DateTime<Utc>) {
        let mut cur = dir.to_string();
        loop {
            self.dirs.entry(cur.clone()).or_insert(now);
            if cur == "/" {
                break;
            }
            cur = path::parent(&cur);
        }
    }

    fn file_info(path: &str, f: &MemFile) -> EntryInfo {
        EntryInfo {
            path: path.to_string(),
            kind: EntryKind::File,
            size: f.data.len() as i64,
            mod_time: f.mod_time,
            storable: true,
        }
    }

    fn dir_info(path: &str, mod_time: DateTime<Utc>) -> EntryInfo {
        EntryInfo {
            path: path.to_string(),
            kind: EntryKind::Directory,
            size: 0,
            mod_time,
            storable: true,
        }
    }
}

#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    state: Mutex<MemState>,
    calls: Mutex<HashMap<Op, usize>>,
    latency: Mutex<Duration>,
    offline: AtomicBool,
    failing_writes: AtomicUsize,
    write_gate: Arc<RwLock<()>>,
    events: Option<broadcast::Sender<ChangeEvent>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        let mut state = MemState::default();
        state.dirs.insert("/".into(), Utc::now());
        Self {
            name: name.into(),
            state: Mutex::new(state),
            calls: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            offline: AtomicBool::new(false),
            failing_writes: AtomicUsize::new(0),
            write_gate: Arc::new(RwLock::new(())),
            events: None,
        }
    }

    /// A backend that publishes its own change events, like an origin with
    /// push notifications.
    pub fn with_change_feed(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            events: Some(tx),
            ..Self::new(name)
        }
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a file without counting a call or emitting an event.
    pub fn insert_file(&self, p: &str, data: impl Into<Bytes>, mod_time: DateTime<Utc>) {
        let p = path::clean(p);
        let mut state = self.state();
        state.ensure_dirs(&path::parent(&p), mod_time);
        state.files.insert(
            p,
            MemFile {
                data: data.into(),
                mod_time,
            },
        );
    }

    /// Change a file behind the cache's back and announce it on the change
    /// feed, if there is one.
    pub fn change_externally(&self, p: &str, data: impl Into<Bytes>, mod_time: DateTime<Utc>) {
        let p = path::clean(p);
        self.insert_file(&p, data, mod_time);
        if let Some(tx) = &self.events {
            let _ = tx.send(ChangeEvent {
                path: p,
                kind: EntryKind::File,
            });
        }
    }

    pub fn contents(&self, p: &str) -> Option<Bytes> {
        self.state().files.get(&path::clean(p)).map(|f| f.data.clone())
    }

    pub fn has_dir(&self, p: &str) -> bool {
        self.state().dirs.contains_key(&path::clean(p))
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail.
    pub fn fail_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Block every write until the returned guard is dropped.
    pub async fn hold_writes(&self) -> OwnedRwLockWriteGuard<()> {
        self.write_gate.clone().write_owned().await
    }

    async fn enter(&self, op: Op) -> Result<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(op)
            .or_insert(0) += 1;
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Offline(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, p: &str) -> Result<EntryInfo> {
        self.enter(Op::Stat).await?;
        let state = self.state();
        if let Some(f) = state.files.get(p) {
            return Ok(MemState::file_info(p, f));
        }
        match state.dirs.get(p) {
            Some(t) => Ok(MemState::dir_info(p, *t)),
            None => Err(Error::NotFound(p.to_string())),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<EntryInfo>> {
        self.enter(Op::List).await?;
        let state = self.state();
        if !state.dirs.contains_key(dir) {
            if state.files.contains_key(dir) {
                return Err(Error::NotADirectory(dir.to_string()));
            }
            return Err(Error::NotFound(dir.to_string()));
        }
        let mut out: Vec<EntryInfo> = state
            .dirs
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && path::parent(p) == dir)
            .map(|(p, t)| MemState::dir_info(p, *t))
            .collect();
        out.extend(
            state
                .files
                .iter()
                .filter(|(p, _)| path::parent(p) == dir)
                .map(|(p, f)| MemState::file_info(p, f)),
        );
        Ok(out)
    }

    async fn read(&self, p: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.enter(Op::Read).await?;
        let state = self.state();
        let f = state
            .files
            .get(p)
            .ok_or_else(|| Error::NotFound(p.to_string()))?;
        let total = f.data.len() as u64;
        let start = offset.min(total);
        let end = start.saturating_add(len).min(total);
        Ok(f.data.slice(start as usize..end as usize))
    }

    async fn write(&self, p: &str, data: Bytes, mod_time: DateTime<Utc>) -> Result<EntryInfo> {
        self.enter(Op::Write).await?;
        let _gate = self.write_gate.read().await;
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Backend(format!("{}: injected write failure", self.name)));
        }
        let mut state = self.state();
        if state.dirs.contains_key(p) {
            return Err(Error::AlreadyExists(p.to_string()));
        }
        state.ensure_dirs(&path::parent(p), mod_time);
        let file = MemFile { data, mod_time };
        let info = MemState::file_info(p, &file);
        state.files.insert(p.to_string(), file);
        Ok(info)
    }

    async fn remove(&self, p: &str) -> Result<()> {
        self.enter(Op::Remove).await?;
        match self.state().files.remove(p) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(p.to_string())),
        }
    }

    async fn set_mod_time(&self, p: &str, mod_time: DateTime<Utc>) -> Result<()> {
        self.enter(Op::SetModTime).await?;
        match self.state().files.get_mut(p) {
            Some(f) => {
                f.mod_time = mod_time;
                Ok(())
            }
            None => Err(Error::NotFound(p.to_string())),
        }
    }

    async fn hash(&self, p: &str, kind: HashKind) -> Result<String> {
        self.enter(Op::Hash).await?;
        let state = self.state();
        let f = state
            .files
            .get(p)
            .ok_or_else(|| Error::NotFound(p.to_string()))?;
        Ok(kind.digest(&f.data))
    }

    async fn mkdir(&self, dir: &str) -> Result<()> {
        self.enter(Op::Mkdir).await?;
        let mut state = self.state();
        if state.files.contains_key(dir) {
            return Err(Error::AlreadyExists(dir.to_string()));
        }
        state.ensure_dirs(dir, Utc::now());
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> Result<()> {
        self.enter(Op::Rmdir).await?;
        let mut state = self.state();
        if !state.dirs.contains_key(dir) {
            return Err(Error::NotFound(dir.to_string()));
        }
        let busy = state.files.keys().any(|p| path::is_descendant(p, dir))
            || state.dirs.keys().any(|p| path::is_descendant(p, dir));
        if busy {
            return Err(Error::DirectoryNotEmpty(dir.to_string()));
        }
        state.dirs.remove(dir);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<EntryInfo> {
        self.enter(Op::Rename).await?;
        let mut state = self.state();
        let file = state
            .files
            .remove(from)
            .ok_or_else(|| Error::NotFound(from.to_string()))?;
        state.ensure_dirs(&path::parent(to), file.mod_time);
        let info = MemState::file_info(to, &file);
        state.files.insert(to.to_string(), file);
        Ok(info)
    }

    fn supports_change_notify(&self) -> bool {
        self.events.is_some()
    }

    fn change_events(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.events.as_ref().map(|tx| tx.subscribe())
    }
}
