//! Per-path async mutexes.
//!
//! All record mutations and refreshes for one path run under that path's
//! lock; different paths never contend. The table keeps only weak handles,
//! so idle locks are dropped once the table grows past a threshold.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

pub type PathGuard = OwnedMutexGuard<()>;

#[derive(Debug)]
pub struct PathLocks {
    locks: RwLock<HashMap<String, Weak<Mutex<()>>>>,
    gc_threshold: usize,
}

impl PathLocks {
    pub fn new(gc_threshold: usize) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            gc_threshold: gc_threshold.max(1),
        }
    }

    fn handle(locks: &mut HashMap<String, Weak<Mutex<()>>>, path: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = locks.get(path).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(path.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait for exclusive access to `path`.
    pub async fn lock(&self, path: &str) -> PathGuard {
        let lock = {
            let mut locks = self.locks.write().await;
            if locks.len() >= self.gc_threshold {
                locks.retain(|_, weak| weak.strong_count() > 0);
            }
            Self::handle(&mut locks, path)
        };
        lock.lock_owned().await
    }

    /// Exclusive access to `path` if nobody holds it right now.
    pub async fn try_lock(&self, path: &str) -> Option<PathGuard> {
        let lock = {
            let mut locks = self.locks.write().await;
            Self::handle(&mut locks, path)
        };
        lock.try_lock_owned().ok()
    }

    /// Number of table slots, live or not.
    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }
}
