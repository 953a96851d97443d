//! Out-of-band change tracking.
//!
//! A notified path is refreshed on its next access even if its record is
//! still within the TTL. Every notification gets a sequence number; a refresh
//! takes a [`ChangeNotifier::watermark`] before it talks to the source and
//! consumes only notifications at or below it, so a change raised while the
//! refresh is in flight survives for the next access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::{ChangeEvent, EntryKind};
use crate::clock::Clock;
use crate::path;

const PRUNE_AT: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Raised {
    seq: u64,
    at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ChangeNotifier {
    raised: Mutex<HashMap<String, Raised>>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    upstream: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        let (upstream, _) = broadcast::channel(1024);
        Self {
            raised: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            clock,
            ttl,
            upstream,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Raised>> {
        self.raised.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that `path` changed. A changed file also flags its parent,
    /// whose listing carries the file's attributes.
    pub fn notify(&self, p: &str, kind: EntryKind) {
        let at = self.clock.now();
        let mut table = self.table();
        if table.len() >= PRUNE_AT {
            Self::prune_locked(&mut table, at, self.ttl);
        }
        let mut raise = |target: String| {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            table.insert(target, Raised { seq, at });
        };
        raise(p.to_string());
        if kind == EntryKind::File && p != "/" {
            raise(path::parent(p));
        }
        debug!(path = p, ?kind, "change notified");
    }

    pub fn is_notified(&self, p: &str) -> bool {
        self.table().contains_key(p)
    }

    /// Sequence number of the newest notification so far.
    pub fn watermark(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Clear the notification of `path` if it is not newer than `watermark`.
    pub fn consume(&self, p: &str, watermark: u64) {
        let mut table = self.table();
        if table.get(p).is_some_and(|r| r.seq <= watermark) {
            table.remove(p);
        }
    }

    /// Drop notifications older than the TTL; expiry covers them anyway.
    pub fn prune(&self) {
        let now = self.clock.now();
        Self::prune_locked(&mut self.table(), now, self.ttl);
    }

    fn prune_locked(table: &mut HashMap<String, Raised>, now: DateTime<Utc>, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        table.retain(|_, r| now.signed_duration_since(r.at) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell subscribers above the cache that `path` changed. Nobody
    /// listening is not an error.
    pub fn notify_upstream(&self, p: &str, kind: EntryKind) {
        let delivered = self
            .upstream
            .send(ChangeEvent {
                path: p.to_string(),
                kind,
            })
            .unwrap_or(0);
        debug!(path = p, ?kind, delivered, "upstream change sent");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.upstream.subscribe()
    }
}
