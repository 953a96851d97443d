//! Counting pause switch between mutating callers and the upload worker.
//!
//! `pause` and the worker's claim share one async mutex, so once `pause`
//! returns no entry can flip to `started` until the matching `play`. Pauses
//! nest: the worker resumes when the count drops back to zero.

use std::sync::{Arc, Mutex};

use tokio::sync::{MutexGuard, Notify};

#[derive(Debug, Default)]
pub struct PauseGate {
    paused: Mutex<usize>,
    resumed: Notify,
    claim: tokio::sync::Mutex<()>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn count(&self) -> std::sync::MutexGuard<'_, usize> {
        self.paused.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop new uploads from starting until the guard is dropped.
    pub async fn pause(self: &Arc<Self>) -> PauseGuard {
        let _claim = self.claim.lock().await;
        *self.count() += 1;
        PauseGuard { gate: self.clone() }
    }

    pub fn play(&self) {
        let mut n = self.count();
        *n = n.saturating_sub(1);
        if *n == 0 {
            self.resumed.notify_waiters();
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.count() > 0
    }

    /// Wait until unpaused and hold off new pauses while the guard lives.
    /// The worker marks an entry started under this guard.
    pub async fn claim(&self) -> MutexGuard<'_, ()> {
        loop {
            let resumed = self.resumed.notified();
            if !self.is_paused() {
                let guard = self.claim.lock().await;
                if !self.is_paused() {
                    return guard;
                }
                continue;
            }
            resumed.await;
        }
    }
}

#[must_use = "the worker resumes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PauseGuard {
    gate: Arc<PauseGate>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.gate.play();
    }
}
