//! Cooperative stop-the-world lock.
//!
//! A requester raises the flag and waits until every running worker has
//! parked at a safe point. Workers park by blocking on the same mutex the
//! requester holds, so they resume the moment the guard drops.

use parking_lot::{Mutex, MutexGuard};
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
    time::Duration,
};
use tracing::{debug, trace};

#[derive(Default)]
pub struct GlobalLock {
    mutex: Mutex<()>,
    requested: AtomicBool,
    suspended: AtomicUsize,
    running: AtomicUsize,
}

pub struct GlobalLockGuard<'a> {
    lock: &'a GlobalLock,
    _held: MutexGuard<'a, ()>,
}

impl Drop for GlobalLockGuard<'_> {
    fn drop(&mut self) {
        // Lower the flag before the mutex is released or workers would park again.
        self.lock.requested.store(false, Ordering::Release);
        trace!("Global lock released");
    }
}

impl GlobalLock {
    /// A worker joins the set the requester waits for.
    pub fn worker_started(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub fn worker_stopped(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Pauses all workers. `wake` is called while waiting so sleeping
    /// workers reach their safe point without sitting out the idle timeout.
    /// Must not be called from a worker thread.
    pub fn lock(&self, wake: impl Fn()) -> GlobalLockGuard<'_> {
        let held = self.mutex.lock();
        self.requested.store(true, Ordering::Release);
        debug!("Global lock requested, waiting for {} workers", self.running());
        let mut rounds = 0u32;
        while self.suspended.load(Ordering::Acquire) < self.running() {
            if rounds % 64 == 0 {
                wake();
            }
            rounds = rounds.wrapping_add(1);
            thread::sleep(Duration::from_micros(100));
        }
        GlobalLockGuard { lock: self, _held: held }
    }

    /// Called by workers between loop iterations.
    #[inline(always)]
    pub fn safe_point(&self) {
        if !self.is_requested() {
            return;
        }
        self.suspended.fetch_add(1, Ordering::AcqRel);
        drop(self.mutex.lock());
        self.suspended.fetch_sub(1, Ordering::AcqRel);
    }
}
