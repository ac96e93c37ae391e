#![forbid(unsafe_code)]

use crate::store::IndexError;
use ag_core::ids::TagsetId;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Single-writer-per-tagset registry.
///
/// Merges of different tagsets never wait on each other here; the same tagset
/// is serialized, and a caller gives up after its bounded wait.
#[derive(Debug, Default)]
pub struct TagsetLocks {
    held: Mutex<HashSet<TagsetId>>,
    released: Condvar,
}

impl TagsetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, tagset: TagsetId, wait: Duration) -> Result<TagsetLockGuard<'_>, IndexError> {
        let started = Instant::now();
        let deadline = started + wait;
        let mut held = self.lock_held();
        while held.contains(&tagset) {
            let now = Instant::now();
            if now >= deadline {
                return Err(IndexError::ConcurrentMergeConflict {
                    tagset,
                    waited_ms: elapsed_ms(started),
                });
            }
            let (next, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = next;
        }
        held.insert(tagset);
        Ok(TagsetLockGuard {
            locks: self,
            tagset,
        })
    }

    pub fn is_locked(&self, tagset: &TagsetId) -> bool {
        self.lock_held().contains(tagset)
    }

    fn lock_held(&self) -> MutexGuard<'_, HashSet<TagsetId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, tagset: &TagsetId) {
        self.lock_held().remove(tagset);
        self.released.notify_all();
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Write permission for one tagset; released on drop.
#[derive(Debug)]
pub struct TagsetLockGuard<'a> {
    locks: &'a TagsetLocks,
    tagset: TagsetId,
}

impl TagsetLockGuard<'_> {
    pub fn tagset(&self) -> TagsetId {
        self.tagset
    }

    /// True when this guard was handed out by `locks`.
    pub fn issued_by(&self, locks: &TagsetLocks) -> bool {
        std::ptr::eq(self.locks, locks)
    }
}

impl Drop for TagsetLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.tagset);
    }
}
