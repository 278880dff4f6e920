//! A stamped lock: optimistic reads validated against a write stamp.
//!
//! Writers serialize on an inner mutex and bump the stamp to an odd value on
//! entry and back to even on exit. Readers snapshot an even stamp, perform
//! their racy reads (which must all go through atomics), and validate that
//! the stamp is unchanged; a failed validation means a writer intervened and
//! the read must be retried, normally under the write lock.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard,
};

pub(crate) struct StampedLock {
    stamp: AtomicU64,
    gate: Mutex<()>,
}

impl StampedLock {
    pub(crate) fn new() -> Self {
        Self {
            stamp: AtomicU64::new(0),
            gate: Mutex::new(()),
        }
    }

    /// Snapshot the stamp for an optimistic read, or `None` while a writer
    /// holds the lock.
    ///
    /// Stamp accesses are sequentially consistent: readers announce
    /// themselves (a reservation counter), re-validate, and only then touch
    /// shared cursors, while writers bump the stamp and then wait the
    /// announced readers out. SeqCst is what makes "writer saw no readers"
    /// and "reader saw the old stamp" mutually exclusive.
    #[inline]
    pub(crate) fn optimistic_read(&self) -> Option<u64> {
        let stamp = self.stamp.load(Ordering::SeqCst);
        (stamp & 1 == 0).then_some(stamp)
    }

    /// Whether the stamp is still the one snapshotted; `false` means a
    /// writer ran (or is running) since the snapshot.
    #[inline]
    pub(crate) fn validate(&self, stamp: u64) -> bool {
        self.stamp.load(Ordering::SeqCst) == stamp
    }

    /// Take the write lock, invalidating all optimistic readers.
    pub(crate) fn write(&self) -> StampGuard<'_> {
        let guard = self.gate.lock().unwrap();
        self.stamp.fetch_add(1, Ordering::SeqCst);
        StampGuard { lock: self, _gate: guard }
    }
}

pub(crate) struct StampGuard<'a> {
    lock: &'a StampedLock,
    _gate: MutexGuard<'a, ()>,
}

impl Drop for StampGuard<'_> {
    fn drop(&mut self) {
        self.lock.stamp.fetch_add(1, Ordering::SeqCst);
    }
}
