//! The sequence lock.
//!
//! A seqlock is the writer half of an optimistic reader-writer scheme: writers serialize through
//! an ordinary spin lock, but instead of blocking readers, every acquisition advances a version
//! counter (the "epoch"). A reader snapshots the epoch, copies whatever fields it needs through
//! the relaxed helpers in `atomic`, and then rereads the epoch: if it moved, or if the lock bit
//! was set in the first place, the snapshot might be torn and the reader starts over. Readers
//! therefore never write shared memory at all.
//!
//! On top of the plain epoch, the lock carries two pieces of bookkeeping its holder may use:
//!
//! - a _migrated_ flag folded into the epoch word, telling readers whether the data governed by
//!   this lock has been moved to its final place after a table expansion, and
//! - an element counter, counting the entries governed by this lock, so a table can compute its
//!   size as a sum without any global counter contention.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU64, Ordering};

/// A snapshot of a seqlock's version word.
pub type Epoch = u64;

/// The bit of the epoch word holding the lock state.
///
/// The epoch starts even and is incremented once on lock and once on unlock, so an odd epoch is
/// exactly an acquired lock.
const LOCKED_BIT: Epoch = 1;
/// The bit of the epoch word holding the migrated flag.
const MIGRATED_BIT: Epoch = 1 << 63;

/// A sequence lock.
///
/// The lock is padded to a cache line, since it is stored in (potentially very hot) arrays where
/// false sharing between neighbouring locks would defeat the fine-grained locking.
#[repr(align(64))]
pub struct Seqlock {
    /// The number of elements governed by this lock.
    ///
    /// Only the lock holder may modify this; unlocked threads may only read the (racy but
    /// monotonic-per-holder) value, which is all that summing up a table size needs.
    elems: AtomicI64,
    /// The lock holder's private copy of the epoch.
    ///
    /// Keeping the current epoch outside the atomic lets the holder derive the next value to
    /// publish without a read-modify-write cycle. Only the lock holder touches this cell.
    cur_epoch: UnsafeCell<Epoch>,
    /// The published epoch.
    epoch: AtomicU64,
    /// The mutual exclusion bit.
    lock: AtomicBool,
}

// The `cur_epoch` cell is only ever accessed while `lock` is held, making the type safe to share.
unsafe impl Send for Seqlock {}
unsafe impl Sync for Seqlock {}

impl Seqlock {
    /// Create a new seqlock, possibly born locked and/or unmigrated.
    pub fn new(locked: bool, migrated: bool) -> Seqlock {
        let epoch = if locked { LOCKED_BIT } else { 0 } | if migrated { MIGRATED_BIT } else { 0 };

        Seqlock {
            elems: AtomicI64::new(0),
            cur_epoch: UnsafeCell::new(epoch),
            epoch: AtomicU64::new(epoch),
            lock: AtomicBool::new(locked),
        }
    }

    /// Acquire the lock, spinning if necessary.
    ///
    /// This publishes a new (odd) epoch before returning, so concurrent readers know to retry.
    /// The new epoch is returned.
    pub fn lock(&self) -> Epoch {
        // Spin on the mutual exclusion bit.
        while self.lock.swap(true, Ordering::Acquire) {
            hint::spin_loop();
        }

        self.publish_locked_epoch()
    }

    /// Try to acquire the lock without spinning.
    ///
    /// On success the odd epoch is published exactly as in `lock()`, and `true` is returned.
    pub fn try_lock(&self) -> bool {
        if self.lock.swap(true, Ordering::Acquire) {
            // Somebody else holds it.
            false
        } else {
            self.publish_locked_epoch();
            true
        }
    }

    /// Advance and publish the odd epoch after the exclusion bit has been won.
    fn publish_locked_epoch(&self) -> Epoch {
        // We hold the lock, so the cell is ours.
        let cur = unsafe { &mut *self.cur_epoch.get() };
        *cur = cur.wrapping_add(1);
        self.epoch.store(*cur, Ordering::Relaxed);
        // The odd epoch must be visible before any store to the protected fields is. A release
        // fence upgrades the protected (relaxed) stores that follow, pairing with the acquire
        // fence in the reader's validation.
        fence(Ordering::Release);

        *cur
    }

    /// Release the lock after a modification.
    ///
    /// This publishes a fresh (even) epoch, invalidating every reader snapshot taken since
    /// `lock()`.
    pub fn unlock(&self) {
        let cur = unsafe { &mut *self.cur_epoch.get() };
        *cur = cur.wrapping_add(1);
        // The release store pairs with the reader's initial acquire load of the epoch: a reader
        // that starts with the new epoch also sees the completed writes.
        self.epoch.store(*cur, Ordering::Release);
        self.lock.store(false, Ordering::Release);
    }

    /// Release the lock after a critical section that turned out not to modify anything.
    ///
    /// The epoch is rolled back to its pre-lock value, so readers which recorded it just before
    /// we took the lock still validate successfully and don't have to redo their work.
    pub fn unlock_no_modified(&self) {
        let cur = unsafe { &mut *self.cur_epoch.get() };
        *cur = cur.wrapping_sub(1);
        self.epoch.store(*cur, Ordering::Release);
        self.lock.store(false, Ordering::Release);
    }

    /// Read the published epoch.
    pub fn epoch(&self, ordering: Ordering) -> Epoch {
        self.epoch.load(ordering)
    }

    /// Does this epoch snapshot have the lock bit set?
    pub fn is_locked(epoch: Epoch) -> bool {
        epoch & LOCKED_BIT != 0
    }

    /// Does this epoch snapshot have the migrated flag set?
    pub fn is_migrated(epoch: Epoch) -> bool {
        epoch & MIGRATED_BIT != 0
    }

    /// Set or clear the migrated flag.
    ///
    /// Only the lock holder may call this. The flag is published right away (still under the
    /// locked epoch), and survives the eventual `unlock`.
    pub fn set_migrated(&self, migrated: bool) {
        let cur = unsafe { &mut *self.cur_epoch.get() };
        if migrated {
            *cur |= MIGRATED_BIT;
        } else {
            *cur &= !MIGRATED_BIT;
        }

        self.epoch.store(*cur, Ordering::Relaxed);
    }

    /// Read the element counter.
    pub fn elems(&self) -> i64 {
        self.elems.load(Ordering::Relaxed)
    }

    /// Adjust the element counter by `diff`.
    ///
    /// Only the lock holder may call this.
    pub fn add_elems(&self, diff: i64) {
        self.elems.fetch_add(diff, Ordering::Relaxed);
    }

    /// Zero the element counter.
    ///
    /// Only the lock holder may call this.
    pub fn reset_elems(&self) {
        self.elems.store(0, Ordering::Relaxed);
    }
}

impl Default for Seqlock {
    fn default() -> Seqlock {
        // Unlocked, and with nothing left to migrate.
        Seqlock::new(false, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn lock_advances_epoch() {
        let lock = Seqlock::default();
        let before = lock.epoch(Ordering::Acquire);
        assert!(!Seqlock::is_locked(before));

        let held = lock.lock();
        assert!(Seqlock::is_locked(held));
        assert_eq!(held, before + 1);

        lock.unlock();
        let after = lock.epoch(Ordering::Acquire);
        assert!(!Seqlock::is_locked(after));
        assert_ne!(after, before);
    }

    #[test]
    fn unlock_no_modified_restores_epoch() {
        let lock = Seqlock::default();
        let before = lock.epoch(Ordering::Acquire);

        lock.lock();
        lock.unlock_no_modified();

        // A reader which recorded `before` must still validate.
        assert_eq!(lock.epoch(Ordering::Acquire), before);
    }

    #[test]
    fn try_lock_contended() {
        let lock = Seqlock::default();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn migrated_flag() {
        let lock = Seqlock::new(false, false);
        assert!(!Seqlock::is_migrated(lock.epoch(Ordering::Acquire)));

        lock.lock();
        lock.set_migrated(true);
        lock.unlock();

        let epoch = lock.epoch(Ordering::Acquire);
        assert!(Seqlock::is_migrated(epoch));
        assert!(!Seqlock::is_locked(epoch));
    }

    #[test]
    fn elem_counter() {
        let lock = Seqlock::default();
        lock.lock();
        lock.add_elems(3);
        lock.add_elems(-1);
        lock.unlock();
        assert_eq!(lock.elems(), 2);
    }
}
