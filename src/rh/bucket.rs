//! Robin-Hood buckets and their container.
//!
//! A Robin-Hood bucket is the common bucket plus two things: a per-slot displacement (`dist`,
//! how far the slot's key sits from its original slot) and the bucket's own seqlock — in this
//! table, the bucket *is* the unit of locking.

use std::cell::UnsafeCell;
use std::ops::Deref;

use atomic::{atomic_load_copy, atomic_store_copy};
use bucket::{Bucket, SLOT_PER_BUCKET};
use seqlock::Seqlock;
use storage::Storage;

/// A bucket with per-slot displacements and its own seqlock.
pub struct RhBucket<K, V> {
    /// The lock governing this bucket's slots.
    lock: Seqlock,
    /// The key-value slots.
    slots: Bucket<K, V>,
    /// The slots' displacements from their original slots; meaningful only when occupied.
    dists: UnsafeCell<[u16; SLOT_PER_BUCKET]>,
}

unsafe impl<K: Send, V: Send> Send for RhBucket<K, V> {}
unsafe impl<K: Send, V: Send> Sync for RhBucket<K, V> {}

impl<K: Copy, V: Copy> RhBucket<K, V> {
    /// Create an empty bucket, optionally born locked (buckets appended mid-resize start locked
    /// so readers keep retrying until the resize publishes them).
    pub fn new(locked: bool) -> RhBucket<K, V> {
        RhBucket {
            lock: Seqlock::new(locked, true),
            slots: Bucket::new(),
            dists: UnsafeCell::new([0; SLOT_PER_BUCKET]),
        }
    }

    /// The bucket's seqlock.
    pub fn seqlock(&self) -> &Seqlock {
        &self.lock
    }

    /// Snapshot a slot's displacement.
    pub fn dist(&self, slot: usize) -> u16 {
        debug_assert!(slot < SLOT_PER_BUCKET);
        unsafe { atomic_load_copy((self.dists.get() as *const u16).add(slot)) }
    }

    /// Store a slot's displacement.
    pub fn set_dist(&self, slot: usize, dist: u16) {
        debug_assert!(slot < SLOT_PER_BUCKET);
        unsafe { atomic_store_copy((self.dists.get() as *mut u16).add(slot), dist) }
    }
}

impl<K, V> Deref for RhBucket<K, V> {
    type Target = Bucket<K, V>;

    fn deref(&self) -> &Bucket<K, V> {
        &self.slots
    }
}

/// The Robin-Hood table's bucket array.
pub struct RhBuckets<K, V> {
    /// The buckets.
    storage: Storage<RhBucket<K, V>>,
}

impl<K: Copy, V: Copy> RhBuckets<K, V> {
    /// Create `2^hp` empty, unlocked buckets.
    pub fn new(hp: usize) -> RhBuckets<K, V> {
        RhBuckets { storage: Storage::new(hp, |_| RhBucket::new(false)) }
    }

    /// The current hashpower.
    pub fn hashpower(&self) -> usize {
        self.storage.hashpower()
    }

    /// Get a bucket by index.
    pub fn get(&self, i: usize) -> &RhBucket<K, V> {
        self.storage.get(i)
    }

    /// Iterate over all buckets in index order.
    pub fn iter(&self) -> impl Iterator<Item = &RhBucket<K, V>> {
        self.storage.iter()
    }

    /// Fill a slot: displacement, key, value, and the occupancy flag strictly last.
    pub fn set_kv(&self, bucket: &RhBucket<K, V>, slot: usize, dist: u16, key: K, val: V) {
        debug_assert!(!bucket.occupied(slot));
        bucket.set_dist(slot, dist);
        bucket.set_key(slot, key);
        bucket.set_value(slot, val);
        bucket.set_occupied(slot, true);
    }

    /// Empty a slot.
    pub fn deoccupy(&self, bucket: &RhBucket<K, V>, slot: usize) {
        debug_assert!(bucket.occupied(slot));
        bucket.set_occupied(slot, false);
    }

    /// Append one segment of buckets born locked, doubling the bucket count.
    ///
    /// # Safety
    ///
    /// The caller must hold every existing bucket's lock, and must eventually unlock the new
    /// buckets it implicitly owns.
    pub unsafe fn double_locked(&self) {
        self.storage.double_size(|_| RhBucket::new(true));
    }
}
