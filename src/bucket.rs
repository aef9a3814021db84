//! The bucket: a handful of key-value slots.
//!
//! A bucket holds `SLOT_PER_BUCKET` slots, each being an occupancy flag, a key cell, and a value
//! cell. The cells are plain memory — no per-cell lock, no `std::atomic` wrapper — accessed
//! exclusively through the word-wise helpers in `atomic`, so that concurrent snapshot readers
//! race benignly with the writer that owns the governing seqlock.
//!
//! The lifetime discipline is the container's business, not the bucket's: a slot's key and value
//! cells only hold meaningful data while the occupancy flag is set, the flag is the *last* store
//! when a slot is filled and the *first* store when it is emptied, and keys and values are
//! trivially copyable so an emptied slot needs no destruction.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use atomic::{atomic_load_copy, atomic_store_copy};

/// The number of slots per bucket.
pub const SLOT_PER_BUCKET: usize = 4;

/// log2 of `SLOT_PER_BUCKET`.
pub const SLOT_PER_BUCKET_POW: usize = 2;

/// A fixed-capacity array of key-value slots.
pub struct Bucket<K, V> {
    /// Which slots hold live data.
    occupied: UnsafeCell<[bool; SLOT_PER_BUCKET]>,
    /// The key cells; meaningful only while the matching flag is set.
    keys: UnsafeCell<[MaybeUninit<K>; SLOT_PER_BUCKET]>,
    /// The value cells; meaningful only while the matching flag is set.
    vals: UnsafeCell<[MaybeUninit<V>; SLOT_PER_BUCKET]>,
}

// All shared access goes through the atomic copy helpers, and only values (never references with
// uncontrolled lifetimes) leave the bucket.
unsafe impl<K: Send, V: Send> Send for Bucket<K, V> {}
unsafe impl<K: Send, V: Send> Sync for Bucket<K, V> {}

impl<K: Copy, V: Copy> Bucket<K, V> {
    /// Create a bucket with every slot empty.
    pub fn new() -> Bucket<K, V> {
        Bucket {
            occupied: UnsafeCell::new([false; SLOT_PER_BUCKET]),
            // The cells start uninitialized; the occupancy flags (all clear) are what make that
            // sound to the rest of the crate.
            keys: UnsafeCell::new(unsafe { MaybeUninit::uninit().assume_init() }),
            vals: UnsafeCell::new(unsafe { MaybeUninit::uninit().assume_init() }),
        }
    }

    /// The address of a slot's occupancy flag.
    fn occupied_ptr(&self, slot: usize) -> *mut bool {
        debug_assert!(slot < SLOT_PER_BUCKET);
        unsafe { (self.occupied.get() as *mut bool).add(slot) }
    }

    /// The address of a slot's key cell.
    fn key_ptr(&self, slot: usize) -> *mut K {
        debug_assert!(slot < SLOT_PER_BUCKET);
        unsafe { (self.keys.get() as *mut MaybeUninit<K>).add(slot) as *mut K }
    }

    /// The address of a slot's value cell.
    pub fn value_ptr(&self, slot: usize) -> *mut V {
        debug_assert!(slot < SLOT_PER_BUCKET);
        unsafe { (self.vals.get() as *mut MaybeUninit<V>).add(slot) as *mut V }
    }

    /// Is this slot occupied?
    pub fn occupied(&self, slot: usize) -> bool {
        unsafe { atomic_load_copy(self.occupied_ptr(slot)) }
    }

    /// Set or clear a slot's occupancy flag.
    pub fn set_occupied(&self, slot: usize, occupied: bool) {
        unsafe { atomic_store_copy(self.occupied_ptr(slot), occupied) }
    }

    /// Snapshot a slot's key.
    ///
    /// The snapshot may be torn or stale if a writer races; callers validate through the seqlock
    /// epoch before acting on it (or hold the governing lock themselves).
    pub fn key(&self, slot: usize) -> K {
        unsafe { atomic_load_copy(self.key_ptr(slot)) }
    }

    /// Store a slot's key.
    pub fn set_key(&self, slot: usize, key: K) {
        unsafe { atomic_store_copy(self.key_ptr(slot), key) }
    }

    /// Snapshot a slot's value. The same caveats as `key` apply.
    pub fn value(&self, slot: usize) -> V {
        unsafe { atomic_load_copy(self.value_ptr(slot)) }
    }

    /// Store a slot's value.
    pub fn set_value(&self, slot: usize, value: V) {
        unsafe { atomic_store_copy(self.value_ptr(slot), value) }
    }
}
