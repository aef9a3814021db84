//! Cuckoo buckets and their container.
//!
//! A cuckoo bucket is the common bucket plus one byte of "partial key" per slot: a fixed
//! projection of the full hash, stored next to the slot so both negative lookups and eviction
//! planning can skip hashing (and often even comparing) the stored key.

use std::cell::UnsafeCell;
use std::ops::Deref;

use parking_lot::Mutex;

use atomic::{atomic_load_copy, atomic_store_copy};
use bucket::{Bucket, SLOT_PER_BUCKET};
use storage::{Segment, Storage};

/// A partial key: a one-byte projection of the hash.
pub type Partial = u8;

/// A bucket with per-slot partial keys.
pub struct CuckooBucket<K, V> {
    /// The key-value slots.
    slots: Bucket<K, V>,
    /// The slots' partial keys; meaningful only for occupied slots.
    partials: UnsafeCell<[Partial; SLOT_PER_BUCKET]>,
}

// Same discipline as the base bucket: shared access goes through the atomic helpers.
unsafe impl<K: Send, V: Send> Send for CuckooBucket<K, V> {}
unsafe impl<K: Send, V: Send> Sync for CuckooBucket<K, V> {}

impl<K: Copy, V: Copy> CuckooBucket<K, V> {
    /// Create an empty bucket.
    pub fn new() -> CuckooBucket<K, V> {
        CuckooBucket {
            slots: Bucket::new(),
            partials: UnsafeCell::new([0; SLOT_PER_BUCKET]),
        }
    }

    /// Snapshot a slot's partial key.
    pub fn partial(&self, slot: usize) -> Partial {
        debug_assert!(slot < SLOT_PER_BUCKET);
        unsafe { atomic_load_copy((self.partials.get() as *const Partial).add(slot)) }
    }

    /// Store a slot's partial key.
    pub fn set_partial(&self, slot: usize, partial: Partial) {
        debug_assert!(slot < SLOT_PER_BUCKET);
        unsafe { atomic_store_copy((self.partials.get() as *mut Partial).add(slot), partial) }
    }
}

impl<K, V> Deref for CuckooBucket<K, V> {
    type Target = Bucket<K, V>;

    fn deref(&self) -> &Bucket<K, V> {
        &self.slots
    }
}

/// The cuckoo table's bucket array.
///
/// This wraps the segmented storage with the slot construction/destruction discipline, and with
/// the graveyard for storage that a rebuild replaced: a snapshot reader may still be chasing
/// pointers into the old segments, so they are kept alive until the table is dropped.
pub struct CuckooBuckets<K, V> {
    /// The buckets.
    storage: Storage<CuckooBucket<K, V>>,
    /// Segments detached by shrinking rebuilds, kept alive for stale readers.
    retired: Mutex<Vec<Segment<CuckooBucket<K, V>>>>,
}

impl<K: Copy, V: Copy> CuckooBuckets<K, V> {
    /// Create `2^hp` empty buckets.
    pub fn new(hp: usize) -> CuckooBuckets<K, V> {
        CuckooBuckets {
            storage: Storage::new(hp, |_| CuckooBucket::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// The current hashpower.
    pub fn hashpower(&self) -> usize {
        self.storage.hashpower()
    }

    /// Get a bucket by index.
    pub fn get(&self, i: usize) -> &CuckooBucket<K, V> {
        self.storage.get(i)
    }

    /// Fill a slot: partial, then key, then value, and the occupancy flag strictly last, so a
    /// racing reader can never observe the flag without the data stores at least issued.
    pub fn set_kv(&self, bucket: &CuckooBucket<K, V>, slot: usize, partial: Partial, key: K, val: V) {
        debug_assert!(!bucket.occupied(slot));
        bucket.set_partial(slot, partial);
        bucket.set_key(slot, key);
        bucket.set_value(slot, val);
        bucket.set_occupied(slot, true);
    }

    /// Empty a slot. Clearing the flag is the one store needed; the cells are trivially
    /// copyable, so there is nothing to destroy.
    pub fn deoccupy(&self, bucket: &CuckooBucket<K, V>, slot: usize) {
        debug_assert!(bucket.occupied(slot));
        bucket.set_occupied(slot, false);
    }

    /// Empty every slot. The caller must hold all locks.
    pub fn clear(&self) {
        for bucket in self.storage.iter() {
            for slot in 0..SLOT_PER_BUCKET {
                if bucket.occupied(slot) {
                    self.deoccupy(bucket, slot);
                }
            }
        }
    }

    /// Append one segment of empty buckets, doubling the bucket count.
    ///
    /// # Safety
    ///
    /// The caller must hold all locks.
    pub unsafe fn double(&self) {
        self.storage.double_size(|_| CuckooBucket::new());
    }

    /// Resize the bucket array to `2^new_hp` empty-or-existing buckets.
    ///
    /// Growth appends segments; shrinking detaches the surplus ones into the graveyard, where
    /// they stay alive for stale readers until the table dies.
    ///
    /// # Safety
    ///
    /// The caller must hold all locks, and must re-home every live slot afterwards.
    pub unsafe fn resize(&self, new_hp: usize) {
        let hp = self.storage.hashpower();
        if new_hp > hp {
            self.storage.grow(new_hp, |_| CuckooBucket::new());
        } else if new_hp < hp {
            let mut detached = self.storage.shrink(new_hp);
            self.retired.lock().append(&mut detached);
        }
    }
}
