//! The cuckoo hash table.
//!
//! Every key has two candidate buckets, derived from its hash, and lives in one of them. That
//! bounds every lookup to eight slots, but makes inserts interesting: when both candidates are
//! full, some resident key is kicked to *its* other candidate, recursively, until a free slot
//! absorbs the chain. The eviction chain is found with a bounded breadth-first search and then
//! executed backwards, hole-first, so at no point does any key leave the table.
//!
//! Concurrency is seqlock-based. A fixed array of seqlocks governs the buckets (bucket `b` maps
//! to lock `b mod LOCK_ARRAY_SIZE`); writers take the (one or) two locks governing a key's
//! candidate buckets in ascending index order, while readers take nothing at all: they snapshot
//! the governing locks' epochs, copy the slots they care about word by word, and retry if any
//! epoch moved. The one-byte partial key stored next to each slot keeps misses cheap.
//!
//! Expansion doubles the bucket count. The segmented bucket storage grows without moving old
//! buckets, and every key either stays put or moves to `its index + the old bucket count` —
//! decided by one fresh hash bit. For tables past the lock-array size, those two buckets share a
//! lock, so the resizer just flags every lock "unmigrated" and lets whoever locks it next (or
//! its own sweep) re-home the governed buckets lock by lock.

mod bucket;
mod locks;

#[cfg(test)]
mod tests;

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::{cmp, fmt};

use bucket::SLOT_PER_BUCKET;
use error::Error;
use seqlock::Seqlock;
use util::{hashed, reserve_calc, HashedKey};
use DefaultHashBuilder;
use NO_MAXIMUM_HASHPOWER;

use self::bucket::{CuckooBucket, CuckooBuckets, Partial};
use self::locks::{LockArray, LOCK_ARRAY_POW, LOCK_ARRAY_SIZE};

/// The default number of slots an empty table can hold.
pub const DEFAULT_CAPACITY: usize = (1 << 16) * SLOT_PER_BUCKET;

/// The default minimum load factor.
///
/// An automatic expansion that fires below this load factor reports `LoadFactorTooLow` instead
/// of doubling, since it means the hash function isn't spreading keys.
pub const DEFAULT_MINIMUM_LOAD_FACTOR: f64 = 0.05;

/// The longest eviction chain the insert search will consider.
const MAX_BFS_PATH_LEN: usize = 5;

/// The search queue capacity: both roots' full `SLOT_PER_BUCKET`-ary trees of depth
/// `MAX_BFS_PATH_LEN - 1`, i.e. `2 * (4^0 + 4^1 + ... + 4^4)`.
const MAX_BFS_QUEUE: usize = 682;

/// The multiplier deriving a key's alternate bucket from its partial; the 64-bit MurmurHash2
/// constant. Odd, so xoring the (masked) product is an involution: applying it twice gives the
/// original index back.
const ALT_MIX: u64 = 0xc6a4a7935bd1e995;

/// The index of the first candidate bucket.
fn index_hash(hp: usize, hash: u64) -> usize {
    hash as usize & ((1 << hp) - 1)
}

/// The index of the other candidate bucket, from either candidate.
fn alt_index(hp: usize, partial: Partial, index: usize) -> usize {
    // A zero tag would make the xor a no-op, hence the +1.
    let tag = (partial as u64).wrapping_add(1);
    (index ^ (tag.wrapping_mul(ALT_MIX) as usize)) & ((1 << hp) - 1)
}

/// Whether a write operation takes locks itself, or runs under a handle that already holds all
/// of them.
#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Take the governing locks per operation.
    Unlocked,
    /// All locks are held by the caller; locking is a no-op.
    Locked,
}

/// Why a write step has to start over or give up.
enum Race {
    /// The table was resized between computing the bucket indices and locking them.
    HashpowerChanged,
    /// No eviction chain within the length bound ends in a free slot.
    TableFull,
}

/// Locks held by a write operation; at most three (an eviction step touches a pair plus the two
/// origin buckets). Unlocks on drop.
struct Guards<'a> {
    locks: [Option<&'a Seqlock>; 3],
}

impl<'a> Guards<'a> {
    /// No locks; the `Mode::Locked` stand-in.
    fn none() -> Guards<'a> {
        Guards { locks: [None; 3] }
    }

    /// Release the locks declaring that nothing was modified, so reader snapshots taken before
    /// we locked still validate.
    fn release_no_modified(mut self) {
        for slot in self.locks.iter_mut() {
            if let Some(lock) = slot.take() {
                lock.unlock_no_modified();
            }
        }
    }
}

impl<'a> Drop for Guards<'a> {
    fn drop(&mut self) {
        for slot in self.locks.iter_mut() {
            if let Some(lock) = slot.take() {
                lock.unlock();
            }
        }
    }
}

/// Every lock in the array, held. Unlocks on drop.
struct AllLocks<'a> {
    locks: &'a LockArray,
}

impl<'a> Drop for AllLocks<'a> {
    fn drop(&mut self) {
        for lock in self.locks.iter() {
            lock.unlock();
        }
    }
}

/// Where a key (or room for it) was found under the held locks.
enum Slot {
    /// The key lives in this (bucket, slot).
    Exists(usize, usize),
    /// The key is absent; this free (bucket, slot) is where it should go.
    Free(usize, usize),
    /// The key is absent and both candidate buckets are full.
    Full,
}

/// One node of the eviction search: a bucket, the path of slots that led here (encoded base
/// `SLOT_PER_BUCKET`), and the path length so far.
#[derive(Clone, Copy)]
struct BfsSlot {
    bucket: usize,
    pathcode: usize,
    depth: usize,
}

/// The fixed-size search queue.
struct BfsQueue {
    slots: [BfsSlot; MAX_BFS_QUEUE],
    first: usize,
    last: usize,
}

impl BfsQueue {
    fn new() -> BfsQueue {
        const EMPTY: BfsSlot = BfsSlot { bucket: 0, pathcode: 0, depth: 0 };
        BfsQueue { slots: [EMPTY; MAX_BFS_QUEUE], first: 0, last: 0 }
    }

    fn enqueue(&mut self, x: BfsSlot) {
        debug_assert!(self.last < MAX_BFS_QUEUE);
        self.slots[self.last] = x;
        self.last += 1;
    }

    fn dequeue(&mut self) -> BfsSlot {
        debug_assert!(self.first < self.last);
        let x = self.slots[self.first];
        self.first += 1;
        x
    }

    fn is_empty(&self) -> bool {
        self.first == self.last
    }

    fn is_full(&self) -> bool {
        self.last == MAX_BFS_QUEUE
    }
}

/// One hop of a reconstructed eviction chain: a (bucket, slot) and — except for the final, free
/// hop — the occupant observed there at plan time.
#[derive(Clone, Copy)]
struct PathRecord<K> {
    bucket: usize,
    slot: usize,
    /// The occupant to be kicked out of this slot; `None` for the chain's terminal free slot.
    key: Option<K>,
    partial: Partial,
}

/// A concurrent cuckoo hash map.
///
/// Keys and values must be trivially copyable (`Copy`), since readers copy them out of live
/// storage while writers may be overwriting them; the seqlock epochs are what turn those racy
/// copies into consistent snapshots. Lookups never lock. Writers lock only the two governing
/// seqlocks (plus, transiently, the buckets of an eviction chain).
pub struct CuckooMap<K, V, S = DefaultHashBuilder> {
    /// The hasher factory.
    hash_builder: S,
    /// The lock array governing the buckets.
    locks: LockArray,
    /// The buckets.
    buckets: CuckooBuckets<K, V>,
    /// The minimum load factor (as `f64` bits) below which automatic expansion fails.
    minimum_load_factor: AtomicU64,
    /// The hashpower cap, or `NO_MAXIMUM_HASHPOWER`.
    maximum_hashpower: AtomicUsize,
}

impl<K: Copy + Hash + Eq, V: Copy> CuckooMap<K, V, DefaultHashBuilder> {
    /// Create a table with the default capacity.
    pub fn new() -> CuckooMap<K, V> {
        CuckooMap::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a table able to hold at least `n` entries before expanding.
    pub fn with_capacity(n: usize) -> CuckooMap<K, V> {
        CuckooMap::with_hasher(n, DefaultHashBuilder::default())
    }
}

impl<K: Copy + Hash + Eq, V: Copy, S: BuildHasher> CuckooMap<K, V, S> {
    /// Create a table able to hold `n` entries, hashing with `hash_builder`.
    pub fn with_hasher(n: usize, hash_builder: S) -> CuckooMap<K, V, S> {
        let hp = reserve_calc(n);

        CuckooMap {
            hash_builder: hash_builder,
            locks: LockArray::new(),
            buckets: CuckooBuckets::new(hp),
            minimum_load_factor: AtomicU64::new(DEFAULT_MINIMUM_LOAD_FACTOR.to_bits()),
            maximum_hashpower: AtomicUsize::new(NO_MAXIMUM_HASHPOWER),
        }
    }

    /// The current hashpower: the table has `2^hashpower()` buckets.
    pub fn hashpower(&self) -> usize {
        self.buckets.hashpower()
    }

    /// The current number of buckets.
    pub fn bucket_count(&self) -> usize {
        1 << self.hashpower()
    }

    /// The number of entries the table can hold without expanding.
    pub fn capacity(&self) -> usize {
        self.bucket_count() * SLOT_PER_BUCKET
    }

    /// The number of slots per bucket.
    pub fn slot_per_bucket(&self) -> usize {
        SLOT_PER_BUCKET
    }

    /// The number of entries in the table.
    ///
    /// This sums the per-lock element counters without locking, so under concurrent writers the
    /// result is a snapshot, exact once they quiesce.
    pub fn size(&self) -> usize {
        let sum: i64 = self.locks.iter().map(|lock| lock.elems()).sum();
        cmp::max(sum, 0) as usize
    }

    /// `size()`, under the name the standard containers use.
    pub fn len(&self) -> usize {
        self.size()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The fraction of slots currently occupied.
    pub fn load_factor(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }

    /// The hasher factory.
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// The minimum load factor for automatic expansion.
    pub fn minimum_load_factor(&self) -> f64 {
        f64::from_bits(self.minimum_load_factor.load(Ordering::Acquire))
    }

    /// Set the minimum load factor for automatic expansion; must lie in `[0, 1]`.
    pub fn set_minimum_load_factor(&self, mlf: f64) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&mlf) {
            return Err(Error::InvalidArgument("minimum load factor must lie in [0, 1]"));
        }

        self.minimum_load_factor.store(mlf.to_bits(), Ordering::Release);
        Ok(())
    }

    /// The maximum hashpower the table may grow to; `NO_MAXIMUM_HASHPOWER` means uncapped.
    pub fn maximum_hashpower(&self) -> usize {
        self.maximum_hashpower.load(Ordering::Acquire)
    }

    /// Cap (or uncap) the hashpower; the cap may not lie below the current hashpower.
    pub fn set_maximum_hashpower(&self, mhp: usize) -> Result<(), Error> {
        if mhp < self.hashpower() {
            return Err(Error::InvalidArgument("maximum hashpower below the current hashpower"));
        }

        self.maximum_hashpower.store(mhp, Ordering::Release);
        Ok(())
    }

    /// Look up `key` and return a snapshot of its value.
    ///
    /// This never locks. It snapshots the governing epochs, copies the candidate slots word by
    /// word, and retries until a copy validates.
    pub fn find(&self, key: &K) -> Option<V> {
        let hk = hashed(&self.hash_builder, key);

        loop {
            let hp = self.hashpower();
            let i1 = index_hash(hp, hk.hash);
            let i2 = alt_index(hp, hk.partial, i1);
            let l1 = LockArray::lock_ind(i1);
            let l2 = LockArray::lock_ind(i2);

            let e1 = self.locks.get(l1).epoch(Ordering::Acquire);
            let e2 = self.locks.get(l2).epoch(Ordering::Acquire);
            if Seqlock::is_locked(e1) || !Seqlock::is_migrated(e1)
                || Seqlock::is_locked(e2) || !Seqlock::is_migrated(e2)
            {
                // A writer (or an expansion not yet re-homed) owns a bucket we need.
                continue;
            }
            if self.hashpower() != hp {
                continue;
            }

            // The copies below may be torn or stale; the epoch recheck decides whether to trust
            // them.
            let result = self.find_in_buckets(&hk, key, i1, i2);

            // Order the epoch rereads after the snapshot loads.
            fence(Ordering::Acquire);
            if self.locks.get(l1).epoch(Ordering::Relaxed) == e1
                && self.locks.get(l2).epoch(Ordering::Relaxed) == e2
            {
                return result;
            }
        }
    }

    /// Does the table contain `key`?
    pub fn contains(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Insert `key` if absent. Returns `Ok(false)` (and changes nothing) if it was present.
    pub fn insert(&self, key: K, val: V) -> Result<bool, Error> {
        self.insert_with(key, val, |_, _| (), Mode::Unlocked)
    }

    /// Insert `key`, or overwrite its value if present. Returns whether it inserted.
    pub fn insert_or_assign(&self, key: K, val: V) -> Result<bool, Error> {
        self.insert_with(key, val, |bucket, slot| bucket.set_value(slot, val), Mode::Unlocked)
    }

    /// Insert `(key, val)` if absent, else run `fn` on a copy of the present value and store the
    /// result back. Returns whether it inserted.
    pub fn upsert<F: FnMut(&mut V)>(&self, key: K, mut f: F, val: V) -> Result<bool, Error> {
        self.insert_with(
            key,
            val,
            |bucket, slot| {
                let mut v = bucket.value(slot);
                f(&mut v);
                bucket.set_value(slot, v);
            },
            Mode::Unlocked,
        )
    }

    /// `upsert`, but running `fn` on the live value cell instead of a copy.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no concurrent reader of this key exists: the closure mutates
    /// storage a racing `find` would copy from, and such a read would see an unvalidatable
    /// intermediate state as a valid one.
    pub unsafe fn upsert_in_place<F: FnMut(&mut V)>(&self, key: K, mut f: F, val: V) -> Result<bool, Error> {
        self.insert_with(key, val, |bucket, slot| f(&mut *bucket.value_ptr(slot)), Mode::Unlocked)
    }

    /// Overwrite `key`'s value. Returns whether the key was present.
    pub fn update(&self, key: &K, val: V) -> bool {
        self.update_with(key, Mode::Unlocked, |bucket, slot| bucket.set_value(slot, val))
    }

    /// Run `f` on a copy of `key`'s value and store the result back. Returns whether the key was
    /// present.
    pub fn update_fn<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        self.update_with(key, Mode::Unlocked, |bucket, slot| {
            let mut v = bucket.value(slot);
            f(&mut v);
            bucket.set_value(slot, v);
        })
    }

    /// `update_fn`, but running `f` on the live value cell instead of a copy.
    ///
    /// # Safety
    ///
    /// As `upsert_in_place`: no reader of this key may run concurrently.
    pub unsafe fn update_fn_in_place<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        self.update_with(key, Mode::Unlocked, |bucket, slot| f(&mut *bucket.value_ptr(slot)))
    }

    /// Remove `key`. Returns whether it was present.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_inner(key, Mode::Unlocked)
    }

    /// Resize the table to `2^new_hp` buckets.
    ///
    /// Returns whether anything changed. Growing by one power re-homes keys in place; any other
    /// change rebuilds the table by reinserting every key.
    pub fn rehash(&self, new_hp: usize) -> Result<bool, Error> {
        let _all = self.lock_all();
        self.rehash_locked(new_hp)
    }

    /// Grow the table so it can hold at least `n` entries without further expansion.
    pub fn reserve(&self, n: usize) -> Result<bool, Error> {
        let _all = self.lock_all();
        let new_hp = reserve_calc(n);
        if new_hp <= self.hashpower() {
            return Ok(false);
        }
        self.rehash_locked(new_hp)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let _all = self.lock_all();
        self.buckets.clear();
        for lock in self.locks.iter() {
            lock.reset_elems();
        }
    }

    /// Take every lock, returning a handle for iteration and bulk mutation.
    ///
    /// While the handle lives, no other thread can write, and readers spin; operations through
    /// the handle skip per-operation locking entirely.
    pub fn lock_table(&self) -> LockedTable<K, V, S> {
        LockedTable { map: self, _all: self.lock_all() }
    }

    // ------------------------------------------------------------------------------------------
    // Hashing and probing.

    /// Scan both candidate buckets for `key`; also used by lock-free readers, whose copies the
    /// caller then validates.
    fn find_in_buckets(&self, hk: &HashedKey, key: &K, i1: usize, i2: usize) -> Option<V> {
        for &b in &[i1, i2] {
            let bucket = self.buckets.get(b);
            for slot in 0..SLOT_PER_BUCKET {
                if !bucket.occupied(slot) {
                    continue;
                }
                // The partial comparison fences off almost every non-matching slot without
                // touching the key.
                if bucket.partial(slot) != hk.partial {
                    continue;
                }
                if bucket.key(slot) == *key {
                    return Some(bucket.value(slot));
                }
            }
        }

        None
    }

    /// Under the held locks, classify where `key` is — or where it could go.
    fn find_slot(&self, hk: &HashedKey, key: &K, i1: usize, i2: usize) -> Slot {
        let mut free = [None, None];
        let mut free_count = [0, 0];

        for (which, &b) in [i1, i2].iter().enumerate() {
            let bucket = self.buckets.get(b);
            for slot in 0..SLOT_PER_BUCKET {
                if bucket.occupied(slot) {
                    if bucket.partial(slot) == hk.partial && bucket.key(slot) == *key {
                        return Slot::Exists(b, slot);
                    }
                } else {
                    if free[which].is_none() {
                        free[which] = Some(slot);
                    }
                    free_count[which] += 1;
                }
            }
        }

        // Prefer the candidate with more room; ties go to the first.
        if free_count[1] > free_count[0] {
            Slot::Free(i2, free[1].unwrap())
        } else if let Some(slot) = free[0] {
            Slot::Free(i1, slot)
        } else {
            Slot::Full
        }
    }

    /// Fill a slot and credit the governing lock's element counter.
    fn add_to_bucket(&self, b: usize, slot: usize, partial: Partial, key: K, val: V) {
        self.buckets.set_kv(self.buckets.get(b), slot, partial, key, val);
        self.locks.get(LockArray::lock_ind(b)).add_elems(1);
    }

    /// Empty a slot and debit the governing lock's element counter.
    fn del_from_bucket(&self, b: usize, slot: usize) {
        self.buckets.deoccupy(self.buckets.get(b), slot);
        self.locks.get(LockArray::lock_ind(b)).add_elems(-1);
    }

    // ------------------------------------------------------------------------------------------
    // Locking.

    /// Lock up to three distinct lock indices in ascending order, then verify the hashpower
    /// still is what the caller derived the bucket indices from, and re-home anything the locks
    /// govern that an expansion left behind.
    fn lock_many(&self, hp: usize, inds: &mut [usize], mode: Mode) -> Result<Guards, Race> {
        if mode == Mode::Locked {
            return Ok(Guards::none());
        }

        inds.sort_unstable();

        let mut guards = Guards::none();
        let mut held = 0;
        for (k, &l) in inds.iter().enumerate() {
            if k > 0 && inds[k - 1] == l {
                // Two buckets sharing a lock.
                continue;
            }
            let lock = self.locks.get(l);
            lock.lock();
            guards.locks[held] = Some(lock);
            held += 1;
        }

        if self.hashpower() != hp {
            // Resized under us; the caller recomputes everything. The guards unlock on drop.
            return Err(Race::HashpowerChanged);
        }

        for (k, &l) in inds.iter().enumerate() {
            if k > 0 && inds[k - 1] == l {
                continue;
            }
            self.migrate_lock(l);
        }

        Ok(guards)
    }

    /// Lock the lock governing bucket `i`.
    fn lock_one(&self, hp: usize, i: usize, mode: Mode) -> Result<Guards, Race> {
        self.lock_many(hp, &mut [LockArray::lock_ind(i)], mode)
    }

    /// Lock the locks governing buckets `i1` and `i2`.
    fn lock_two(&self, hp: usize, i1: usize, i2: usize, mode: Mode) -> Result<Guards, Race> {
        self.lock_many(hp, &mut [LockArray::lock_ind(i1), LockArray::lock_ind(i2)], mode)
    }

    /// Lock the locks governing three buckets.
    fn lock_three(&self, hp: usize, i1: usize, i2: usize, i3: usize, mode: Mode) -> Result<Guards, Race> {
        self.lock_many(
            hp,
            &mut [LockArray::lock_ind(i1), LockArray::lock_ind(i2), LockArray::lock_ind(i3)],
            mode,
        )
    }

    /// Take every lock in ascending order and finish any pending migration.
    fn lock_all(&self) -> AllLocks {
        for lock in self.locks.iter() {
            lock.lock();
        }
        for l in 0..LOCK_ARRAY_SIZE {
            self.migrate_lock(l);
        }

        AllLocks { locks: &self.locks }
    }

    // ------------------------------------------------------------------------------------------
    // Migration.

    /// If lock `l` still governs buckets an expansion hasn't re-homed, re-home them now.
    ///
    /// The caller must hold lock `l`. Migration needs no further locks: it only runs lazily
    /// when the pre-expansion table already had at least `LOCK_ARRAY_SIZE` buckets, in which
    /// case a bucket and its doubling image share their lock.
    fn migrate_lock(&self, l: usize) {
        let lock = self.locks.get(l);
        if Seqlock::is_migrated(lock.epoch(Ordering::Relaxed)) {
            return;
        }

        let hp = self.hashpower();
        let old_buckets = 1 << (hp - 1);
        debug_assert!(old_buckets >= LOCK_ARRAY_SIZE);

        let mut b = l;
        while b < old_buckets {
            self.migrate_bucket(b, hp);
            b += LOCK_ARRAY_SIZE;
        }

        lock.set_migrated(true);
    }

    /// Re-home bucket `b`'s slots for the expansion that raised the hashpower to `hp`.
    ///
    /// Each key either stays or moves to `b + 2^(hp-1)`, decided by the newly unmasked hash bit.
    /// The image bucket is virgin territory for exactly this bucket's slots, so each slot moves
    /// to its own index there.
    fn migrate_bucket(&self, b: usize, hp: usize) {
        let bucket = self.buckets.get(b);

        for slot in 0..SLOT_PER_BUCKET {
            if !bucket.occupied(slot) {
                continue;
            }

            let key = bucket.key(slot);
            let hk = hashed(&self.hash_builder, &key);
            let new_i1 = index_hash(hp, hk.hash);
            let target = if b == index_hash(hp - 1, hk.hash) {
                new_i1
            } else {
                alt_index(hp, hk.partial, new_i1)
            };
            debug_assert!(target == b || target == b + (1 << (hp - 1)));

            if target != b {
                let image = self.buckets.get(target);
                self.buckets.set_kv(image, slot, hk.partial, key, bucket.value(slot));
                self.buckets.deoccupy(bucket, slot);
            }
        }
    }

    // ------------------------------------------------------------------------------------------
    // The write driver.

    /// The insert driver behind `insert`, `insert_or_assign`, and `upsert`: find the key or a
    /// home for it, evicting or expanding as needed; `on_exists` runs (under the locks) when the
    /// key turns out to be present.
    fn insert_with<F>(&self, key: K, val: V, mut on_exists: F, mode: Mode) -> Result<bool, Error>
    where
        F: FnMut(&CuckooBucket<K, V>, usize),
    {
        let hk = hashed(&self.hash_builder, &key);

        loop {
            let hp = self.hashpower();
            let i1 = index_hash(hp, hk.hash);
            let i2 = alt_index(hp, hk.partial, i1);

            let guards = match self.lock_two(hp, i1, i2, mode) {
                Ok(guards) => guards,
                Err(_) => continue,
            };

            match self.find_slot(&hk, &key, i1, i2) {
                Slot::Exists(b, slot) => {
                    on_exists(self.buckets.get(b), slot);
                    return Ok(false);
                }
                Slot::Free(b, slot) => {
                    self.add_to_bucket(b, slot, hk.partial, key, val);
                    return Ok(true);
                }
                Slot::Full => {
                    // Search for an eviction chain with the locks dropped; the chain is
                    // revalidated edge by edge as it executes.
                    drop(guards);
                    match self.run_cuckoo(hp, i1, i2, mode) {
                        Ok((b, slot, _guards)) => {
                            // The table was briefly unlocked, so the key may have appeared.
                            if let Slot::Exists(eb, eslot) = self.find_slot(&hk, &key, i1, i2) {
                                on_exists(self.buckets.get(eb), eslot);
                                return Ok(false);
                            }
                            self.add_to_bucket(b, slot, hk.partial, key, val);
                            return Ok(true);
                        }
                        Err(Race::HashpowerChanged) => continue,
                        Err(Race::TableFull) => {
                            // No chain fits: expand. Load factor is checked before the
                            // hashpower cap.
                            let lf = self.load_factor();
                            if lf < self.minimum_load_factor() {
                                return Err(Error::LoadFactorTooLow(lf));
                            }
                            self.expand(hp, mode)?;
                        }
                    }
                }
            }
        }
    }

    /// The update driver behind the `update` family: run `apply` on the key's slot if present.
    fn update_with<F>(&self, key: &K, mode: Mode, apply: F) -> bool
    where
        F: FnOnce(&CuckooBucket<K, V>, usize),
    {
        let hk = hashed(&self.hash_builder, key);

        loop {
            let hp = self.hashpower();
            let i1 = index_hash(hp, hk.hash);
            let i2 = alt_index(hp, hk.partial, i1);

            let guards = match self.lock_two(hp, i1, i2, mode) {
                Ok(guards) => guards,
                Err(_) => continue,
            };

            return match self.find_slot(&hk, key, i1, i2) {
                Slot::Exists(b, slot) => {
                    apply(self.buckets.get(b), slot);
                    true
                }
                _ => {
                    // Nothing was written; let reader snapshots from before our lock survive.
                    guards.release_no_modified();
                    false
                }
            };
        }
    }

    fn erase_inner(&self, key: &K, mode: Mode) -> bool {
        let hk = hashed(&self.hash_builder, key);

        loop {
            let hp = self.hashpower();
            let i1 = index_hash(hp, hk.hash);
            let i2 = alt_index(hp, hk.partial, i1);

            let guards = match self.lock_two(hp, i1, i2, mode) {
                Ok(guards) => guards,
                Err(_) => continue,
            };

            return match self.find_slot(&hk, key, i1, i2) {
                Slot::Exists(b, slot) => {
                    self.del_from_bucket(b, slot);
                    true
                }
                _ => {
                    guards.release_no_modified();
                    false
                }
            };
        }
    }

    // ------------------------------------------------------------------------------------------
    // Eviction.

    /// Find and execute an eviction chain, freeing a slot in bucket `i1` or `i2`.
    ///
    /// On success the freed (bucket, slot) is returned along with guards holding both origin
    /// buckets' locks, under which the caller completes its insert.
    fn run_cuckoo(&self, hp: usize, i1: usize, i2: usize, mode: Mode) -> Result<(usize, usize, Guards), Race> {
        loop {
            let path = self.cuckoopath_search(hp, i1, i2, mode)?;

            if let Some(guards) = self.cuckoopath_move(hp, &path, i1, i2, mode)? {
                return Ok((path[0].bucket, path[0].slot, guards));
            }
            // The chain went stale while executing; plan a fresh one.
        }
    }

    /// Breadth-first search for the nearest slot reachable by a chain of single evictions from
    /// the candidate buckets, bounded by `MAX_BFS_PATH_LEN`.
    fn slot_search(&self, hp: usize, i1: usize, i2: usize, mode: Mode) -> Result<BfsSlot, Race> {
        let mut queue = BfsQueue::new();
        queue.enqueue(BfsSlot { bucket: i1, pathcode: 0, depth: 0 });
        queue.enqueue(BfsSlot { bucket: i2, pathcode: 1, depth: 0 });

        while !queue.is_empty() {
            let mut x = queue.dequeue();
            let _guard = self.lock_one(hp, x.bucket, mode)?;
            let bucket = self.buckets.get(x.bucket);

            // Start scanning at a pathcode-derived slot so concurrent searches don't all pile
            // onto slot 0.
            let starting_slot = x.pathcode % SLOT_PER_BUCKET;
            for i in 0..SLOT_PER_BUCKET {
                let slot = (starting_slot + i) % SLOT_PER_BUCKET;

                if !bucket.occupied(slot) {
                    // A free slot ends the search; extend the pathcode with the final hop.
                    x.pathcode = x.pathcode * SLOT_PER_BUCKET + slot;
                    return Ok(x);
                }

                if x.depth < MAX_BFS_PATH_LEN - 1 && !queue.is_full() {
                    // The bucket this occupant would be kicked to.
                    queue.enqueue(BfsSlot {
                        bucket: alt_index(hp, bucket.partial(slot), x.bucket),
                        pathcode: x.pathcode * SLOT_PER_BUCKET + slot,
                        depth: x.depth + 1,
                    });
                }
            }
        }

        Err(Race::TableFull)
    }

    /// Turn a successful search into a concrete chain: which occupant leaves which slot for
    /// which bucket. Buckets are re-inspected (briefly locked) one at a time; if a planned hop
    /// has meanwhile become free the chain just got shorter.
    fn cuckoopath_search(&self, hp: usize, i1: usize, i2: usize, mode: Mode) -> Result<Vec<PathRecord<K>>, Race> {
        let x = self.slot_search(hp, i1, i2, mode)?;

        // Decode the slot of every hop, last hop first.
        let mut slots = [0; MAX_BFS_PATH_LEN];
        let mut code = x.pathcode;
        for i in (0..=x.depth).rev() {
            slots[i] = code % SLOT_PER_BUCKET;
            code /= SLOT_PER_BUCKET;
        }
        // What remains of the code is which candidate bucket the chain starts in.
        let first_bucket = if code == 0 { i1 } else { i2 };

        let mut path = Vec::with_capacity(x.depth + 1);
        {
            let _guard = self.lock_one(hp, first_bucket, mode)?;
            let bucket = self.buckets.get(first_bucket);
            if !bucket.occupied(slots[0]) {
                // Someone freed the very first slot; no chain needed at all.
                path.push(PathRecord { bucket: first_bucket, slot: slots[0], key: None, partial: 0 });
                return Ok(path);
            }
            path.push(PathRecord {
                bucket: first_bucket,
                slot: slots[0],
                key: Some(bucket.key(slots[0])),
                partial: bucket.partial(slots[0]),
            });
        }

        for i in 1..=x.depth {
            let prev = path[i - 1];
            let b = alt_index(hp, prev.partial, prev.bucket);

            let _guard = self.lock_one(hp, b, mode)?;
            let bucket = self.buckets.get(b);
            if !bucket.occupied(slots[i]) {
                // This hop's destination is (still, or again) free; the chain ends here. This is
                // the expected exit for the final hop, and a windfall for any earlier one.
                path.push(PathRecord { bucket: b, slot: slots[i], key: None, partial: 0 });
                return Ok(path);
            }
            path.push(PathRecord {
                bucket: b,
                slot: slots[i],
                key: Some(bucket.key(slots[i])),
                partial: bucket.partial(slots[i]),
            });
        }

        // Even the search's free slot was refilled in the meantime. Hand the chain over anyway;
        // the move's revalidation will reject it and the caller plans a fresh one.
        Ok(path)
    }

    /// Execute a chain backwards — hole towards the candidate buckets — revalidating every edge
    /// under its pair of locks. Returns `None` (retry the search) if any edge went stale.
    fn cuckoopath_move(
        &self,
        hp: usize,
        path: &[PathRecord<K>],
        i1: usize,
        i2: usize,
        mode: Mode,
    ) -> Result<Option<Guards>, Race> {
        let mut depth = path.len() - 1;

        if depth == 0 {
            // The starting slot itself was free; just confirm that under the real locks.
            let guards = self.lock_two(hp, i1, i2, mode)?;
            if !self.buckets.get(path[0].bucket).occupied(path[0].slot) {
                return Ok(Some(guards));
            }
            return Ok(None);
        }

        while depth > 0 {
            let from = &path[depth - 1];
            let to = &path[depth];

            // The final hop must leave holding both origin buckets, so the insert can proceed
            // without another lock dance.
            let guards = if depth == 1 {
                self.lock_three(hp, i1, i2, to.bucket, mode)?
            } else {
                self.lock_two(hp, from.bucket, to.bucket, mode)?
            };

            let fb = self.buckets.get(from.bucket);
            let tb = self.buckets.get(to.bucket);

            // The plan was made without locks: the occupant may have moved, or the hole may
            // have been taken. Either way the chain is dead.
            let from_key = match from.key {
                Some(key) => key,
                None => return Ok(None),
            };
            if !fb.occupied(from.slot) || tb.occupied(to.slot) || fb.key(from.slot) != from_key {
                return Ok(None);
            }

            self.buckets.set_kv(tb, to.slot, fb.partial(from.slot), from_key, fb.value(from.slot));
            self.buckets.deoccupy(fb, from.slot);

            if depth == 1 {
                return Ok(Some(guards));
            }
            depth -= 1;
        }

        unreachable!();
    }

    // ------------------------------------------------------------------------------------------
    // Expansion.

    /// Fail if `new_hp` lies beyond the configured cap.
    fn check_hashpower_limit(&self, new_hp: usize) -> Result<(), Error> {
        let max = self.maximum_hashpower();
        if max != NO_MAXIMUM_HASHPOWER && new_hp > max {
            return Err(Error::MaximumHashpowerExceeded(new_hp));
        }

        Ok(())
    }

    /// Double the table in response to a failed insert.
    fn expand(&self, current_hp: usize, mode: Mode) -> Result<(), Error> {
        match mode {
            Mode::Unlocked => self.fast_double(current_hp),
            Mode::Locked => {
                // The caller holds every lock already; double and re-home eagerly.
                let new_hp = current_hp + 1;
                self.check_hashpower_limit(new_hp)?;
                unsafe {
                    self.buckets.double();
                }
                for b in 0..1 << current_hp {
                    self.migrate_bucket(b, new_hp);
                }
                Ok(())
            }
        }
    }

    /// Double the bucket count, re-homing keys in place.
    ///
    /// Small tables are re-homed eagerly while all locks are held. Tables past the lock-array
    /// size switch to lazy migration: every lock is flagged unmigrated and whoever locks it
    /// next re-homes its buckets — with a sweep afterwards so the migration also completes on a
    /// table nobody is writing to.
    fn fast_double(&self, current_hp: usize) -> Result<(), Error> {
        let all = self.lock_all();
        if self.hashpower() != current_hp {
            // Somebody else already expanded; the caller re-evaluates.
            return Ok(());
        }

        let new_hp = current_hp + 1;
        self.check_hashpower_limit(new_hp)?;

        unsafe {
            self.buckets.double();
        }

        if current_hp >= LOCK_ARRAY_POW {
            for lock in self.locks.iter() {
                lock.set_migrated(false);
            }
            drop(all);

            // The sweep: migrate anything writers haven't gotten to.
            for l in 0..LOCK_ARRAY_SIZE {
                let lock = self.locks.get(l);
                lock.lock();
                self.migrate_lock(l);
                lock.unlock();
            }
        } else {
            for b in 0..1 << current_hp {
                self.migrate_bucket(b, new_hp);
            }
        }

        Ok(())
    }

    /// `rehash`, with all locks already held.
    fn rehash_locked(&self, new_hp: usize) -> Result<bool, Error> {
        let hp = self.hashpower();
        if new_hp == hp {
            return Ok(false);
        }
        self.check_hashpower_limit(new_hp)?;

        if new_hp == hp + 1 {
            // One doubling: re-home in place.
            unsafe {
                self.buckets.double();
            }
            for b in 0..1 << hp {
                self.migrate_bucket(b, new_hp);
            }
            return Ok(true);
        }

        // An arbitrary jump: collect everything, resize, reinsert.
        let mut elems = Vec::with_capacity(self.size());
        for b in 0..1 << hp {
            let bucket = self.buckets.get(b);
            for slot in 0..SLOT_PER_BUCKET {
                if bucket.occupied(slot) {
                    elems.push((bucket.key(slot), bucket.value(slot)));
                }
            }
        }

        self.buckets.clear();
        for lock in self.locks.iter() {
            lock.reset_elems();
        }
        unsafe {
            self.buckets.resize(new_hp);
        }

        for (key, val) in elems {
            // Reinsertion can itself overflow (a shrink below the live size); the locked-mode
            // expansion handles that in place.
            self.insert_with(key, val, |_, _| (), Mode::Locked)?;
        }

        Ok(true)
    }
}

impl<K: Copy + Hash + Eq, V: Copy> Default for CuckooMap<K, V> {
    fn default() -> CuckooMap<K, V> {
        CuckooMap::new()
    }
}

impl<K: Copy + Hash + Eq, V: Copy, S: BuildHasher + Clone> Clone for CuckooMap<K, V, S> {
    fn clone(&self) -> CuckooMap<K, V, S> {
        let _all = self.lock_all();
        let hp = self.hashpower();

        let map = CuckooMap {
            hash_builder: self.hash_builder.clone(),
            locks: LockArray::new(),
            buckets: CuckooBuckets::new(hp),
            minimum_load_factor: AtomicU64::new(self.minimum_load_factor.load(Ordering::Acquire)),
            maximum_hashpower: AtomicUsize::new(self.maximum_hashpower.load(Ordering::Acquire)),
        };

        // A verbatim slot-for-slot copy preserves the candidate-bucket invariant by
        // construction.
        for b in 0..1 << hp {
            let bucket = self.buckets.get(b);
            for slot in 0..SLOT_PER_BUCKET {
                if bucket.occupied(slot) {
                    map.add_to_bucket(b, slot, bucket.partial(slot), bucket.key(slot), bucket.value(slot));
                }
            }
        }

        map
    }
}

impl<K: Copy + Hash + Eq + fmt::Debug, V: Copy + fmt::Debug, S: BuildHasher> fmt::Debug for CuckooMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let handle = self.lock_table();
        f.debug_map().entries(handle.iter()).finish()
    }
}

/// An exclusive handle to a `CuckooMap`, holding every lock.
///
/// Obtained through `CuckooMap::lock_table`. While it lives, the holder is the only writer and
/// may iterate, mutate in place, and resize without any per-operation locking. Dropping the
/// handle (or calling `unlock`) releases every lock.
pub struct LockedTable<'a, K: Copy + 'a, V: Copy + 'a, S: 'a> {
    map: &'a CuckooMap<K, V, S>,
    _all: AllLocks<'a>,
}

impl<'a, K: Copy + Hash + Eq, V: Copy, S: BuildHasher> LockedTable<'a, K, V, S> {
    /// Iterate over every entry.
    pub fn iter<'b>(&'b self) -> impl Iterator<Item = (K, V)> + 'b {
        let map = self.map;
        (0..map.bucket_count()).flat_map(move |b| {
            let bucket = map.buckets.get(b);
            (0..SLOT_PER_BUCKET).filter_map(move |slot| {
                if bucket.occupied(slot) {
                    Some((bucket.key(slot), bucket.value(slot)))
                } else {
                    None
                }
            })
        })
    }

    /// Run `f` over every entry, with the value mutable in place.
    pub fn for_each_mut<F: FnMut(K, &mut V)>(&self, mut f: F) {
        for b in 0..self.map.bucket_count() {
            let bucket = self.map.buckets.get(b);
            for slot in 0..SLOT_PER_BUCKET {
                if bucket.occupied(slot) {
                    // Exclusive access: every lock is ours for as long as the handle lives.
                    f(bucket.key(slot), unsafe { &mut *bucket.value_ptr(slot) });
                }
            }
        }
    }

    /// The number of entries.
    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Look up `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        let hk = hashed(&self.map.hash_builder, key);
        let hp = self.map.hashpower();
        let i1 = index_hash(hp, hk.hash);
        let i2 = alt_index(hp, hk.partial, i1);
        self.map.find_in_buckets(&hk, key, i1, i2)
    }

    /// Does the table contain `key`?
    pub fn contains(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Insert `key` if absent; see `CuckooMap::insert`.
    pub fn insert(&self, key: K, val: V) -> Result<bool, Error> {
        self.map.insert_with(key, val, |_, _| (), Mode::Locked)
    }

    /// Insert or overwrite; see `CuckooMap::insert_or_assign`.
    pub fn insert_or_assign(&self, key: K, val: V) -> Result<bool, Error> {
        self.map.insert_with(key, val, |bucket, slot| bucket.set_value(slot, val), Mode::Locked)
    }

    /// Overwrite `key`'s value if present.
    pub fn update(&self, key: &K, val: V) -> bool {
        self.map.update_with(key, Mode::Locked, |bucket, slot| bucket.set_value(slot, val))
    }

    /// Remove `key`.
    pub fn erase(&self, key: &K) -> bool {
        self.map.erase_inner(key, Mode::Locked)
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.map.buckets.clear();
        for lock in self.map.locks.iter() {
            lock.reset_elems();
        }
    }

    /// Resize to `2^new_hp` buckets; see `CuckooMap::rehash`.
    pub fn rehash(&self, new_hp: usize) -> Result<bool, Error> {
        self.map.rehash_locked(new_hp)
    }

    /// Grow to hold at least `n` entries; see `CuckooMap::reserve`.
    pub fn reserve(&self, n: usize) -> Result<bool, Error> {
        let new_hp = reserve_calc(n);
        if new_hp <= self.map.hashpower() {
            return Ok(false);
        }
        self.map.rehash_locked(new_hp)
    }

    /// Release the handle (equivalent to dropping it).
    pub fn unlock(self) {}
}

impl<'a, 'b, K, V, S, T> PartialEq<LockedTable<'b, K, V, T>> for LockedTable<'a, K, V, S>
where
    K: Copy + Hash + Eq,
    V: Copy + PartialEq,
    S: BuildHasher,
    T: BuildHasher,
{
    fn eq(&self, other: &LockedTable<'b, K, V, T>) -> bool {
        self.size() == other.size() && self.iter().all(|(key, val)| other.find(&key) == Some(val))
    }
}
