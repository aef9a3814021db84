//! The Robin-Hood hash table.
//!
//! Open addressing with linear probing, with the classic Robin-Hood twist: every slot remembers
//! how far its key sits from the slot the hash originally assigned it (its displacement), and an
//! inserting key that has travelled further than a resident one takes the resident's place —
//! "rob the rich" — pushing the resident onwards. Displacement is capped by a window, so probes
//! are short and an insert that would overrun the window triggers a capacity doubling instead.
//!
//! The probing space is flat slot indices (bucket = index / `SLOT_PER_BUCKET`), and original
//! indices are confined below the table's top window, so a probe never wraps around.
//!
//! Concurrency is per-bucket: every bucket carries its own seqlock. Writers lock the probe's
//! first bucket, then append further bucket locks strictly in increasing index order as the
//! probe advances, which rules out lock cycles between concurrent writers. Readers take no
//! locks: they collect the epoch of every bucket their probe crosses, copy what they need, and
//! revalidate the whole trail.

mod bucket;

#[cfg(test)]
mod tests;

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::{cmp, fmt};

use bucket::{SLOT_PER_BUCKET, SLOT_PER_BUCKET_POW};
use error::Error;
use seqlock::{Epoch, Seqlock};
use util::{hashed, reserve_calc};
use DefaultHashBuilder;
use NO_MAXIMUM_HASHPOWER;

use self::bucket::{RhBucket, RhBuckets};

/// The default number of slots an empty table can hold.
pub const DEFAULT_CAPACITY: usize = (1 << 16) * SLOT_PER_BUCKET;

/// The hard cap on any key's displacement from its original slot.
pub const MAX_WINDOW_SIZE: usize = 64;

/// Mask extracting the slot from a flat index.
const BUCKET_MASK: usize = SLOT_PER_BUCKET - 1;

/// The displacement window at slot-level hashpower `hp`: generous for big tables, but never
/// past the hard cap the index layout reserves room for.
fn window_size(hp: usize) -> usize {
    cmp::min(hp + 1, MAX_WINDOW_SIZE)
}

/// The original (slot-level) index of a hash, confined so that `original + window` never runs
/// off the table: the top `MAX_WINDOW_SIZE` slots are reachable by displacement only.
fn original_index(hp: usize, hash: u64) -> usize {
    let size_mask = (1usize << hp) - 1;
    let index = hash as usize & size_mask;
    let border = size_mask - MAX_WINDOW_SIZE;

    if index <= border {
        index
    } else {
        index - border
    }
}

/// Whether a write runs against the live table or inside a resize that already holds every
/// bucket lock.
#[derive(Clone, Copy, PartialEq)]
enum Mode {
    /// Lock buckets as the probe advances.
    Unlocked,
    /// Every bucket lock is held by the caller; locking is a no-op.
    Locked,
}

/// How a probe step classified the slot under the cursor.
enum Cycle {
    /// The probe ran past the displacement window.
    OutOfWindow,
    /// A free slot: the key is absent and this is where it belongs.
    NotOccupied,
    /// A resident with a smaller displacement: the key is absent, and an insert would rob this
    /// slot.
    LessDist,
    /// The key itself.
    Equal,
}

/// Where a reader's probe ended.
enum Find {
    /// A lock or a resize got in the way; start over.
    Retry,
    /// The cursor sits on the key.
    Found,
    /// The key is absent.
    NotFound,
}

/// A probe cursor: the bucket/slot under inspection and the displacement so far.
struct Probe {
    bucket: usize,
    slot: usize,
    dist: usize,
    /// The slot-level hashpower the probe was planned against.
    hp: usize,
    /// The displacement window at that hashpower.
    window: usize,
}

/// The bucket locks a writer has appended, in increasing index order. Unlocks on drop.
struct LockList<'a> {
    locks: Vec<&'a Seqlock>,
}

impl<'a> LockList<'a> {
    fn with_capacity(cap: usize) -> LockList<'a> {
        LockList { locks: Vec::with_capacity(cap) }
    }

    fn push(&mut self, lock: &'a Seqlock) {
        self.locks.push(lock);
    }

    /// Release every lock declaring that nothing was modified, so reader snapshots from before
    /// the locks were taken still validate.
    fn release_no_modified(mut self) {
        for lock in self.locks.drain(..) {
            lock.unlock_no_modified();
        }
    }
}

impl<'a> Drop for LockList<'a> {
    fn drop(&mut self) {
        for lock in self.locks.drain(..).rev() {
            lock.unlock();
        }
    }
}

/// Every bucket lock, held. On drop, publishes every bucket as migrated and unlocks it —
/// including buckets that were appended (born locked) while the guard was alive.
struct AllBuckets<'a, K: Copy + 'a, V: Copy + 'a> {
    buckets: &'a RhBuckets<K, V>,
}

impl<'a, K: Copy, V: Copy> Drop for AllBuckets<'a, K, V> {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            bucket.seqlock().set_migrated(true);
            bucket.seqlock().unlock();
        }
    }
}

/// A concurrent Robin-Hood hash map.
///
/// Keys and values must be trivially copyable (`Copy`); readers copy them out of live storage
/// and validate through the bucket seqlocks' epochs. Lookups never lock.
pub struct RhMap<K, V, S = DefaultHashBuilder> {
    /// The hasher factory.
    hash_builder: S,
    /// The buckets (each carrying its own lock).
    buckets: RhBuckets<K, V>,
    /// The hashpower cap, or `NO_MAXIMUM_HASHPOWER`.
    maximum_hashpower: AtomicUsize,
}

impl<K: Copy + Hash + Eq, V: Copy> RhMap<K, V, DefaultHashBuilder> {
    /// Create a table with the default capacity.
    pub fn new() -> RhMap<K, V> {
        RhMap::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a table able to hold at least `n` entries before expanding.
    pub fn with_capacity(n: usize) -> RhMap<K, V> {
        RhMap::with_hasher(n, DefaultHashBuilder::default())
    }
}

impl<K: Copy + Hash + Eq, V: Copy, S: BuildHasher> RhMap<K, V, S> {
    /// Create a table able to hold `n` entries, hashing with `hash_builder`.
    pub fn with_hasher(n: usize, hash_builder: S) -> RhMap<K, V, S> {
        // The extra window's worth of slots keeps the displacement-only top region out of the
        // original-index range even for tiny tables.
        let hp = reserve_calc(n + MAX_WINDOW_SIZE + 1);

        RhMap {
            hash_builder: hash_builder,
            buckets: RhBuckets::new(hp),
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
    /// Sums the per-bucket element counters without locking; a snapshot under concurrent
    /// writers, exact once they quiesce.
    pub fn size(&self) -> usize {
        let sum: i64 = self.buckets.iter().map(|bucket| bucket.seqlock().elems()).sum();
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
    /// This never locks: the probe collects the epoch of every bucket it crosses, copies the
    /// value on a match, and revalidates the whole trail before trusting anything.
    pub fn find(&self, key: &K) -> Option<V> {
        loop {
            let mut probe = self.probe_start(key);
            let mut epochs = Vec::with_capacity(probe.window / SLOT_PER_BUCKET + 2);

            let status = match self.collect_epochs(key, &mut probe, &mut epochs) {
                Find::Retry => continue,
                status => status,
            };

            // Copy the value before validating; the copies may be torn or stale, and the epoch
            // trail decides whether to trust them.
            let value = match status {
                Find::Found => Some(self.buckets.get(probe.bucket).value(probe.slot)),
                _ => None,
            };

            // Order the epoch rereads after the snapshot loads.
            fence(Ordering::Acquire);
            if self.check_epochs(&probe, &epochs) {
                return value;
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
    /// storage a racing `find` would copy from.
    pub unsafe fn upsert_in_place<F: FnMut(&mut V)>(&self, key: K, mut f: F, val: V) -> Result<bool, Error> {
        self.insert_with(key, val, |bucket, slot| f(&mut *bucket.value_ptr(slot)), Mode::Unlocked)
    }

    /// Overwrite `key`'s value. Returns whether the key was present.
    pub fn update(&self, key: &K, val: V) -> bool {
        self.update_with(key, |bucket, slot| bucket.set_value(slot, val))
    }

    /// Run `f` on a copy of `key`'s value and store the result back. Returns whether the key
    /// was present.
    pub fn update_fn<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        self.update_with(key, |bucket, slot| {
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
        self.update_with(key, |bucket, slot| f(&mut *bucket.value_ptr(slot)))
    }

    /// Remove `key`, shifting the tail of its cluster back over the hole. Returns whether it
    /// was present.
    pub fn erase(&self, key: &K) -> bool {
        loop {
            let mut probe = self.probe_start(key);
            let mut locks = LockList::with_capacity(probe.window / SLOT_PER_BUCKET + 2);
            if !self.lock_first(&probe, &mut locks) {
                continue;
            }

            match self.probe_cycle(key, &mut probe, &mut locks, Mode::Unlocked) {
                Cycle::Equal => {
                    self.del_from_bucket(probe.bucket, probe.slot);
                    self.shift_back_from(&mut probe, &mut locks);
                    return true;
                }
                _ => {
                    // Nothing was written; let reader snapshots from before our locks survive.
                    locks.release_no_modified();
                    return false;
                }
            }
        }
    }

    /// Grow the table to `2^new_hp` buckets. Robin-Hood tables only grow; a target at or below
    /// the current hashpower changes nothing.
    pub fn rehash(&self, new_hp: usize) -> Result<bool, Error> {
        if new_hp <= self.hashpower() {
            return Ok(false);
        }
        self.check_hashpower_limit(new_hp)?;

        while self.hashpower() < new_hp {
            self.fast_double(self.index_power())?;
        }

        Ok(true)
    }

    /// Grow the table so it can hold at least `n` entries without further expansion.
    pub fn reserve(&self, n: usize) -> Result<bool, Error> {
        self.rehash(reserve_calc(n + MAX_WINDOW_SIZE + 1))
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let _all = self.lock_all();

        for bucket in self.buckets.iter() {
            for slot in 0..SLOT_PER_BUCKET {
                if bucket.occupied(slot) {
                    self.buckets.deoccupy(bucket, slot);
                }
            }
            bucket.seqlock().reset_elems();
        }
    }

    // ------------------------------------------------------------------------------------------
    // Probing.

    /// The slot-level hashpower: the table addresses `2^index_power()` flat slots.
    fn index_power(&self) -> usize {
        self.buckets.hashpower() + SLOT_PER_BUCKET_POW
    }

    /// Set up a probe cursor at `key`'s original slot.
    fn probe_start(&self, key: &K) -> Probe {
        let hp = self.index_power();
        let index = original_index(hp, hashed(&self.hash_builder, key).hash);

        Probe {
            bucket: index >> SLOT_PER_BUCKET_POW,
            slot: index & BUCKET_MASK,
            dist: 0,
            hp: hp,
            window: window_size(hp),
        }
    }

    /// Lock the probe's first bucket and make sure the table wasn't resized since the probe was
    /// planned; on a resize the lock is dropped and the caller starts over.
    fn lock_first<'a>(&'a self, probe: &Probe, locks: &mut LockList<'a>) -> bool {
        let lock = self.buckets.get(probe.bucket).seqlock();
        lock.lock();

        if self.index_power() != probe.hp {
            lock.unlock();
            return false;
        }

        locks.push(lock);
        true
    }

    /// Advance the probe to the next bucket, locking it first (in `Mode::Unlocked`). Bucket
    /// indices only ever increase, which is the whole deadlock story.
    fn next_bucket<'a>(&'a self, probe: &mut Probe, locks: &mut LockList<'a>, mode: Mode) {
        probe.bucket += 1;
        probe.slot = 0;

        if mode == Mode::Unlocked {
            let lock = self.buckets.get(probe.bucket).seqlock();
            lock.lock();
            locks.push(lock);
        }
    }

    /// Walk the probe forward, classifying the first decisive slot.
    fn probe_cycle<'a>(&'a self, key: &K, probe: &mut Probe, locks: &mut LockList<'a>, mode: Mode) -> Cycle {
        loop {
            while probe.slot < SLOT_PER_BUCKET {
                if probe.dist > probe.window {
                    return Cycle::OutOfWindow;
                }

                let bucket = self.buckets.get(probe.bucket);
                if !bucket.occupied(probe.slot) {
                    return Cycle::NotOccupied;
                }
                if (bucket.dist(probe.slot) as usize) < probe.dist {
                    return Cycle::LessDist;
                }
                if bucket.key(probe.slot) == *key {
                    return Cycle::Equal;
                }

                probe.slot += 1;
                probe.dist += 1;
            }

            if probe.dist > probe.window {
                return Cycle::OutOfWindow;
            }
            self.next_bucket(probe, locks, mode);
        }
    }

    /// The reader's probe: collect each crossed bucket's epoch and stop at the key, at evidence
    /// of its absence, or at anything that forces a retry.
    fn collect_epochs(&self, key: &K, probe: &mut Probe, epochs: &mut Vec<Epoch>) -> Find {
        let first = self.buckets.get(probe.bucket).seqlock().epoch(Ordering::Acquire);
        epochs.push(first);
        if Seqlock::is_locked(first) || self.index_power() != probe.hp {
            return Find::Retry;
        }

        loop {
            while probe.slot < SLOT_PER_BUCKET {
                let bucket = self.buckets.get(probe.bucket);
                let occupied = bucket.occupied(probe.slot);
                let dist = bucket.dist(probe.slot) as usize;

                if Self::no_further_data(probe, occupied, dist) {
                    return Find::NotFound;
                }
                if bucket.key(probe.slot) == *key {
                    return Find::Found;
                }

                probe.slot += 1;
                probe.dist += 1;
            }

            if probe.dist > probe.window {
                return Find::NotFound;
            }

            probe.bucket += 1;
            probe.slot = 0;
            let epoch = self.buckets.get(probe.bucket).seqlock().epoch(Ordering::Acquire);
            epochs.push(epoch);
            if Seqlock::is_locked(epoch) {
                return Find::Retry;
            }
        }
    }

    /// No slot at or past the cursor can hold the key: the cursor slot is free, out of window,
    /// or holds a key so much closer to home that ours would have been placed before it. The
    /// one-slot slack (`dist + 1`) tolerates a concurrent backward shift.
    fn no_further_data(probe: &Probe, occupied: bool, dist: usize) -> bool {
        probe.dist > probe.window || !occupied || dist + 1 < probe.dist
    }

    /// Revalidate every epoch the probe collected, oldest bucket first.
    fn check_epochs(&self, probe: &Probe, epochs: &[Epoch]) -> bool {
        let first_bucket = probe.bucket + 1 - epochs.len();
        epochs
            .iter()
            .enumerate()
            .all(|(i, &epoch)| self.buckets.get(first_bucket + i).seqlock().epoch(Ordering::Relaxed) == epoch)
    }

    // ------------------------------------------------------------------------------------------
    // Slot bookkeeping.

    /// Fill a slot and credit the bucket's element counter.
    fn add_to_bucket(&self, b: usize, slot: usize, dist: u16, key: K, val: V) {
        let bucket = self.buckets.get(b);
        self.buckets.set_kv(bucket, slot, dist, key, val);
        bucket.seqlock().add_elems(1);
    }

    /// Empty a slot and debit the bucket's element counter.
    fn del_from_bucket(&self, b: usize, slot: usize) {
        let bucket = self.buckets.get(b);
        self.buckets.deoccupy(bucket, slot);
        bucket.seqlock().add_elems(-1);
    }

    // ------------------------------------------------------------------------------------------
    // The write driver.

    /// The insert driver behind `insert`, `insert_or_assign`, and `upsert`; `on_exists` runs
    /// (under the locks) when the key turns out to be present.
    fn insert_with<F>(&self, key: K, val: V, mut on_exists: F, mode: Mode) -> Result<bool, Error>
    where
        F: FnMut(&RhBucket<K, V>, usize),
    {
        loop {
            let mut probe = self.probe_start(&key);
            let mut locks = LockList::with_capacity(probe.window / SLOT_PER_BUCKET + 2);
            if mode == Mode::Unlocked {
                if !self.lock_first(&probe, &mut locks) {
                    continue;
                }
            }

            match self.probe_cycle(&key, &mut probe, &mut locks, mode) {
                Cycle::OutOfWindow => {
                    // The cluster is longer than the window allows; double and try again.
                    drop(locks);
                    self.expand(probe.hp, mode)?;
                }
                Cycle::NotOccupied => {
                    self.add_to_bucket(probe.bucket, probe.slot, probe.dist as u16, key, val);
                    return Ok(true);
                }
                Cycle::LessDist => {
                    // Rob the rich — but only once it's certain the displaced chain has a home
                    // within the window.
                    if mode == Mode::Unlocked && !self.path_exists(&probe, &mut locks) {
                        drop(locks);
                        self.expand(probe.hp, mode)?;
                        continue;
                    }
                    self.move_path(&mut probe, key, val);
                    return Ok(true);
                }
                Cycle::Equal => {
                    on_exists(self.buckets.get(probe.bucket), probe.slot);
                    return Ok(false);
                }
            }
        }
    }

    /// The update driver behind the `update` family: run `apply` on the key's slot if present.
    fn update_with<F>(&self, key: &K, apply: F) -> bool
    where
        F: FnOnce(&RhBucket<K, V>, usize),
    {
        loop {
            let mut probe = self.probe_start(key);
            let mut locks = LockList::with_capacity(probe.window / SLOT_PER_BUCKET + 2);
            if !self.lock_first(&probe, &mut locks) {
                continue;
            }

            return match self.probe_cycle(key, &mut probe, &mut locks, Mode::Unlocked) {
                Cycle::Equal => {
                    apply(self.buckets.get(probe.bucket), probe.slot);
                    true
                }
                _ => {
                    locks.release_no_modified();
                    false
                }
            };
        }
    }

    /// From a `LessDist` stop, verify the displaced chain finds a free slot within the window,
    /// locking the buckets it crosses (they are exactly the buckets `move_path` will touch).
    fn path_exists<'a>(&'a self, probe: &Probe, locks: &mut LockList<'a>) -> bool {
        let mut bucket = probe.bucket;
        let mut slot = probe.slot + 1;
        // The displaced occupant's displacement as the chain walks on.
        let mut current_dist = self.buckets.get(probe.bucket).dist(probe.slot) as usize + 1;
        let mut dist = probe.dist + 1;

        loop {
            while slot < SLOT_PER_BUCKET {
                if dist > probe.window {
                    return false;
                }

                let b = self.buckets.get(bucket);
                if !b.occupied(slot) {
                    return true;
                }
                if (b.dist(slot) as usize) < current_dist {
                    current_dist = b.dist(slot) as usize;
                }

                current_dist += 1;
                dist += 1;
                slot += 1;
            }

            if dist > probe.window {
                return false;
            }

            bucket += 1;
            slot = 0;
            let lock = self.buckets.get(bucket).seqlock();
            lock.lock();
            locks.push(lock);
        }
    }

    /// Execute the robbery: place the incoming pair at the cursor and ripple the displaced
    /// occupants forward, each taking the next slot it out-ranks, until one lands in a free
    /// slot. Every bucket this touches is already locked (by the probe and `path_exists`).
    fn move_path(&self, probe: &mut Probe, key: K, val: V) {
        let bucket = self.buckets.get(probe.bucket);

        let mut carry_key = bucket.key(probe.slot);
        let mut carry_val = bucket.value(probe.slot);
        let carry_dist = bucket.dist(probe.slot) as usize;
        self.buckets.deoccupy(bucket, probe.slot);
        self.buckets.set_kv(bucket, probe.slot, probe.dist as u16, key, val);

        probe.slot += 1;
        probe.dist = carry_dist + 1;

        loop {
            while probe.slot < SLOT_PER_BUCKET {
                let b = self.buckets.get(probe.bucket);

                if !b.occupied(probe.slot) {
                    self.add_to_bucket(probe.bucket, probe.slot, probe.dist as u16, carry_key, carry_val);
                    return;
                }

                if (b.dist(probe.slot) as usize) < probe.dist {
                    // The carried pair out-ranks this resident; swap them.
                    let next_key = b.key(probe.slot);
                    let next_val = b.value(probe.slot);
                    let next_dist = b.dist(probe.slot) as usize;

                    self.buckets.deoccupy(b, probe.slot);
                    self.buckets.set_kv(b, probe.slot, probe.dist as u16, carry_key, carry_val);

                    carry_key = next_key;
                    carry_val = next_val;
                    probe.dist = next_dist;
                }

                probe.slot += 1;
                probe.dist += 1;
            }

            probe.bucket += 1;
            probe.slot = 0;
            debug_assert!(probe.bucket < self.bucket_count());
        }
    }

    /// After a deletion at the probe cursor, move every following slot of the cluster one slot
    /// back (displacement minus one), stopping at a free slot or a key that is already home.
    fn shift_back_from<'a>(&'a self, probe: &mut Probe, locks: &mut LockList<'a>) {
        probe.slot += 1;
        probe.dist += 1;

        loop {
            while probe.slot < SLOT_PER_BUCKET {
                let bucket = self.buckets.get(probe.bucket);
                if !bucket.occupied(probe.slot) || bucket.dist(probe.slot) == 0 {
                    return;
                }

                self.shift_back(probe.bucket, probe.slot);
                probe.slot += 1;
            }

            if probe.bucket + 1 == self.bucket_count() {
                // The cluster runs into the end of the table; there is nothing beyond to shift.
                return;
            }
            self.next_bucket(probe, locks, Mode::Unlocked);
        }
    }

    /// Move the occupant of (b, slot) one flat slot back.
    fn shift_back(&self, b: usize, slot: usize) {
        let bucket = self.buckets.get(b);
        let dist = bucket.dist(slot) - 1;

        if slot == 0 {
            // Crossing a bucket boundary moves the element between counters.
            self.add_to_bucket(b - 1, SLOT_PER_BUCKET - 1, dist, bucket.key(0), bucket.value(0));
            bucket.seqlock().add_elems(-1);
            self.buckets.deoccupy(bucket, 0);
        } else {
            self.buckets.set_kv(bucket, slot - 1, dist, bucket.key(slot), bucket.value(slot));
            self.buckets.deoccupy(bucket, slot);
        }
    }

    // ------------------------------------------------------------------------------------------
    // Expansion.

    /// Fail if `new_hp` (bucket-level) lies beyond the configured cap.
    fn check_hashpower_limit(&self, new_hp: usize) -> Result<(), Error> {
        let max = self.maximum_hashpower();
        if max != NO_MAXIMUM_HASHPOWER && new_hp > max {
            return Err(Error::MaximumHashpowerExceeded(new_hp));
        }

        Ok(())
    }

    /// Take every bucket lock in index order.
    fn lock_all(&self) -> AllBuckets<K, V> {
        for bucket in self.buckets.iter() {
            bucket.seqlock().lock();
        }

        AllBuckets { buckets: &self.buckets }
    }

    /// Double the table in response to a failed insert.
    fn expand(&self, current_hp: usize, mode: Mode) -> Result<(), Error> {
        match mode {
            Mode::Unlocked => self.fast_double(current_hp),
            Mode::Locked => {
                // Re-homing during a resize ran out of window; append another (locked) segment.
                // The resize guard will publish and unlock it with everything else.
                self.check_hashpower_limit(self.buckets.hashpower() + 1)?;
                unsafe {
                    self.buckets.double_locked();
                }
                Ok(())
            }
        }
    }

    /// Double the bucket count and re-home the old half in place.
    ///
    /// All bucket locks are taken (the new half is born locked); then every element of the old
    /// half, in flat order, either moves forward into the new half (re-inserted in locked
    /// mode), or — tracking how much free space the sweep has opened behind it — is compacted
    /// backwards to shrink its displacement. Finally every bucket is published as migrated and
    /// unlocked by the guard.
    fn fast_double(&self, current_hp: usize) -> Result<(), Error> {
        let _all = self.lock_all();
        if self.index_power() != current_hp {
            // Somebody else already expanded; the caller re-evaluates.
            return Ok(());
        }

        self.check_hashpower_limit(self.buckets.hashpower() + 1)?;

        unsafe {
            self.buckets.double_locked();
        }
        let new_hp = current_hp + 1;

        let mut free_behind = 0usize;
        for index in 0..1usize << current_hp {
            let b = index >> SLOT_PER_BUCKET_POW;
            let slot = index & BUCKET_MASK;
            let bucket = self.buckets.get(b);

            if !bucket.occupied(slot) {
                free_behind += 1;
                continue;
            }

            let key = bucket.key(slot);
            let target = original_index(new_hp, hashed(&self.hash_builder, &key).hash);

            if target > index {
                // The new hash bit points into the new half; a locked-mode insert re-homes it.
                self.insert_with(key, bucket.value(slot), |_, _| (), Mode::Locked)?;
                self.del_from_bucket(b, slot);
                free_behind += 1;
            } else if bucket.dist(slot) != 0 && free_behind > 0 {
                // It stays in the old half, and the sweep has opened room behind it: compact it
                // backwards as far as its original slot allows.
                let best_index = cmp::max(target, index - free_behind);
                self.add_to_bucket(
                    best_index >> SLOT_PER_BUCKET_POW,
                    best_index & BUCKET_MASK,
                    (best_index - target) as u16,
                    key,
                    bucket.value(slot),
                );
                self.del_from_bucket(b, slot);
                free_behind = index - best_index;
            } else {
                free_behind = 0;
            }
        }

        Ok(())
    }
}

impl<K: Copy + Hash + Eq, V: Copy> Default for RhMap<K, V> {
    fn default() -> RhMap<K, V> {
        RhMap::new()
    }
}

impl<K: Copy + Hash + Eq, V: Copy, S: BuildHasher + Clone> Clone for RhMap<K, V, S> {
    fn clone(&self) -> RhMap<K, V, S> {
        let _all = self.lock_all();
        let hp = self.hashpower();

        let map = RhMap {
            hash_builder: self.hash_builder.clone(),
            buckets: RhBuckets::new(hp),
            maximum_hashpower: AtomicUsize::new(self.maximum_hashpower.load(Ordering::Acquire)),
        };

        // A verbatim slot-for-slot copy (displacements included) preserves the Robin-Hood
        // layout by construction.
        for b in 0..1 << hp {
            let bucket = self.buckets.get(b);
            for slot in 0..SLOT_PER_BUCKET {
                if bucket.occupied(slot) {
                    map.add_to_bucket(b, slot, bucket.dist(slot), bucket.key(slot), bucket.value(slot));
                }
            }
        }

        map
    }
}

impl<K: Copy + Hash + Eq + fmt::Debug, V: Copy + fmt::Debug, S: BuildHasher> fmt::Debug for RhMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let _all = self.lock_all();

        let entries = self.buckets.iter().flat_map(|bucket| {
            (0..SLOT_PER_BUCKET).filter_map(move |slot| {
                if bucket.occupied(slot) {
                    Some((bucket.key(slot), bucket.value(slot)))
                } else {
                    None
                }
            })
        });

        f.debug_map().entries(entries).finish()
    }
}
