//! The cuckoo table's lock array.
//!
//! Instead of one lock per bucket, the cuckoo table shares a fixed power-of-two array of
//! seqlocks between all buckets, with bucket `b` governed by lock `b mod LOCK_ARRAY_SIZE`. Two
//! properties fall out of the fixed size:
//!
//! - the lock footprint doesn't scale with the table, and
//! - once the table has at least `LOCK_ARRAY_SIZE` buckets, a bucket and its image under a
//!   capacity doubling (`b` and `b + bucket_count`) are governed by the *same* lock, which is
//!   what lets an expansion migrate lock by lock without juggling lock pairs.

use seqlock::Seqlock;
use storage::Storage;

/// The number of locks in the array.
pub const LOCK_ARRAY_SIZE: usize = 8192;

/// log2 of `LOCK_ARRAY_SIZE`.
pub const LOCK_ARRAY_POW: usize = 13;

/// The fixed array of seqlocks governing the buckets.
pub struct LockArray {
    /// The locks, stored segmented like everything else.
    locks: Storage<Seqlock>,
}

impl LockArray {
    /// Create the array, all locks free and migrated.
    pub fn new() -> LockArray {
        LockArray {
            locks: Storage::new(LOCK_ARRAY_POW, |_| Seqlock::new(false, true)),
        }
    }

    /// The lock index governing bucket `bucket`.
    pub fn lock_ind(bucket: usize) -> usize {
        bucket & (LOCK_ARRAY_SIZE - 1)
    }

    /// Get a lock by index.
    pub fn get(&self, ind: usize) -> &Seqlock {
        self.locks.get(ind)
    }

    /// Iterate over all locks.
    pub fn iter(&self) -> impl Iterator<Item = &Seqlock> {
        self.locks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_image_shares_lock() {
        // The migration protocol relies on this once the table outgrows the lock array.
        for hp in LOCK_ARRAY_POW..LOCK_ARRAY_POW + 3 {
            for b in (0..1 << hp).step_by(977) {
                assert_eq!(LockArray::lock_ind(b), LockArray::lock_ind(b + (1 << hp)));
            }
        }
    }
}
