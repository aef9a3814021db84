//! Small shared helpers.

use std::hash::{BuildHasher, Hash, Hasher};

use bucket::SLOT_PER_BUCKET;

/// A key's hash, together with its one-byte projection.
pub struct HashedKey {
    /// The full 64-bit hash.
    pub hash: u64,
    /// The xor-fold of the hash down to one byte.
    pub partial: u8,
}

/// Hash `key` once, deriving both the full hash and the partial.
pub fn hashed<S: BuildHasher, K: Hash>(hash_builder: &S, key: &K) -> HashedKey {
    let mut hasher = hash_builder.build_hasher();
    key.hash(&mut hasher);
    let hash = hasher.finish();

    HashedKey { hash: hash, partial: partial_key(hash) }
}

/// Fold a 64-bit hash down to one byte, keeping every input bit involved.
fn partial_key(hash: u64) -> u8 {
    let h32 = hash as u32 ^ (hash >> 32) as u32;
    let h16 = h32 as u16 ^ (h32 >> 16) as u16;
    h16 as u8 ^ (h16 >> 8) as u8
}

/// The smallest hashpower at which `2^hashpower` buckets hold at least `n` slots.
pub fn reserve_calc(n: usize) -> usize {
    let buckets = (n + SLOT_PER_BUCKET - 1) / SLOT_PER_BUCKET;

    let mut hp = 0;
    while (1usize << hp) < buckets {
        hp += 1;
    }
    hp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_calc_bounds() {
        assert_eq!(reserve_calc(0), 0);
        assert_eq!(reserve_calc(1), 0);
        assert_eq!(reserve_calc(SLOT_PER_BUCKET), 0);
        assert_eq!(reserve_calc(SLOT_PER_BUCKET + 1), 1);
        assert_eq!(reserve_calc(5 * SLOT_PER_BUCKET), 3);

        for n in 1..200 {
            let hp = reserve_calc(n);
            // Enough room, and the smallest power that is.
            assert!((1 << hp) * SLOT_PER_BUCKET >= n);
            assert!(hp == 0 || (1 << (hp - 1)) * SLOT_PER_BUCKET < n);
        }
    }

    #[test]
    fn partial_folds_every_bit() {
        // Flipping any single bit of the hash flips the partial.
        let base = partial_key(0);
        for bit in 0..64 {
            assert_ne!(partial_key(1u64 << bit), base);
        }
    }
}
