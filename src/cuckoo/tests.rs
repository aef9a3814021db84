use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use super::*;
use util::hashed;

/// A hasher that sends every key to bucket zero, for forcing collisions.
#[derive(Clone, Default)]
struct ZeroHashBuilder;

struct ZeroHasher;

impl Hasher for ZeroHasher {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, _: &[u8]) {}
}

impl BuildHasher for ZeroHashBuilder {
    type Hasher = ZeroHasher;

    fn build_hasher(&self) -> ZeroHasher {
        ZeroHasher
    }
}

/// Walk every bucket and check the structural invariants: each key sits in one of its two
/// candidate buckets, with the partial byte matching its hash.
fn assert_invariants(map: &CuckooMap<u64, u64>) {
    let hp = map.hashpower();
    let mut entries = 0;

    for b in 0..map.bucket_count() {
        let bucket = map.buckets.get(b);
        for slot in 0..SLOT_PER_BUCKET {
            if !bucket.occupied(slot) {
                continue;
            }
            entries += 1;

            let hk = hashed(map.hasher(), &bucket.key(slot));
            assert_eq!(bucket.partial(slot), hk.partial);

            let i1 = index_hash(hp, hk.hash);
            let i2 = alt_index(hp, hk.partial, i1);
            assert!(b == i1 || b == i2);
        }
    }

    assert_eq!(entries, map.size());
}

#[test]
fn insert_find_erase() {
    let map = CuckooMap::with_capacity(64);

    assert_eq!(map.insert(1u64, 10u64), Ok(true));
    assert_eq!(map.insert(2, 20), Ok(true));
    assert_eq!(map.insert(3, 30), Ok(true));

    assert_eq!(map.find(&2), Some(20));
    assert!(map.erase(&2));
    assert_eq!(map.find(&2), None);
    assert!(!map.erase(&2));

    assert_eq!(map.size(), 2);
    assert_invariants(&map);
}

#[test]
fn insert_refuses_duplicates() {
    let map = CuckooMap::with_capacity(64);

    assert_eq!(map.insert(1u64, 10u64), Ok(true));
    assert_eq!(map.insert(1, 99), Ok(false));
    // The old value survives a refused insert.
    assert_eq!(map.find(&1), Some(10));
    assert_eq!(map.size(), 1);
}

#[test]
fn insert_or_assign_semantics() {
    let map = CuckooMap::with_capacity(64);

    assert_eq!(map.insert(7u64, 70u64), Ok(true));
    assert_eq!(map.insert_or_assign(7, 71), Ok(false));
    assert_eq!(map.find(&7), Some(71));
    assert_eq!(map.size(), 1);

    assert_eq!(map.insert_or_assign(8, 80), Ok(true));
    assert_eq!(map.find(&8), Some(80));
    assert_eq!(map.size(), 2);
}

#[test]
fn contains() {
    let map = CuckooMap::with_capacity(64);
    map.insert(5u64, 50u64).unwrap();

    assert!(map.contains(&5));
    assert!(!map.contains(&6));
}

#[test]
fn update_family() {
    let map = CuckooMap::with_capacity(64);
    map.insert(1u64, 1u64).unwrap();

    assert!(map.update(&1, 2));
    assert_eq!(map.find(&1), Some(2));
    assert!(!map.update(&42, 0));

    assert!(map.update_fn(&1, |v| *v *= 10));
    assert_eq!(map.find(&1), Some(20));
    assert!(!map.update_fn(&42, |v| *v += 1));

    // The in-place variant; no concurrent readers here.
    unsafe {
        assert!(map.update_fn_in_place(&1, |v| *v += 1));
    }
    assert_eq!(map.find(&1), Some(21));
}

#[test]
fn upsert_inserts_then_updates() {
    let map = CuckooMap::with_capacity(64);

    assert_eq!(map.upsert(9u64, |v| *v += 1, 90u64), Ok(true));
    assert_eq!(map.find(&9), Some(90));

    assert_eq!(map.upsert(9, |v| *v += 1, 0), Ok(false));
    assert_eq!(map.find(&9), Some(91));
}

#[test]
fn forced_expansion_under_min_load_factor() {
    // Every key hashes to the same bucket pair: after 2 * SLOT_PER_BUCKET inserts both
    // candidates are full, and the next insert must expand — which the raised minimum load
    // factor forbids.
    let map: CuckooMap<u64, u64, ZeroHashBuilder> = CuckooMap::with_hasher(16, ZeroHashBuilder);
    map.set_minimum_load_factor(0.6).unwrap();

    for i in 0..2 * SLOT_PER_BUCKET as u64 {
        assert_eq!(map.insert(i, i), Ok(true));
    }

    match map.insert(2 * SLOT_PER_BUCKET as u64, 0) {
        Err(Error::LoadFactorTooLow(lf)) => assert!(lf < 0.6),
        other => panic!("expected a load factor error, got {:?}", other),
    }
}

#[test]
fn eviction_fills_the_table() {
    // A small table with a real hasher: filling it right up to capacity exercises the BFS
    // eviction machinery; expansion is allowed.
    let map = CuckooMap::with_capacity(4);

    for i in 0..256u64 {
        assert_eq!(map.insert(i, !i), Ok(true));
    }
    for i in 0..256u64 {
        assert_eq!(map.find(&i), Some(!i));
    }

    assert_eq!(map.size(), 256);
    assert_invariants(&map);
}

#[test]
fn maximum_hashpower_defaults_to_none() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(16);
    assert_eq!(map.maximum_hashpower(), ::NO_MAXIMUM_HASHPOWER);
}

#[test]
fn maximum_hashpower_caps_expansion() {
    let map = CuckooMap::with_capacity(1);
    map.set_maximum_hashpower(1).unwrap();

    // Two buckets' worth fits at hashpower one (any key may live in either bucket there).
    for i in 0..2 * SLOT_PER_BUCKET as u64 {
        map.insert(i, i).unwrap();
    }
    assert!(map.hashpower() <= 1);

    assert_eq!(
        map.insert(2 * SLOT_PER_BUCKET as u64, 0),
        Err(Error::MaximumHashpowerExceeded(2))
    );
    assert_eq!(map.rehash(2), Err(Error::MaximumHashpowerExceeded(2)));
    assert_eq!(map.reserve(4 * 2 * SLOT_PER_BUCKET), Err(Error::MaximumHashpowerExceeded(3)));

    // Unsetting the cap lets the table grow again.
    map.set_maximum_hashpower(::NO_MAXIMUM_HASHPOWER).unwrap();
    map.rehash(10).unwrap();
    assert_eq!(map.hashpower(), 10);
}

#[test]
fn knob_validation() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(16);

    assert_eq!(map.minimum_load_factor(), DEFAULT_MINIMUM_LOAD_FACTOR);
    assert!(map.set_minimum_load_factor(-0.01).is_err());
    assert!(map.set_minimum_load_factor(1.01).is_err());
    assert!(map.set_minimum_load_factor(0.5).is_ok());

    // The hashpower cap may not undercut the current hashpower.
    assert!(map.set_maximum_hashpower(map.hashpower()).is_ok());
    if map.hashpower() > 0 {
        assert!(map.set_maximum_hashpower(map.hashpower() - 1).is_err());
    }
}

#[test]
fn rehash_preserves_contents() {
    let map = CuckooMap::with_capacity(1024);

    for i in 0..1000u64 {
        map.insert(i, i).unwrap();
    }

    let target = cmp::max(map.hashpower() + 2, 12);
    assert_eq!(map.rehash(target), Ok(true));
    assert_eq!(map.hashpower(), target);

    for i in 0..1000u64 {
        assert_eq!(map.find(&i), Some(i));
    }
    assert_eq!(map.size(), 1000);
    assert_invariants(&map);
}

#[test]
fn rehash_shrinks() {
    let map = CuckooMap::with_capacity(4096);
    let big = map.hashpower();

    for i in 0..100u64 {
        map.insert(i, i * 2).unwrap();
    }

    assert_eq!(map.rehash(5), Ok(true));
    assert!(map.hashpower() < big);

    for i in 0..100u64 {
        assert_eq!(map.find(&i), Some(i * 2));
    }
    assert_eq!(map.size(), 100);
    assert_invariants(&map);
}

#[test]
fn reserve_grows_once() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(4);
    let before = map.hashpower();

    map.reserve(10_000).unwrap();
    assert!(map.hashpower() > before);
    assert!(map.capacity() >= 10_000);

    // Already roomy enough: a second reserve is a no-op.
    assert_eq!(map.reserve(10_000), Ok(false));
}

#[test]
fn clear_empties() {
    let map = CuckooMap::with_capacity(64);
    for i in 0..50u64 {
        map.insert(i, i).unwrap();
    }

    map.clear();
    assert_eq!(map.size(), 0);
    assert!(map.is_empty());
    assert_eq!(map.find(&7), None);

    // The table is still usable afterwards.
    map.insert(7, 7).unwrap();
    assert_eq!(map.find(&7), Some(7));
}

#[test]
fn locked_table_iterates_and_mutates() {
    let map = CuckooMap::with_capacity(64);
    for i in 0..20u64 {
        map.insert(i, i).unwrap();
    }

    {
        let handle = map.lock_table();

        let mut seen: Vec<u64> = handle.iter().map(|(k, _)| k).collect();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<u64>>());

        handle.for_each_mut(|_, v| *v *= 3);

        assert_eq!(handle.insert(100, 100), Ok(true));
        assert!(handle.erase(&0));
        assert!(handle.update(&1, 42));
        assert_eq!(handle.find(&1), Some(42));

        handle.rehash(map.hashpower() + 2).unwrap();
        assert_eq!(handle.size(), 20);
    }

    // The handle is gone; the lock-free paths see its effects.
    assert_eq!(map.find(&2), Some(6));
    assert_eq!(map.find(&100), Some(100));
    assert_eq!(map.find(&0), None);
}

#[test]
fn locked_table_equality() {
    let a = CuckooMap::with_capacity(64);
    let b = CuckooMap::with_capacity(256);
    for i in 0..10u64 {
        a.insert(i, i).unwrap();
        b.insert(i, i).unwrap();
    }

    assert!(a.lock_table() == b.lock_table());

    b.insert(11, 11).unwrap();
    assert!(a.lock_table() != b.lock_table());
}

#[test]
fn clone_is_deep() {
    let map = CuckooMap::with_capacity(64);
    for i in 0..30u64 {
        map.insert(i, i).unwrap();
    }

    let copy = map.clone();
    map.erase(&0);

    assert_eq!(copy.size(), 30);
    assert_eq!(copy.find(&0), Some(0));
    assert_eq!(map.find(&0), None);
}

#[test]
fn spam_insert() {
    let map = Arc::new(CuckooMap::with_capacity(64));
    let mut joins = Vec::new();

    for t in 0..10u64 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            for i in t * 1000..(t + 1) * 1000 {
                assert_eq!(map.insert(i, !i), Ok(true));
                assert_eq!(map.insert(i, i), Ok(false));
            }
        }));
    }

    for j in joins.drain(..) {
        j.join().unwrap();
    }

    for t in 0..5u64 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            for i in t * 2000..(t + 1) * 2000 {
                assert_eq!(map.find(&i), Some(!i));
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    assert_eq!(map.size(), 10_000);
}

#[test]
fn spam_insert_erase_update() {
    let map = Arc::new(CuckooMap::with_capacity(1024));
    let mut joins = Vec::new();

    // Disjoint key ranges per thread, so every thread can assert exact outcomes.
    for t in 0..8u64 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let base = t * 1000;

            for _ in 0..20_000 {
                let key = base + rng.gen_range(0..1000);
                match rng.gen_range(0..4) {
                    0 => drop(map.insert(key, key).unwrap()),
                    1 => drop(map.erase(&key)),
                    2 => drop(map.update(&key, key + 1)),
                    _ => drop(map.upsert(key, |v| *v = key, key).unwrap()),
                }

                // Whatever happened, the key's value is one of the two we ever write.
                if let Some(v) = map.find(&key) {
                    assert!(v == key || v == key + 1);
                }
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    // At quiescence the counters must agree with an actual scan.
    let count = map.lock_table().iter().count();
    assert_eq!(count, map.size());
}

#[test]
fn concurrent_find_never_tears() {
    // Two bit patterns whose every word differs: a torn snapshot would mix them.
    const A: [u64; 2] = [0xAAAA_AAAA_AAAA_AAAA, 0xAAAA_AAAA_AAAA_AAAA];
    const B: [u64; 2] = [0x5555_5555_5555_5555, 0x5555_5555_5555_5555];

    let map = Arc::new(CuckooMap::with_capacity(64));
    map.insert(1u64, A).unwrap();

    let writer = {
        let map = map.clone();
        thread::spawn(move || {
            for i in 0..1_000_000u64 {
                map.insert_or_assign(1, if i % 2 == 0 { A } else { B }).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                for _ in 0..200_000 {
                    let v = map.find(&1).unwrap();
                    assert!(v == A || v == B, "torn read: {:x?}", v);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
}

#[test]
fn lazy_migration_after_large_double() {
    // A table at the lock-array size doubles through the lazy path: locks are flagged
    // unmigrated and buckets are re-homed lock by lock as they are touched.
    let map = CuckooMap::with_capacity(LOCK_ARRAY_SIZE * SLOT_PER_BUCKET);
    assert_eq!(map.hashpower(), LOCK_ARRAY_POW);

    let mut inserted = 0u64;
    while map.hashpower() == LOCK_ARRAY_POW {
        map.insert(inserted.wrapping_mul(0x9E37_79B9_7F4A_7C15), inserted).unwrap();
        inserted += 1;
        assert!(inserted < (LOCK_ARRAY_SIZE * SLOT_PER_BUCKET + 1) as u64);
    }

    // Everything survives the doubling, wherever each lock's migration currently stands.
    for i in 0..inserted {
        assert_eq!(map.find(&i.wrapping_mul(0x9E37_79B9_7F4A_7C15)), Some(i));
    }
    assert_eq!(map.size(), inserted as usize);
    assert_invariants(&map);
}

#[test]
fn concurrent_expansion_keeps_readers_consistent() {
    let map = Arc::new(CuckooMap::with_capacity(1));
    let mut joins = Vec::new();

    for t in 0..4u64 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            for i in t * 5000..(t + 1) * 5000 {
                map.insert(i, i).unwrap();
            }
        }));
    }

    // Readers chase the writers through the expansions.
    for _ in 0..2 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            for i in 0..5000u64 {
                if let Some(v) = map.find(&i) {
                    assert_eq!(v, i);
                }
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    assert_eq!(map.size(), 20_000);
    for i in 0..20_000u64 {
        assert_eq!(map.find(&i), Some(i));
    }
}
