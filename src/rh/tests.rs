use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use super::*;
use util::hashed;

/// A hasher multiplying the key by a power of two, so that every key collides onto one original
/// slot at small table sizes and the colliding cluster splits apart on each doubling.
#[derive(Clone)]
struct CollideBuilder {
    shift: u32,
}

struct CollideHasher {
    val: u64,
    shift: u32,
}

impl Hasher for CollideHasher {
    fn finish(&self) -> u64 {
        self.val << self.shift
    }

    fn write(&mut self, bytes: &[u8]) {
        // Fold whatever the key writes into a single integer.
        for &b in bytes {
            self.val = (self.val << 8) | b as u64;
        }
    }

    fn write_u64(&mut self, n: u64) {
        // Integer keys arrive here; take them verbatim so tests can aim at exact slots.
        self.val = n;
    }
}

impl BuildHasher for CollideBuilder {
    type Hasher = CollideHasher;

    fn build_hasher(&self) -> CollideHasher {
        CollideHasher { val: 0, shift: self.shift }
    }
}

/// Walk every slot and check the Robin-Hood invariants: stored displacement matches the
/// distance from the key's original slot, stays within the window, and no slot is richer than
/// the one before it allows.
fn assert_invariants<S: BuildHasher>(map: &RhMap<u64, u64, S>) {
    let hp = map.index_power();
    let window = window_size(hp);
    let mut entries = 0;

    for b in 0..map.bucket_count() {
        let bucket = map.buckets.get(b);
        for slot in 0..SLOT_PER_BUCKET {
            if !bucket.occupied(slot) {
                continue;
            }
            entries += 1;

            let dist = bucket.dist(slot) as usize;
            let index = (b << SLOT_PER_BUCKET_POW) + slot;
            let original = original_index(hp, hashed(map.hasher(), &bucket.key(slot)).hash);

            assert_eq!(original + dist, index);
            assert!(dist <= window);
        }
    }

    assert_eq!(entries, map.size());
}

#[test]
fn insert_find_erase() {
    let map = RhMap::with_capacity(64);

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
    let map = RhMap::with_capacity(64);

    assert_eq!(map.insert(1u64, 10u64), Ok(true));
    assert_eq!(map.insert(1, 99), Ok(false));
    assert_eq!(map.find(&1), Some(10));
    assert_eq!(map.size(), 1);
}

#[test]
fn insert_or_assign_semantics() {
    let map = RhMap::with_capacity(64);

    assert_eq!(map.insert(7u64, 70u64), Ok(true));
    assert_eq!(map.insert_or_assign(7, 71), Ok(false));
    assert_eq!(map.find(&7), Some(71));
    assert_eq!(map.size(), 1);
}

#[test]
fn update_family() {
    let map = RhMap::with_capacity(64);
    map.insert(1u64, 1u64).unwrap();

    assert!(map.update(&1, 2));
    assert_eq!(map.find(&1), Some(2));
    assert!(!map.update(&42, 0));

    assert!(map.update_fn(&1, |v| *v *= 10));
    assert_eq!(map.find(&1), Some(20));
    assert!(!map.update_fn(&42, |v| *v += 1));

    unsafe {
        assert!(map.update_fn_in_place(&1, |v| *v += 1));
    }
    assert_eq!(map.find(&1), Some(21));
}

#[test]
fn upsert_inserts_then_updates() {
    let map = RhMap::with_capacity(64);

    assert_eq!(map.upsert(9u64, |v| *v += 1, 90u64), Ok(true));
    assert_eq!(map.find(&9), Some(90));

    assert_eq!(map.upsert(9, |v| *v += 1, 0), Ok(false));
    assert_eq!(map.find(&9), Some(91));
}

#[test]
fn collision_cluster_displacement() {
    // Everything collides at one original slot: keys pile up in one cluster, displacements
    // growing one by one.
    let map: RhMap<u64, u64, CollideBuilder> = RhMap::with_hasher(100, CollideBuilder { shift: 40 });
    let window = window_size(map.index_power()) as u64;

    // Fill most of the window; every insert lands in the same cluster.
    for i in 0..window - 1 {
        assert_eq!(map.insert(i, i * 7), Ok(true));
    }
    for i in 0..window - 1 {
        assert_eq!(map.find(&i), Some(i * 7));
    }

    assert_eq!(map.size(), (window - 1) as usize);
    assert_invariants(&map);
}

#[test]
fn robbery_displaces_the_rich() {
    // Original slots are `key * 8` here. A resident sits right where a long cluster from slot
    // zero will eventually land; the cluster's far-travelled tail key out-ranks it and takes
    // its slot, pushing it one along.
    let map: RhMap<u64, u64, CollideBuilder> = RhMap::with_hasher(100, CollideBuilder { shift: 3 });

    map.insert(1, 100).unwrap(); // original slot 8, displacement 0
    for k in 1..=9u64 {
        map.insert(32 * k, k).unwrap(); // original slot 0
    }

    assert_eq!(map.find(&1), Some(100));
    for k in 1..=9u64 {
        assert_eq!(map.find(&(32 * k)), Some(k));
    }
    assert_eq!(map.size(), 10);
    assert_invariants(&map);
}

#[test]
fn window_overflow_expands_and_redistributes() {
    // The collision cluster overruns the window, forcing expansions; the multiplied hashes
    // split into separate clusters as the mask widens, so the table settles instead of
    // doubling forever.
    let map: RhMap<u64, u64, CollideBuilder> = RhMap::with_hasher(100, CollideBuilder { shift: 8 });
    let before = map.hashpower();

    for i in 0..65u64 {
        assert_eq!(map.insert(i, i), Ok(true));
    }

    assert!(map.hashpower() > before);
    for i in 0..65u64 {
        assert_eq!(map.find(&i), Some(i));
    }
    assert_eq!(map.size(), 65);
    assert_invariants(&map);
}

#[test]
fn erase_shifts_the_cluster_back() {
    let map: RhMap<u64, u64, CollideBuilder> = RhMap::with_hasher(100, CollideBuilder { shift: 40 });

    for i in 0..10u64 {
        map.insert(i, i).unwrap();
    }

    // Deleting from the middle pulls every later resident one slot closer to home.
    assert!(map.erase(&3));
    assert!(map.erase(&0));

    for i in 0..10u64 {
        if i == 0 || i == 3 {
            assert_eq!(map.find(&i), None);
        } else {
            assert_eq!(map.find(&i), Some(i));
        }
    }
    assert_eq!(map.size(), 8);
    assert_invariants(&map);
}

#[test]
fn erase_everything_in_random_order() {
    let map = RhMap::with_capacity(256);
    let mut keys: Vec<u64> = (0..200).collect();

    for &k in &keys {
        map.insert(k, !k).unwrap();
    }

    let mut rng = rand::thread_rng();
    while !keys.is_empty() {
        let i = rng.gen_range(0..keys.len());
        let k = keys.swap_remove(i);
        assert!(map.erase(&k));
        assert_eq!(map.find(&k), None);
    }

    assert_eq!(map.size(), 0);
    assert_invariants(&map);
}

#[test]
fn rehash_preserves_contents() {
    let map = RhMap::with_capacity(1024);

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
fn rehash_never_shrinks() {
    let map: RhMap<u64, u64> = RhMap::with_capacity(4096);
    let hp = map.hashpower();

    assert_eq!(map.rehash(hp), Ok(false));
    assert_eq!(map.rehash(hp - 1), Ok(false));
    assert_eq!(map.hashpower(), hp);
}

#[test]
fn reserve_grows() {
    let map: RhMap<u64, u64> = RhMap::with_capacity(16);
    let before = map.hashpower();

    map.reserve(100_000).unwrap();
    assert!(map.hashpower() > before);
    assert!(map.capacity() >= 100_000);
}

#[test]
fn maximum_hashpower_caps_expansion() {
    let map: RhMap<u64, u64> = RhMap::with_capacity(16);
    let hp = map.hashpower();
    map.set_maximum_hashpower(hp).unwrap();

    assert_eq!(map.rehash(hp + 1), Err(Error::MaximumHashpowerExceeded(hp + 1)));

    map.set_maximum_hashpower(::NO_MAXIMUM_HASHPOWER).unwrap();
    map.rehash(hp + 1).unwrap();
    assert_eq!(map.hashpower(), hp + 1);
}

#[test]
fn knob_validation() {
    let map: RhMap<u64, u64> = RhMap::with_capacity(16);

    assert_eq!(map.maximum_hashpower(), ::NO_MAXIMUM_HASHPOWER);
    assert!(map.set_maximum_hashpower(map.hashpower() - 1).is_err());
}

#[test]
fn clear_empties() {
    let map = RhMap::with_capacity(64);
    for i in 0..50u64 {
        map.insert(i, i).unwrap();
    }

    map.clear();
    assert_eq!(map.size(), 0);
    assert!(map.is_empty());

    map.insert(7, 7).unwrap();
    assert_eq!(map.find(&7), Some(7));
}

#[test]
fn clone_is_deep() {
    let map = RhMap::with_capacity(64);
    for i in 0..30u64 {
        map.insert(i, i).unwrap();
    }

    let copy = map.clone();
    map.erase(&0);

    assert_eq!(copy.size(), 30);
    assert_eq!(copy.find(&0), Some(0));
    assert_eq!(map.find(&0), None);
    assert_invariants(&copy);
}

#[test]
fn spam_insert() {
    let map = Arc::new(RhMap::with_capacity(64));
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
    let map = Arc::new(RhMap::with_capacity(4096));
    let mut joins = Vec::new();

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

                if let Some(v) = map.find(&key) {
                    assert!(v == key || v == key + 1);
                }
            }
        }));
    }

    for j in joins {
        j.join().unwrap();
    }

    assert_invariants(&map);
}

#[test]
fn concurrent_find_never_tears() {
    const A: [u64; 2] = [0xAAAA_AAAA_AAAA_AAAA, 0xAAAA_AAAA_AAAA_AAAA];
    const B: [u64; 2] = [0x5555_5555_5555_5555, 0x5555_5555_5555_5555];

    let map = Arc::new(RhMap::with_capacity(64));
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
fn concurrent_expansion_keeps_readers_consistent() {
    let map = Arc::new(RhMap::with_capacity(16));
    let mut joins = Vec::new();

    for t in 0..4u64 {
        let map = map.clone();
        joins.push(thread::spawn(move || {
            for i in t * 5000..(t + 1) * 5000 {
                map.insert(i, i).unwrap();
            }
        }));
    }

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
    assert_invariants(&map);
}
