//! Word-wise atomic buffer copies.
//!
//! The seqlock protocol stores keys and values in plain (non-atomic) cells, which readers copy
//! out while a writer might be overwriting them. To keep such races benign, every access to the
//! shared cells goes through the two primitives in this module: they copy a trivially copyable
//! value as a sequence of relaxed atomic word accesses, so a racing reader observes each _word_
//! atomically (the value as a whole may still be torn, which the epoch validation sorts out).
//!
//! Neither primitive orders anything on its own. The fences of the surrounding seqlock protocol
//! are what turn these relaxed snapshots into consistent ones.

use std::mem::{self, MaybeUninit};
use std::sync::atomic::Ordering;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8};

/// Copy a chunk of `$word`s from `$src` to `$dst` through relaxed atomic loads.
macro_rules! load_words {
    ($word:ty, $atomic:ty, $dst:expr, $src:expr, $words:expr) => {
        for i in 0..$words {
            let src = &*($src as *const $atomic).add(i);
            ($dst as *mut $word).add(i).write(src.load(Ordering::Relaxed));
        }
    };
}

/// Copy a chunk of `$word`s from `$src` to `$dst` through relaxed atomic stores.
macro_rules! store_words {
    ($word:ty, $atomic:ty, $dst:expr, $src:expr, $words:expr) => {
        for i in 0..$words {
            let dst = &*($dst as *const $atomic).add(i);
            dst.store(($src as *const $word).add(i).read(), Ordering::Relaxed);
        }
    };
}

/// The widest word (in bytes) that `T`'s alignment allows us to copy it by.
fn word_size<T>() -> usize {
    // An 8-byte word is the widest we use; anything less aligned is copied by its own alignment.
    mem::align_of::<T>().min(8)
}

/// Load a value from `src`, word by word.
///
/// The value is assembled from `size_of::<T>() / word` relaxed atomic word loads (the word picked
/// by `T`'s alignment) plus relaxed byte loads for any remainder. The loads are independent: a
/// concurrent `atomic_store_copy` to the same location can interleave between them, so the caller
/// must validate the snapshot (e.g. by epoch comparison) before trusting it.
///
/// # Safety
///
/// `src` must be valid for reads of `size_of::<T>()` bytes and aligned for `T`, and all racing
/// writes to the location must go through `atomic_store_copy`. The returned value is only known
/// to be _some_ interleaving of stored values; it must be discarded unless validated.
pub unsafe fn atomic_load_copy<T: Copy>(src: *const T) -> T {
    let mut val = MaybeUninit::<T>::uninit();
    let bytes = mem::size_of::<T>();
    let word = word_size::<T>();
    let words = bytes / word;

    let dst_raw = val.as_mut_ptr() as *mut u8;
    let src_raw = src as *const u8;

    match word {
        8 => load_words!(u64, AtomicU64, dst_raw, src_raw, words),
        4 => load_words!(u32, AtomicU32, dst_raw, src_raw, words),
        2 => load_words!(u16, AtomicU16, dst_raw, src_raw, words),
        _ => load_words!(u8, AtomicU8, dst_raw, src_raw, words),
    }

    // The tail that doesn't fill a whole word is copied byte by byte.
    for i in words * word..bytes {
        let src = &*(src_raw.add(i) as *const AtomicU8);
        dst_raw.add(i).write(src.load(Ordering::Relaxed));
    }

    val.assume_init()
}

/// Store `val` to `dst`, word by word.
///
/// The mirror image of `atomic_load_copy`: the value is emitted as relaxed atomic word stores
/// plus relaxed byte stores for the remainder.
///
/// # Safety
///
/// `dst` must be valid for writes of `size_of::<T>()` bytes and aligned for `T`. The caller must
/// hold whatever lock excludes other writers of the location; concurrent readers are fine as long
/// as they use `atomic_load_copy` and validate.
pub unsafe fn atomic_store_copy<T: Copy>(dst: *mut T, val: T) {
    let bytes = mem::size_of::<T>();
    let word = word_size::<T>();
    let words = bytes / word;

    let dst_raw = dst as *const u8;
    let src_raw = &val as *const T as *const u8;

    match word {
        8 => store_words!(u64, AtomicU64, dst_raw, src_raw, words),
        4 => store_words!(u32, AtomicU32, dst_raw, src_raw, words),
        2 => store_words!(u16, AtomicU16, dst_raw, src_raw, words),
        _ => store_words!(u8, AtomicU8, dst_raw, src_raw, words),
    }

    for i in words * word..bytes {
        let dst = &*(dst_raw.add(i) as *const AtomicU8);
        dst.store(src_raw.add(i).read(), Ordering::Relaxed);
    }
}
