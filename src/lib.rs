//! Fast, concurrent hash tables based on sequence locks.
//!
//! This crate implements two concurrent hash tables — a two-choice cuckoo table and a
//! Robin-Hood linear-probing table — sharing one idea: writers take fine-grained sequence
//! locks, while readers take nothing at all. A reader snapshots a version counter, copies the
//! slots it cares about through relaxed word-wise atomics, and rereads the counter; a mismatch
//! means a writer interfered and the reader simply tries again. Under read-mostly load the
//! tables therefore scale like a lock-free structure, while the write side keeps the simplicity
//! of plain mutual exclusion.
//!
//! The price of admission is that keys and values must be trivially copyable (`Copy`): a
//! snapshot read races with writers by design, which is only harmless for data that can be
//! copied bytewise and thrown away when validation fails.
//!
//! Both tables resize by doubling, through segmented storage that never moves an allocated
//! bucket, so a reader mid-snapshot survives a concurrent expansion and merely retries.

#[macro_use]
extern crate quick_error;
extern crate parking_lot;
extern crate seahash;

#[cfg(test)]
extern crate rand;

mod atomic;
mod bucket;
mod error;
mod seqlock;
mod storage;
mod util;

pub mod cuckoo;
pub mod rh;

pub use cuckoo::CuckooMap;
pub use error::Error;
pub use rh::RhMap;

use std::hash::BuildHasherDefault;

use seahash::SeaHasher;

/// The default hasher factory: SeaHash, a fast, portable, well-distributed hasher.
pub type DefaultHashBuilder = BuildHasherDefault<SeaHasher>;

/// The maximum-hashpower value meaning "no maximum at all".
pub const NO_MAXIMUM_HASHPOWER: usize = ::std::usize::MAX;
