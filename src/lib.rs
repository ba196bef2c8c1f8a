#![forbid(unsafe_code)]

//! A bounded, disk-backed LRU cache for byte-blob entries.
//!
//! Each entry has a fixed number of value "slots", addressed by index, and
//! is looked up by an opaque string key. Entries are written exclusively
//! through an [`Editor`] and read through a [`Snapshot`] that stays
//! consistent even if the entry is overwritten or evicted after the
//! snapshot was taken. The cache tracks recency in memory and persists
//! committed values under a hash-derived path so a later process can
//! recover them (see [`DiskCache::open`]).

mod cache;
mod editor;
mod error;
mod index;
mod paths;
mod pool;
mod scanner;
mod snapshot;

#[cfg(test)]
mod test_util;

pub use cache::{CacheConfig, DiskCache};
pub use editor::{Editor, OutputHandle, MAX_VALUE_COUNT};
pub use error::{CacheError, Result};
pub use snapshot::Snapshot;
