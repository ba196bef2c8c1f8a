//! Shared boilerplate for tests: a cache rooted in a throwaway directory
//! that cleans itself up when the returned `TempDir` drops.

use tempfile::TempDir;

use crate::cache::DiskCache;

pub fn open_test_cache(value_count: usize, max_size: u64) -> (DiskCache, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir for test cache");
    let cache = DiskCache::open(dir.path(), value_count, max_size).expect("failed to open test cache");
    (cache, dir)
}
