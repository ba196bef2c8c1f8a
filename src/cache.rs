//! The public entry point: `DiskCache`, its configuration, and the
//! orchestration that ties the index, scanner, and eviction pool together.
//!
//! A single `Arc`-shared inner struct guarded by one mutex, with short
//! critical sections for metadata and file I/O done outside the lock
//! wherever possible.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::editor::{Editor, MAX_VALUE_COUNT};
use crate::error::{CacheError, Result};
use crate::index::{self, LookupKey, State};
use crate::paths;
use crate::pool::EvictionPool;
use crate::scanner;
use crate::snapshot::Snapshot;

/// Bytes, entry shape, and location for a cache, as an alternative to
/// `DiskCache::open`'s positional arguments.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub directory: PathBuf,
    pub value_count: usize,
    pub max_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            directory: std::env::temp_dir().join("diskcache"),
            value_count: 1,
            max_size: 64 * 1024 * 1024,
        }
    }
}

/// Everything a `DiskCache` shares across its clones: all of it lives behind
/// `Arc` so `Editor`/`Snapshot` can outlive the `DiskCache` handle that
/// created them.
pub(crate) struct Shared {
    pub(crate) dir: PathBuf,
    pub(crate) value_count: usize,
    pub(crate) state: Mutex<State>,
    pub(crate) pool: EvictionPool,
}

impl Shared {
    /// Evict least-recently-used entries until back under budget, deleting
    /// their clean files. A no-op if already under budget. Safe to call
    /// after every commit and from the eviction pool's worker thread.
    pub(crate) fn evict_sync(&self) {
        let mut st = self.state.lock();
        let removed = st.evict_locked();
        drop(st);
        if removed.is_empty() {
            return;
        }
        let freed: u64 = removed.iter().map(|e| e.total_len()).sum();
        for entry in &removed {
            index::delete_clean_files(&self.dir, entry);
        }
        info!("evicted {} entries, freed {} bytes", removed.len(), freed);
    }
}

/// A bounded, disk-backed LRU cache for fixed-shape byte-blob entries.
///
/// Cheaply `Clone`-able; every clone shares the same underlying state.
#[derive(Clone)]
pub struct DiskCache {
    shared: Arc<Shared>,
}

impl DiskCache {
    /// Open (creating if necessary) a cache rooted at `directory`, where
    /// every entry has exactly `value_count` value slots and the cache
    /// should evict down to `max_size` total bytes whenever it goes over.
    ///
    /// Scans `directory` for entries left over from a previous process,
    /// discarding anything incomplete or malformed.
    pub fn open(directory: impl Into<PathBuf>, value_count: usize, max_size: u64) -> Result<Self> {
        let directory = directory.into();
        if value_count == 0 || value_count > MAX_VALUE_COUNT {
            return Err(CacheError::InvalidArg("value_count must be between 1 and 64"));
        }
        if max_size < 1 {
            return Err(CacheError::InvalidArg("max_size must be at least 1"));
        }

        let span = tracing::span!(tracing::Level::DEBUG, "diskcache_open", dir = %directory.display());
        let _guard = span.enter();

        let discovered = scanner::scan(&directory, value_count)?;
        let mut state = State::new(max_size);
        for d in discovered {
            state.insert_placeholder(d.hash, value_count, d.lengths);
        }
        debug!(
            "opened cache at {} with {} entr(ies) recovered from disk",
            directory.display(),
            state.len()
        );

        let shared = Arc::new(Shared {
            dir: directory,
            value_count,
            state: Mutex::new(state),
            pool: EvictionPool::new(),
        });
        // A restart can leave the cache over budget if max_size shrank
        // between runs; bring it back in line synchronously before we hand
        // out the handle.
        shared.evict_sync();
        Ok(DiskCache { shared })
    }

    /// Open using a [`CacheConfig`] instead of positional arguments.
    pub fn open_with_config(config: CacheConfig) -> Result<Self> {
        Self::open(config.directory, config.value_count, config.max_size)
    }

    /// Look up `key`, returning a point-in-time [`Snapshot`] of its values,
    /// or `None` if there is no readable entry for `key`.
    ///
    /// Every slot's handle is opened while still holding the cache lock, so
    /// a commit racing this call can't rename a clean file out from under
    /// some slots but not others: either every handle here was opened
    /// against the bytes that were current at lock-acquisition time, or none
    /// were. Opening a handle is a metadata operation, not the payload read
    /// itself, so doing it under the lock doesn't make the critical section
    /// any less short in practice.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        let hash = paths::hash_key(key);
        let mut st = self.shared.state.lock();
        if st.closed {
            return Err(CacheError::InvalidState);
        }
        st.find_or_promote(key, &hash);
        let (lengths, commit_seq) = match st.get_user(key) {
            Some(entry) if entry.readable => (entry.lengths.clone(), entry.commit_seq),
            _ => return Ok(None),
        };

        let mut handles = Vec::with_capacity(lengths.len());
        for slot in 0..lengths.len() {
            let path = paths::clean_path(&self.shared.dir, &hash, slot);
            match File::open(&path) {
                Ok(f) => handles.push(f),
                Err(e) => {
                    warn!(
                        "clean file missing for key {key:?} slot {slot} ({}); treating the entry as absent: {e}",
                        path.display()
                    );
                    if let Some(entry) = st.remove_key(&LookupKey::User(key.to_string())) {
                        st.size = st.size.saturating_sub(entry.total_len());
                    }
                    return Ok(None);
                }
            }
        }

        st.touch(&LookupKey::User(key.to_string()));
        drop(st);
        Ok(Some(Snapshot::new(
            self.shared.clone(),
            key.to_string(),
            handles,
            lengths,
            commit_seq,
        )))
    }

    /// Begin exclusively editing `key`, creating it if absent. Returns
    /// `Ok(None)` if another editor already has `key` open; callers
    /// observe this as "no editor available" rather than an error, matching
    /// the external API's treatment of ALREADY_EDITING as a non-error
    /// outcome.
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        Self::begin_edit(&self.shared, key, None)
    }

    /// Like [`Snapshot::edit`]: begin editing `key` only if nobody has
    /// committed since `expected_commit_seq` was captured.
    pub(crate) fn edit_if_version(
        shared: &Arc<Shared>,
        key: &str,
        expected_commit_seq: u64,
    ) -> Result<Option<Editor>> {
        Self::begin_edit(shared, key, Some(expected_commit_seq))
    }

    fn begin_edit(shared: &Arc<Shared>, key: &str, require_seq: Option<u64>) -> Result<Option<Editor>> {
        let hash = paths::hash_key(key);
        let mut st = shared.state.lock();
        if st.closed {
            return Err(CacheError::InvalidState);
        }
        st.find_or_promote(key, &hash);

        if let Some(entry) = st.get_user(key) {
            if entry.editing {
                return Ok(None);
            }
            if let Some(seq) = require_seq {
                if entry.commit_seq != seq {
                    return Ok(None);
                }
            }
            let readable_before = entry.readable;
            st.get_user_mut(key).expect("just matched").editing = true;
            drop(st);
            return Ok(Some(Editor::new(
                shared.clone(),
                key.to_string(),
                hash,
                shared.value_count,
                readable_before,
            )));
        }

        if require_seq.is_some() {
            // A versioned edit against a key that no longer exists at all:
            // something else must have removed it since the snapshot.
            return Ok(None);
        }

        st.insert_new_editing(key.to_string(), hash.clone(), shared.value_count);
        drop(st);
        Ok(Some(Editor::new(
            shared.clone(),
            key.to_string(),
            hash,
            shared.value_count,
            false,
        )))
    }

    /// Remove `key` if present (a no-op otherwise). Fails with
    /// [`CacheError::Busy`] if `key` is currently being edited — unlike
    /// `edit`, this is surfaced as a real error since silently no-opping a
    /// requested removal would be surprising.
    pub fn remove(&self, key: &str) -> Result<()> {
        let hash = paths::hash_key(key);
        let mut st = self.shared.state.lock();
        if st.closed {
            return Err(CacheError::InvalidState);
        }
        st.find_or_promote(key, &hash);
        let editing = match st.get_user(key) {
            Some(entry) => entry.editing,
            None => return Ok(()),
        };
        if editing {
            return Err(CacheError::Busy);
        }
        let removed = st
            .remove_key(&LookupKey::User(key.to_string()))
            .expect("presence checked above");
        st.size = st.size.saturating_sub(removed.total_len());
        drop(st);
        index::delete_clean_files(&self.shared.dir, &removed);
        Ok(())
    }

    /// Total bytes recorded across every entry's value slots.
    pub fn size(&self) -> u64 {
        self.shared.state.lock().size
    }

    /// Number of entries currently in the index, readable or still being
    /// written for the first time.
    pub fn len(&self) -> usize {
        self.shared.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change the eviction ceiling. Growing never evicts; shrinking
    /// schedules one asynchronous eviction pass on the background pool
    /// so this call returns immediately even if the cache is now
    /// over budget.
    pub fn set_max_size(&self, new_max: u64) -> Result<()> {
        if new_max < 1 {
            return Err(CacheError::InvalidArg("max_size must be at least 1"));
        }
        let mut st = self.shared.state.lock();
        if st.closed {
            return Err(CacheError::InvalidState);
        }
        let shrinking = new_max < st.max_size;
        st.max_size = new_max;
        drop(st);
        if shrinking {
            let shared = self.shared.clone();
            self.shared.pool.submit(move || shared.evict_sync());
        }
        Ok(())
    }

    /// Block until every asynchronous eviction job submitted so far has
    /// finished running. Mainly useful for tests that assert on disk state
    /// after `set_max_size` shrinks the budget.
    pub fn flush(&self) {
        self.shared.pool.flush();
    }

    /// Shut the cache down: any in-flight edits are forcibly released
    /// (their dirty files are deleted, but no attempt is made to commit or
    /// otherwise finalize them) and the eviction pool's worker thread is
    /// joined before returning.
    pub fn close(self) -> Result<()> {
        let mut st = self.shared.state.lock();
        if st.closed {
            return Ok(());
        }
        st.closed = true;
        let in_flight: Vec<(LookupKey, String)> = st
            .map
            .iter()
            .filter(|(_, e)| e.editing)
            .map(|(k, e)| (k.clone(), e.hash.clone()))
            .collect();
        for (k, _) in &in_flight {
            if let Some(entry) = st.map.get_mut(k) {
                entry.editing = false;
            }
        }
        drop(st);
        for (_, hash) in &in_flight {
            index::delete_dirty_files(&self.shared.dir, hash, self.shared.value_count);
        }
        if !in_flight.is_empty() {
            warn!("closing cache with {} in-flight edit(s) still pending", in_flight.len());
        }
        self.shared.pool.flush();
        debug!("closed cache at {}", self.shared.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::open_test_cache;

    #[test]
    fn basic_write_then_read() {
        let (cache, _dir) = open_test_cache(2, 1_000_000);
        let editor = cache.edit("k").unwrap().unwrap();
        let mut editor = editor;
        editor.set(0, b"A").unwrap();
        editor.set(1, b"B").unwrap();
        editor.commit().unwrap();

        let mut snap = cache.get("k").unwrap().unwrap();
        assert_eq!(snap.read_to_vec(0).unwrap(), b"A");
        assert_eq!(snap.read_to_vec(1).unwrap(), b"B");
    }

    #[test]
    fn get_on_missing_key_is_none() {
        let (cache, _dir) = open_test_cache(1, 1_000_000);
        assert!(cache.get("nope").unwrap().is_none());
    }

    #[test]
    fn update_reuses_previous_slot() {
        let (cache, _dir) = open_test_cache(2, 1_000_000);
        let mut editor = cache.edit("k").unwrap().unwrap();
        editor.set(0, b"A").unwrap();
        editor.set(1, b"B").unwrap();
        editor.commit().unwrap();

        let mut editor = cache.edit("k").unwrap().unwrap();
        editor.set(0, b"C").unwrap();
        editor.commit().unwrap();

        let mut snap = cache.get("k").unwrap().unwrap();
        assert_eq!(snap.read_to_vec(0).unwrap(), b"C");
        assert_eq!(snap.read_to_vec(1).unwrap(), b"B");
    }

    #[test]
    fn evicts_least_recently_used_on_insert() {
        let (cache, _dir) = open_test_cache(1, 2);
        let mut e = cache.edit("a").unwrap().unwrap();
        e.set(0, b"1").unwrap();
        e.commit().unwrap();
        let mut e = cache.edit("b").unwrap().unwrap();
        e.set(0, b"2").unwrap();
        e.commit().unwrap();
        // Cache is now full (2 bytes of budget 2). Touch "a" so "b" becomes LRU.
        assert!(cache.get("a").unwrap().is_some());
        let mut e = cache.edit("c").unwrap().unwrap();
        e.set(0, b"3").unwrap();
        e.commit().unwrap();

        assert!(cache.get("a").unwrap().is_some());
        assert!(cache.get("b").unwrap().is_none());
        assert!(cache.get("c").unwrap().is_some());
    }

    #[test]
    fn snapshot_is_isolated_from_later_commit() {
        let (cache, _dir) = open_test_cache(2, 1_000_000);
        let mut e = cache.edit("k").unwrap().unwrap();
        e.set(0, b"AAaa").unwrap();
        e.set(1, b"BBbb").unwrap();
        e.commit().unwrap();

        let mut s1 = cache.get("k").unwrap().unwrap();
        assert_eq!(s1.read_to_vec(0).unwrap(), b"AAaa");

        let mut e = cache.edit("k").unwrap().unwrap();
        e.set(0, b"CCcc").unwrap();
        e.set(1, b"DDdd").unwrap();
        e.commit().unwrap();

        assert_eq!(s1.read_to_vec(1).unwrap(), b"BBbb");
    }

    #[test]
    fn editing_blocks_a_second_editor() {
        let (cache, _dir) = open_test_cache(1, 1_000_000);
        let e1 = cache.edit("k").unwrap().unwrap();
        assert!(cache.edit("k").unwrap().is_none());
        e1.abort().unwrap();
        assert!(cache.edit("k").unwrap().is_some());
    }

    #[test]
    fn remove_is_idempotent_and_rejects_busy() {
        let (cache, _dir) = open_test_cache(1, 1_000_000);
        cache.remove("missing").unwrap();

        let mut e = cache.edit("k").unwrap().unwrap();
        e.set(0, b"v").unwrap();
        e.commit().unwrap();
        cache.remove("k").unwrap();
        assert!(cache.get("k").unwrap().is_none());

        let _e = cache.edit("busy").unwrap().unwrap();
        assert!(matches!(cache.remove("busy"), Err(CacheError::Busy)));
    }

    #[test]
    fn incomplete_first_commit_is_rejected_and_leaves_no_entry() {
        let (cache, _dir) = open_test_cache(2, 1_000_000);
        let mut e = cache.edit("k").unwrap().unwrap();
        e.set(0, b"only-one-slot").unwrap();
        let err = e.commit().unwrap_err();
        assert!(matches!(err, CacheError::Incomplete { value_count: 2 }));
        assert!(cache.get("k").unwrap().is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn shrinking_max_size_evicts_asynchronously() {
        let (cache, _dir) = open_test_cache(1, 1_000_000);
        for k in ["a", "b", "c"] {
            let mut e = cache.edit(k).unwrap().unwrap();
            e.set(0, b"x").unwrap();
            e.commit().unwrap();
        }
        assert_eq!(cache.len(), 3);
        cache.set_max_size(1).unwrap();
        cache.flush();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn recovers_orphan_directory_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let hash = paths::hash_key("preexisting");
        let bucket = dir.path().join(&hash[..2]);
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::write(bucket.join(format!("{hash}.0")), b"").unwrap();
        std::fs::write(bucket.join(format!("{hash}.1")), b"").unwrap();

        let cache = DiskCache::open(dir.path(), 2, 1_000_000).unwrap();
        assert!(cache.get("preexisting").unwrap().is_some());
        assert!(cache.get("not-present").unwrap().is_none());
    }

    #[test]
    fn reopen_preserves_readable_keys() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), 1, 1_000_000).unwrap();
            let mut e = cache.edit("k").unwrap().unwrap();
            e.set(0, b"v").unwrap();
            e.commit().unwrap();
            cache.close().unwrap();
        }
        let cache = DiskCache::open(dir.path(), 1, 1_000_000).unwrap();
        let mut snap = cache.get("k").unwrap().unwrap();
        assert_eq!(snap.read_to_vec(0).unwrap(), b"v");
    }
}

#[cfg(test)]
mod proptest_invariants {
    use super::*;
    use crate::test_util::open_test_cache;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const BUDGET: u64 = 64;

    #[derive(Debug, Clone)]
    enum Op {
        Set(String, Vec<u8>),
        Remove(String),
        Get(String),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let key = prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(|s| s.to_string());
        prop_oneof![
            (key.clone(), prop::collection::vec(any::<u8>(), 0..16)).prop_map(|(k, v)| Op::Set(k, v)),
            key.clone().prop_map(Op::Remove),
            key.prop_map(Op::Get),
        ]
    }

    proptest! {
        // Entry size accounting matches reality, and the cache never stays
        // over budget once eviction has had a chance to run, checked across
        // randomized set/get/remove sequences against a one-slot cache.
        #[test]
        fn size_accounting_and_budget_hold(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let (cache, _dir) = open_test_cache(1, BUDGET);
            let mut model: HashMap<String, usize> = HashMap::new();

            for op in ops {
                match op {
                    Op::Set(k, v) => {
                        if let Some(mut editor) = cache.edit(&k).unwrap() {
                            editor.set(0, &v).unwrap();
                            if editor.commit().is_ok() {
                                model.insert(k, v.len());
                            } else {
                                model.remove(&k);
                            }
                        }
                    }
                    Op::Remove(k) => {
                        cache.remove(&k).unwrap();
                        model.remove(&k);
                    }
                    Op::Get(k) => {
                        if cache.get(&k).unwrap().is_none() {
                            model.remove(&k);
                        }
                    }
                }
                cache.flush();

                let mut expected: u64 = 0;
                for (k, len) in &model {
                    if cache.get(k).unwrap().is_some() {
                        expected += *len as u64;
                    }
                }
                prop_assert_eq!(cache.size(), expected);

                if cache.len() > 1 {
                    prop_assert!(cache.size() <= BUDGET);
                }
            }
        }

        // An edit on a key that's already being edited never succeeds.
        #[test]
        fn at_most_one_editor_per_key(key in "[a-c]") {
            let (cache, _dir) = open_test_cache(1, BUDGET);
            let first = cache.edit(&key).unwrap();
            prop_assert!(first.is_some());
            let second = cache.edit(&key).unwrap();
            prop_assert!(second.is_none());
            first.unwrap().abort().unwrap();
            let third = cache.edit(&key).unwrap();
            prop_assert!(third.is_some());
        }
    }
}
