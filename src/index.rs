//! The authoritative in-memory state: a mapping from lookup identity to
//! entry metadata, ordered by recency.
//!
//! An `IndexMap` preserves insertion order, so "move to most-recently-used"
//! is "remove and reinsert at the back" and eviction picks from the front.
//! We additionally need to *rename* a key in place (hash placeholder -> user
//! key) without disturbing recency order, which `shift_insert` gives us
//! directly.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::paths;

/// The identity under which an entry is reachable in the index: either the
/// caller's own key, or (until the first touch after a restart) the on-disk
/// hash discovered by the scanner.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum LookupKey {
    User(String),
    Hash(String),
}

/// One cache entry. The `hash` is stable for the lifetime of the entry even
/// across promotion from a scanner placeholder to a user key, since it's
/// what actually names the files on disk.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) hash: String,
    pub(crate) lengths: Vec<u64>,
    pub(crate) readable: bool,
    pub(crate) editing: bool,
    pub(crate) commit_seq: u64,
}

impl Entry {
    fn placeholder(hash: String, value_count: usize, lengths: Vec<u64>) -> Self {
        Entry {
            hash,
            lengths,
            readable: true,
            editing: false,
            commit_seq: 0,
        }
        .with_value_count(value_count)
    }

    fn with_value_count(mut self, value_count: usize) -> Self {
        debug_assert_eq!(self.lengths.len(), value_count);
        self
    }

    fn new_editing(hash: String, value_count: usize) -> Self {
        Entry {
            hash,
            lengths: vec![0; value_count],
            readable: false,
            editing: true,
            commit_seq: 0,
        }
    }

    pub(crate) fn total_len(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

/// The mutex-guarded authoritative state. Everything in here is touched
/// only from inside `DiskCache`'s critical sections.
pub(crate) struct State {
    pub(crate) map: IndexMap<LookupKey, Entry>,
    pub(crate) size: u64,
    pub(crate) max_size: u64,
    pub(crate) closed: bool,
}

impl State {
    pub(crate) fn new(max_size: u64) -> Self {
        State {
            map: IndexMap::new(),
            size: 0,
            max_size,
            closed: false,
        }
    }

    /// Insert a scanner-discovered entry, keyed by its hash, at the tail
    /// (discovery order doubles as initial recency order).
    pub(crate) fn insert_placeholder(&mut self, hash: String, value_count: usize, lengths: Vec<u64>) {
        let size: u64 = lengths.iter().sum();
        self.map.insert(
            LookupKey::Hash(hash.clone()),
            Entry::placeholder(hash, value_count, lengths),
        );
        self.size += size;
    }

    /// Find an entry by user key, promoting a hash placeholder to the user
    /// key in place (same position) if that's where it's found. Returns
    /// whether an entry is now reachable under `key`.
    pub(crate) fn find_or_promote(&mut self, key: &str, hash: &str) -> bool {
        if self.map.contains_key(&LookupKey::User(key.to_string())) {
            return true;
        }
        let hash_key = LookupKey::Hash(hash.to_string());
        if let Some(i) = self.map.get_index_of(&hash_key) {
            let (_, entry) = self.map.shift_remove_index(i).expect("index just looked up");
            self.map.shift_insert(i, LookupKey::User(key.to_string()), entry);
            true
        } else {
            false
        }
    }

    pub(crate) fn get_user(&self, key: &str) -> Option<&Entry> {
        self.map.get(&LookupKey::User(key.to_string()))
    }

    pub(crate) fn get_user_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.map.get_mut(&LookupKey::User(key.to_string()))
    }

    /// Move the entry at `key` to the tail (most-recently-used position).
    /// No-op if absent.
    pub(crate) fn touch(&mut self, key: &LookupKey) {
        if let Some(i) = self.map.get_index_of(key) {
            let (k, v) = self.map.shift_remove_index(i).expect("index just looked up");
            self.map.insert(k, v);
        }
    }

    /// Insert a brand-new, not-yet-readable entry at the tail and return its
    /// index.
    pub(crate) fn insert_new_editing(&mut self, key: String, hash: String, value_count: usize) -> usize {
        self.map
            .insert(LookupKey::User(key.clone()), Entry::new_editing(hash, value_count));
        self.map.get_index_of(&LookupKey::User(key)).expect("just inserted")
    }

    pub(crate) fn remove_key(&mut self, key: &LookupKey) -> Option<Entry> {
        self.map.shift_remove(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// While `size > max_size`, evict the least-recently-used entry that
    /// isn't pinned by an in-flight editor. Stops once no
    /// non-pinned candidate remains, even if still over budget. Returns the
    /// removed entries so the caller can delete their clean files after
    /// releasing the lock.
    pub(crate) fn evict_locked(&mut self) -> Vec<Entry> {
        let mut removed = Vec::new();
        'outer: while self.size > self.max_size {
            let mut i = 0;
            loop {
                match self.map.get_index(i) {
                    None => break 'outer,
                    Some((_, entry)) => {
                        if entry.editing {
                            i += 1;
                            continue;
                        }
                    }
                }
                break;
            }
            let (_, entry) = self.map.shift_remove_index(i).expect("checked above");
            self.size = self.size.saturating_sub(entry.total_len());
            removed.push(entry);
        }
        removed
    }
}

/// Delete every clean file for `entry` (tolerating files already gone).
/// Callers are responsible for adjusting `size` themselves.
pub(crate) fn delete_clean_files(dir: &Path, entry: &Entry) -> Vec<PathBuf> {
    let mut deleted = Vec::new();
    for i in 0..entry.lengths.len() {
        let path = paths::clean_path(dir, &entry.hash, i);
        if std::fs::remove_file(&path).is_ok() {
            deleted.push(path);
        }
    }
    deleted
}

/// Delete every dirty file that might exist for `hash` across all slots
/// (tolerating files already gone).
pub(crate) fn delete_dirty_files(dir: &Path, hash: &str, value_count: usize) {
    for i in 0..value_count {
        let _ = std::fs::remove_file(paths::dirty_path(dir, hash, i));
    }
}
