//! A point-in-time view of one entry's `V` values, isolated from any edit
//! that commits after the snapshot was taken.
//!
//! Isolation here is structural, not copy-on-write: the file handles are
//! opened once, while the cache lock is held, and then read from after the
//! lock is released. A later commit replaces the clean files via rename,
//! which on POSIX filesystems never mutates the bytes an already-open
//! handle is reading — it just stops being reachable by name.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::cache::{DiskCache, Shared};
use crate::editor::Editor;
use crate::error::{CacheError, Result};

pub struct Snapshot {
    shared: Arc<Shared>,
    key: String,
    handles: Vec<File>,
    lengths: Vec<u64>,
    commit_seq: u64,
}

impl Snapshot {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: String,
        handles: Vec<File>,
        lengths: Vec<u64>,
        commit_seq: u64,
    ) -> Self {
        Snapshot {
            shared,
            key,
            handles,
            lengths,
            commit_seq,
        }
    }

    pub fn value_count(&self) -> usize {
        self.lengths.len()
    }

    /// The size in bytes of slot `slot`, as observed at snapshot time.
    pub fn len(&self, slot: usize) -> u64 {
        self.lengths[slot]
    }

    pub fn is_empty(&self, slot: usize) -> bool {
        self.lengths[slot] == 0
    }

    /// A handle onto slot `slot`'s bytes, rewound to the start. The same
    /// underlying `File` is reused across calls, so any prior read position
    /// is reset rather than accumulated.
    pub fn reader(&mut self, slot: usize) -> Result<&mut File> {
        let file = &mut self.handles[slot];
        file.seek(SeekFrom::Start(0))
            .map_err(|e| CacheError::io(format!("<snapshot slot {slot}>"), e))?;
        Ok(file)
    }

    /// Read the entirety of slot `slot` into a freshly allocated buffer.
    pub fn read_to_vec(&mut self, slot: usize) -> Result<Vec<u8>> {
        let len = self.lengths[slot];
        let mut buf = Vec::with_capacity(len as usize);
        let file = self.reader(slot)?;
        file.read_to_end(&mut buf)
            .map_err(|e| CacheError::io(format!("<snapshot slot {slot}>"), e))?;
        Ok(buf)
    }

    /// Read the entirety of slot `slot` as UTF-8.
    pub fn read_to_string(&mut self, slot: usize) -> Result<String> {
        let mut s = String::new();
        let file = self.reader(slot)?;
        file.read_to_string(&mut s)
            .map_err(|e| CacheError::io(format!("<snapshot slot {slot}>"), e))?;
        Ok(s)
    }

    /// Commit sequence number this snapshot was captured at; two snapshots
    /// of the same key taken before/after an intervening commit will differ.
    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    /// Open an editor for this snapshot's key, but only if nobody has
    /// committed a change to it since this snapshot was taken. This
    /// is the "open an editor *for this version*" convenience the edit API
    /// doesn't otherwise expose.
    pub fn edit(&self) -> Result<Option<Editor>> {
        DiskCache::edit_if_version(&self.shared, &self.key, self.commit_seq)
    }

    /// Release the open file handles early instead of waiting on `Drop`.
    pub fn close(self) {}
}
