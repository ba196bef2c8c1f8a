//! The exclusive in-flight writer for one entry.
//!
//! An `Editor` owns its own dirty-file handles and does all of its byte
//! writes outside the cache-wide mutex; only `commit`/`abort` take the lock,
//! and only briefly, to finalize metadata.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::sync::Arc;

use tracing::warn;

use crate::cache::Shared;
use crate::error::{CacheError, Result};
use crate::index::{self, LookupKey};
use crate::paths;

/// The maximum number of value slots a cache can be opened with. The
/// "written this edit" state is a fixed-size bitmap rather than a
/// `Vec<bool>`, and `u64` gives us 64 slots, comfortably more than any
/// realistic entry shape.
pub const MAX_VALUE_COUNT: usize = 64;

#[derive(Default, Debug, Clone, Copy)]
pub(crate) struct WrittenBitmap(u64);

impl WrittenBitmap {
    fn mark(&mut self, slot: usize) {
        self.0 |= 1 << slot;
    }

    fn is_set(&self, slot: usize) -> bool {
        (self.0 >> slot) & 1 == 1
    }

    fn all_set(&self, value_count: usize) -> bool {
        if value_count == 64 {
            self.0 == u64::MAX
        } else {
            self.0 == (1u64 << value_count) - 1
        }
    }
}

pub struct Editor {
    shared: Arc<Shared>,
    key: String,
    hash: String,
    value_count: usize,
    /// Whether the entry was already `readable` when this edit began; an
    /// edit is a "first-creation" edit iff this is false.
    readable_before_edit: bool,
    written: WrittenBitmap,
    dirty_files: Vec<Option<File>>,
    has_errors: bool,
    finished: bool,
}

/// A writable handle for one slot, returned by [`Editor::new_output_stream`].
/// Marks its slot as written on the first successful `write` call, not on
/// open.
pub struct OutputHandle<'a> {
    file: &'a mut File,
    slot: usize,
    written: &'a mut WrittenBitmap,
}

impl<'a> Write for OutputHandle<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        if n > 0 {
            self.written.mark(self.slot);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Editor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: String,
        hash: String,
        value_count: usize,
        readable_before_edit: bool,
    ) -> Self {
        Editor {
            shared,
            key,
            hash,
            value_count,
            readable_before_edit,
            written: WrittenBitmap::default(),
            dirty_files: vec![None; value_count],
            has_errors: false,
            finished: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(CacheError::InvalidState);
        }
        Ok(())
    }

    fn ensure_dirty_open(&mut self, slot: usize) -> Result<()> {
        if self.dirty_files[slot].is_some() {
            return Ok(());
        }
        let path = paths::dirty_path(&self.shared.dir, &self.hash, slot);
        let opened = (|| -> io::Result<File> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
        })();
        match opened {
            Ok(file) => {
                self.dirty_files[slot] = Some(file);
                Ok(())
            }
            Err(e) => {
                self.has_errors = true;
                Err(CacheError::io(path, e))
            }
        }
    }

    /// Write `bytes` to slot `slot` in full, truncating any prior dirty
    /// content. Marks the slot written immediately.
    pub fn set(&mut self, slot: usize, bytes: &[u8]) -> Result<()> {
        self.check_open()?;
        self.ensure_dirty_open(slot)?;
        let file = self.dirty_files[slot].as_mut().expect("just opened");
        match file.write_all(bytes) {
            Ok(()) => {
                self.written.mark(slot);
                Ok(())
            }
            Err(e) => {
                self.has_errors = true;
                Err(CacheError::io(
                    paths::dirty_path(&self.shared.dir, &self.hash, slot),
                    e,
                ))
            }
        }
    }

    /// A streaming writer for slot `slot`. Repeated calls for the same slot
    /// return a handle onto the same underlying file (the dirty file is
    /// opened once per edit, not once per call).
    pub fn new_output_stream(&mut self, slot: usize) -> Result<OutputHandle<'_>> {
        self.check_open()?;
        self.ensure_dirty_open(slot)?;
        let file = self.dirty_files[slot].as_mut().expect("just opened");
        Ok(OutputHandle {
            file,
            slot,
            written: &mut self.written,
        })
    }

    /// The previously committed bytes for `slot`, or `None` if the entry
    /// has never been readable. Never sees dirty data written by this edit.
    pub fn get_string(&self, slot: usize) -> Result<Option<String>> {
        match self.new_input_stream(slot)? {
            Some(mut f) => {
                let mut s = String::new();
                f.read_to_string(&mut s)
                    .map_err(|e| CacheError::io(paths::clean_path(&self.shared.dir, &self.hash, slot), e))?;
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    /// The previously committed file for `slot`, opened read-only, or
    /// `None` if the entry has never been readable.
    pub fn new_input_stream(&self, slot: usize) -> Result<Option<File>> {
        if !self.readable_before_edit {
            return Ok(None);
        }
        let path = paths::clean_path(&self.shared.dir, &self.hash, slot);
        match File::open(&path) {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Finalize the edit: rename every written slot's dirty file into
    /// place, update size accounting, and run synchronous eviction if the
    /// commit pushed the cache over budget.
    pub fn commit(mut self) -> Result<()> {
        self.check_open()?;
        self.finished = true;
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.has_errors {
            index::delete_dirty_files(&self.shared.dir, &self.hash, self.value_count);
            self.finalize(&vec![None; self.value_count], false);
            return Err(CacheError::CommitFailed {
                hash: self.hash.clone(),
                source: io::Error::new(io::ErrorKind::Other, "a write failed earlier in this edit"),
            });
        }

        let first = !self.readable_before_edit;
        if first && !self.written.all_set(self.value_count) {
            index::delete_dirty_files(&self.shared.dir, &self.hash, self.value_count);
            self.finalize(&vec![None; self.value_count], false);
            return Err(CacheError::Incomplete {
                value_count: self.value_count,
            });
        }

        // Close our own handles before renaming; keeping them open across a
        // rename is fine on POSIX but there's no reason to hold them.
        for f in self.dirty_files.iter_mut() {
            *f = None;
        }

        let mut new_lengths: Vec<Option<u64>> = vec![None; self.value_count];
        for slot in 0..self.value_count {
            if !self.written.is_set(slot) {
                continue;
            }
            let dirty = paths::dirty_path(&self.shared.dir, &self.hash, slot);
            let clean = paths::clean_path(&self.shared.dir, &self.hash, slot);
            if let Some(parent) = clean.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    index::delete_dirty_files(&self.shared.dir, &self.hash, self.value_count);
                    self.finalize(&new_lengths, false);
                    return Err(CacheError::CommitFailed {
                        hash: self.hash.clone(),
                        source: e,
                    });
                }
            }
            if let Err(e) = fs::rename(&dirty, &clean) {
                index::delete_dirty_files(&self.shared.dir, &self.hash, self.value_count);
                self.finalize(&new_lengths, false);
                return Err(CacheError::CommitFailed {
                    hash: self.hash.clone(),
                    source: e,
                });
            }
            new_lengths[slot] = Some(fs::metadata(&clean).map(|m| m.len()).unwrap_or(0));
        }

        // Slots that were opened (e.g. via `new_output_stream`) but never
        // written leave a dirty file behind; written slots' dirty files are
        // already gone via the rename above, so this only ever cleans up
        // the unwritten ones.
        index::delete_dirty_files(&self.shared.dir, &self.hash, self.value_count);

        self.finalize(&new_lengths, true);
        self.shared.evict_sync();
        Ok(())
    }

    /// Apply whatever length/size deltas resulted from this edit, flip
    /// `readable`/`editing`, and (on failure of a first-creation edit) drop
    /// the entry from the index entirely, all under one lock acquisition.
    fn finalize(&self, new_lengths: &[Option<u64>], success: bool) {
        let mut st = self.shared.state.lock();
        if let Some(entry) = st.get_user_mut(&self.key) {
            let mut delta: i64 = 0;
            for (slot, len) in new_lengths.iter().enumerate() {
                if let Some(len) = len {
                    delta += *len as i64 - entry.lengths[slot] as i64;
                    entry.lengths[slot] = *len;
                }
            }
            entry.editing = false;
            if success {
                entry.readable = true;
                entry.commit_seq = entry.commit_seq.wrapping_add(1);
            }
            if delta >= 0 {
                st.size += delta as u64;
            } else {
                st.size = st.size.saturating_sub((-delta) as u64);
            }
        }
        if success {
            st.touch(&LookupKey::User(self.key.clone()));
        } else if !self.readable_before_edit {
            st.remove_key(&LookupKey::User(self.key.clone()));
        }
    }

    /// Discard this edit: delete any dirty files it created, release the
    /// pin on its entry, and (if this was a first-creation edit) remove the
    /// never-readable entry from the index.
    pub fn abort(mut self) -> Result<()> {
        self.check_open()?;
        self.finished = true;
        self.abort_inner();
        Ok(())
    }

    fn abort_inner(&mut self) {
        for f in self.dirty_files.iter_mut() {
            *f = None;
        }
        index::delete_dirty_files(&self.shared.dir, &self.hash, self.value_count);
        let mut st = self.shared.state.lock();
        if let Some(entry) = st.get_user_mut(&self.key) {
            entry.editing = false;
        }
        if !self.readable_before_edit {
            st.remove_key(&LookupKey::User(self.key.clone()));
        }
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "Editor for key {:?} dropped without commit() or abort(); its entry stays pinned until the cache is closed",
                self.key
            );
        }
    }
}
