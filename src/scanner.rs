//! Directory scanner: reconstructs the in-memory index from whatever is
//! actually on disk. Runs once, from `DiskCache::open`.
//!
//! Individual malformed entries are never fatal to `open`: a
//! mis-named file, an orphaned `.tmp`, or an incomplete entry missing a
//! slot is logged and discarded, never propagated as an error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{trace, warn};

use crate::error::{CacheError, Result};
use crate::paths;

/// A discovered, valid (all slots present) entry: its hash and the
/// filesystem lengths of its `value_count` clean files, in slot order.
pub(crate) struct Discovered {
    pub(crate) hash: String,
    pub(crate) lengths: Vec<u64>,
}

/// Walk `dir` and return every entry that is fully present (every slot
/// `0..value_count` has a clean file). Deletes orphaned `.tmp` files and
/// partially-complete clean-file sets as a side effect, matching the
/// recovery semantics described above.
pub(crate) fn scan(dir: &Path, value_count: usize) -> Result<Vec<Discovered>> {
    fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

    let mut discovered = Vec::new();

    let top_entries = match fs::read_dir(dir) {
        Ok(it) => it,
        Err(e) => return Err(CacheError::io(dir, e)),
    };

    for top in top_entries {
        let top = match top {
            Ok(t) => t,
            Err(e) => {
                warn!("skipping unreadable directory entry under {}: {e}", dir.display());
                continue;
            }
        };
        let bucket_path = top.path();
        let is_dir = top.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            trace!("ignoring foreign file {}", bucket_path.display());
            continue;
        }
        let prefix = match bucket_path.file_name().and_then(|n| n.to_str()) {
            Some(s) => s,
            None => continue,
        };
        if prefix.len() != 2 || !prefix.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            trace!("ignoring non-bucket directory {}", bucket_path.display());
            continue;
        }

        // hash -> slot -> path, and hash -> tmp paths, for this bucket only.
        let mut clean_by_hash: HashMap<String, HashMap<usize, std::path::PathBuf>> = HashMap::new();
        let mut tmp_by_hash: HashMap<String, Vec<std::path::PathBuf>> = HashMap::new();

        let bucket_entries = match fs::read_dir(&bucket_path) {
            Ok(it) => it,
            Err(e) => {
                warn!("skipping unreadable bucket {}: {e}", bucket_path.display());
                continue;
            }
        };
        for file in bucket_entries {
            let file = match file {
                Ok(f) => f,
                Err(e) => {
                    warn!("skipping unreadable entry in {}: {e}", bucket_path.display());
                    continue;
                }
            };
            let path = file.path();
            if !file.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(s) => s,
                None => continue,
            };
            let (hash, slot, is_tmp) = match paths::parse_entry_filename(name) {
                Some(parsed) => parsed,
                None => {
                    trace!("ignoring foreign file {}", path.display());
                    continue;
                }
            };
            if &hash[..2] != prefix {
                trace!(
                    "ignoring {} whose hash doesn't match its bucket directory",
                    path.display()
                );
                continue;
            }
            if is_tmp {
                tmp_by_hash.entry(hash.to_string()).or_default().push(path);
            } else {
                clean_by_hash.entry(hash.to_string()).or_default().insert(slot, path);
            }
        }

        for (hash, tmp_paths) in &tmp_by_hash {
            for p in tmp_paths {
                if fs::remove_file(p).is_err() {
                    warn!("failed to delete orphaned temp file {}", p.display());
                }
            }
            trace!("deleted {} orphaned temp file(s) for {hash}", tmp_paths.len());
        }

        for (hash, slots) in clean_by_hash {
            let complete = (0..value_count).all(|i| slots.contains_key(&i));
            if !complete {
                warn!("discarding incomplete entry {hash}: missing one or more of {value_count} slot(s)");
                for path in slots.values() {
                    let _ = fs::remove_file(path);
                }
                continue;
            }
            match stat_slots(&slots, value_count) {
                Ok(lengths) => discovered.push(Discovered { hash, lengths }),
                Err(e) => {
                    warn!("discarding entry {hash}: {e:#}");
                    for path in slots.values() {
                        let _ = fs::remove_file(path);
                    }
                }
            }
        }
    }

    Ok(discovered)
}

/// Stat every slot's clean file, in order. Not part of the public contract,
/// so it's free to use `anyhow` for quick propagation rather than
/// `CacheError`; the caller only cares whether the whole entry is usable.
fn stat_slots(slots: &HashMap<usize, PathBuf>, value_count: usize) -> anyhow::Result<Vec<u64>> {
    let mut lengths = Vec::with_capacity(value_count);
    for i in 0..value_count {
        let path = &slots[&i];
        let meta = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
        lengths.push(meta.len());
    }
    Ok(lengths)
}
