//! Deterministic mapping from a user key to the clean/dirty paths for each
//! value slot. Pure function of `(cacheDir, key, valueIndex)`. Entries are
//! dispersed into two-hex-char bucket directories so no single directory
//! holds every entry.

use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use ring::digest;

/// Number of leading hex characters of a key's hash used as the bucket
/// subdirectory name. `16**2 == 256` buckets.
const PREFIX_LEN: usize = 2;

/// `lowercase_hex(sha256(utf8(key)))`, 64 hex characters.
pub fn hash_key(key: &str) -> String {
    let digest = digest::digest(&digest::SHA256, key.as_bytes());
    HEXLOWER.encode(digest.as_ref())
}

/// The two-hex-char bucket directory a hash lives under.
pub fn bucket_dir(cache_dir: &Path, hash: &str) -> PathBuf {
    cache_dir.join(&hash[..PREFIX_LEN])
}

/// `cacheDir / h[0..2] / (h + "." + i)`
pub fn clean_path(cache_dir: &Path, hash: &str, slot: usize) -> PathBuf {
    bucket_dir(cache_dir, hash).join(format!("{hash}.{slot}"))
}

/// `cacheDir / h[0..2] / (h + "." + i + ".tmp")`
pub fn dirty_path(cache_dir: &Path, hash: &str, slot: usize) -> PathBuf {
    bucket_dir(cache_dir, hash).join(format!("{hash}.{slot}.tmp"))
}

/// Parses a filename of the form `<64-hex>.<digit>` or `<64-hex>.<digit>.tmp`.
/// Returns `(hash, slot, is_tmp)`, or `None` if the name doesn't match the
/// schema exactly.
pub fn parse_entry_filename(name: &str) -> Option<(&str, usize, bool)> {
    let (rest, is_tmp) = match name.strip_suffix(".tmp") {
        Some(rest) => (rest, true),
        None => (name, false),
    };
    let mut parts = rest.rsplitn(2, '.');
    let slot_str = parts.next()?;
    let hash = parts.next()?;
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return None;
    }
    let slot: usize = slot_str.parse().ok()?;
    Some((hash, slot, is_tmp))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_64_lowercase_hex() {
        let h = hash_key("hello");
        assert_eq!(h.len(), 64);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn clean_and_dirty_paths_share_bucket() {
        let base = Path::new("/tmp/cache");
        let h = hash_key("k");
        let clean = clean_path(base, &h, 0);
        let dirty = dirty_path(base, &h, 0);
        assert_eq!(clean.parent(), dirty.parent());
        assert_eq!(clean.parent().unwrap(), bucket_dir(base, &h));
        assert_eq!(clean.file_name().unwrap(), format!("{h}.0").as_str());
        assert_eq!(dirty.file_name().unwrap(), format!("{h}.0.tmp").as_str());
    }

    #[test]
    fn parse_roundtrip() {
        let h = hash_key("roundtrip");
        let clean_name = format!("{h}.3");
        assert_eq!(
            parse_entry_filename(&clean_name),
            Some((h.as_str(), 3, false))
        );
        let dirty_name = format!("{h}.3.tmp");
        assert_eq!(
            parse_entry_filename(&dirty_name),
            Some((h.as_str(), 3, true))
        );
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_entry_filename("README.md"), None);
        assert_eq!(parse_entry_filename("not-a-hash.0"), None);
        assert_eq!(parse_entry_filename(&format!("{}.x", "a".repeat(64))), None);
        // Uppercase hex is not accepted; the schema is lowercase only.
        assert_eq!(
            parse_entry_filename(&format!("{}.0", "A".repeat(64))),
            None
        );
    }
}
