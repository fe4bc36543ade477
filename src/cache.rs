//! Content hashing.
//!
//! SHA-256 digests identify packaged objects in the manifest and decide
//! whether a previously extracted APEX payload or system image can be
//! reused.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Hex SHA-256 of a byte buffer.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hex SHA-256 of one file, streamed so that multi-gigabyte system image
/// packages are never held in memory.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to hash {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute SHA256 hash of multiple files concatenated.
/// Returns None if any file doesn't exist.
/// Logs a warning if a file exists but can't be read.
pub fn hash_files(paths: &[&Path]) -> Option<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        if !path.exists() {
            return None;
        }
        match fs::read(path) {
            Ok(content) => hasher.update(&content),
            Err(e) => {
                eprintln!(
                    "  [WARN] Failed to read {} for hashing: {} (cache will be invalidated)",
                    path.display(),
                    e
                );
                return None;
            }
        }
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// Read cached hash from a .hash file.
/// Returns None if file doesn't exist.
pub fn read_cached_hash(hash_file: &Path) -> Option<String> {
    if !hash_file.exists() {
        return None;
    }
    match fs::read_to_string(hash_file) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            eprintln!(
                "  [WARN] Failed to read cache hash file {}: {} (will re-extract)",
                hash_file.display(),
                e
            );
            None
        }
    }
}

/// Write hash to a .hash file.
pub fn write_cached_hash(hash_file: &Path, hash: &str) -> Result<()> {
    if let Some(parent) = hash_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(hash_file, hash)?;
    Ok(())
}

/// Check if `target` must be regenerated from a source with `source_hash`.
///
/// Unlike a build cache, a missing hash file never trusts an existing
/// target: extraction output of unknown provenance is redone.
pub fn needs_rebuild(source_hash: &str, hash_file: &Path, target: &Path) -> bool {
    if !target.exists() {
        return true;
    }
    match read_cached_hash(hash_file) {
        Some(cached) => cached != source_hash,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_bytes_known_value() {
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_files_matches_concatenation() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::write(&a, b"lib").unwrap();
        fs::write(&b, b"c.so").unwrap();

        assert_eq!(hash_files(&[&a, &b]), Some(hash_bytes(b"libc.so")));
        assert_eq!(hash_files(&[&a, &temp.path().join("missing")]), None);
        assert_eq!(hash_file(&b).unwrap(), hash_bytes(b"c.so"));
        assert!(hash_file(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_needs_rebuild() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("com.android.runtime");
        let hash_file = temp.path().join("com.android.runtime.hash");

        assert!(needs_rebuild("abc", &hash_file, &target));

        fs::create_dir_all(&target).unwrap();
        assert!(needs_rebuild("abc", &hash_file, &target));

        write_cached_hash(&hash_file, "abc").unwrap();
        assert!(!needs_rebuild("abc", &hash_file, &target));
        assert!(needs_rebuild("def", &hash_file, &target));
    }
}
