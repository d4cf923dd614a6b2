//! Checksum manifests: per-file SHA-256 digests for backup verification.
//!
//! A manifest records the expected content digest, size, and mtime of every
//! file in a backup. Verification recomputes digests and reports every
//! discrepancy; a missing file, a size mismatch, and a digest mismatch are
//! all reported, never silently ignored.
//!
//! Persisted form (the `.backup_checksums` sidecar):
//!
//! ```json
//! { "entries": [ {"path": "...", "sha256": "...", "size": 0, "mtime": 0} ] }
//! ```

use crate::error::{Result, SafetyError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read buffer for digest computation. Copies and hashes are chunked so
/// cancellation checks between whole-file operations stay bounded.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Expected state of one file in a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the manifest root, `/`-separated
    pub path: String,
    /// Lowercase hex SHA-256 of the file content
    pub sha256: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,
}

/// Ordered collection of manifest entries, keyed by unique relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: BTreeMap<String, ManifestEntry>,
}

/// Why a manifest entry failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    /// File is absent from the verified tree
    Missing,
    /// File exists but its size differs from the manifest
    SizeMismatch,
    /// File exists, size matches, content digest differs
    DigestMismatch,
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::SizeMismatch => write!(f, "size mismatch"),
            Self::DigestMismatch => write!(f, "digest mismatch"),
        }
    }
}

/// One verification discrepancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub path: String,
    pub kind: MismatchKind,
}

/// Outcome of verifying a manifest against a directory tree.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    /// True when every entry verified clean
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Paths of all mismatched entries, in manifest order
    pub fn mismatched_paths(&self) -> Vec<String> {
        self.mismatches.iter().map(|m| m.path.clone()).collect()
    }

    /// Operator-facing one-line-per-mismatch description
    pub fn describe(&self) -> String {
        if self.is_ok() {
            return "all entries verified".to_string();
        }
        self.mismatches
            .iter()
            .map(|m| format!("{}: {}", m.path, m.kind))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Compute the SHA-256 digest of a file, reading in chunks.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn file_mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ChecksumManifest {
    /// Compute a manifest for `relative_paths` under `root`.
    ///
    /// Deterministic: identical file content always yields the identical
    /// digest, and entries are stored ordered by path regardless of the
    /// ordering of `relative_paths`. Unreadable files abort the computation.
    pub fn compute<S: AsRef<str>>(root: &Path, relative_paths: &[S]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for rel in relative_paths {
            let rel = rel.as_ref();
            let full = root.join(rel);
            let meta = fs::metadata(&full).map_err(|e| {
                SafetyError::backup(format!("unreadable source {}: {}", full.display(), e))
            })?;
            if !meta.is_file() {
                return Err(SafetyError::backup(format!(
                    "not a regular file: {}",
                    full.display()
                )));
            }
            let sha256 = digest_file(&full)?;
            entries.insert(
                rel.to_string(),
                ManifestEntry {
                    path: rel.to_string(),
                    sha256,
                    size: meta.len(),
                    mtime: file_mtime_secs(&meta),
                },
            );
        }
        Ok(Self { entries })
    }

    /// Recompute digests under `root` and compare against this manifest.
    pub fn verify(&self, root: &Path) -> VerifyReport {
        let mut report = VerifyReport::default();
        for (path, entry) in &self.entries {
            let full = root.join(path);
            let meta = match fs::metadata(&full) {
                Ok(m) if m.is_file() => m,
                _ => {
                    report.mismatches.push(Mismatch {
                        path: path.clone(),
                        kind: MismatchKind::Missing,
                    });
                    continue;
                }
            };
            if meta.len() != entry.size {
                report.mismatches.push(Mismatch {
                    path: path.clone(),
                    kind: MismatchKind::SizeMismatch,
                });
                continue;
            }
            match digest_file(&full) {
                Ok(digest) if digest == entry.sha256 => {}
                _ => {
                    report.mismatches.push(Mismatch {
                        path: path.clone(),
                        kind: MismatchKind::DigestMismatch,
                    });
                }
            }
        }
        report
    }

    /// Look up the entry for a relative path
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    /// Insert or replace an entry (used when layering incremental chains)
    pub fn insert(&mut self, entry: ManifestEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Iterate entries in path order
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    /// All relative paths, in order
    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the manifest has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the sidecar JSON document
    pub fn to_json(&self) -> Result<String> {
        let doc = ManifestDocument {
            entries: self.entries.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Parse the sidecar JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: ManifestDocument = serde_json::from_str(json)?;
        let mut entries = BTreeMap::new();
        for entry in doc.entries {
            entries.insert(entry.path.clone(), entry);
        }
        Ok(Self { entries })
    }

    /// Write the sidecar file
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read a sidecar file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

/// Wire form of the `.backup_checksums` sidecar.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    entries: Vec<ManifestEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_file(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_compute_and_verify_clean() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.txt", b"alpha");
        write_file(dir.path(), "sub/b.txt", b"beta");

        let manifest =
            ChecksumManifest::compute(dir.path(), &["a.txt", "sub/b.txt"]).unwrap();
        assert_eq!(manifest.len(), 2);

        let report = manifest.verify(dir.path());
        assert!(report.is_ok(), "{}", report.describe());
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.txt", b"alpha");
        write_file(dir.path(), "b.txt", b"beta");

        let forward = ChecksumManifest::compute(dir.path(), &["a.txt", "b.txt"]).unwrap();
        let reverse = ChecksumManifest::compute(dir.path(), &["b.txt", "a.txt"]).unwrap();
        assert_eq!(forward, reverse);
        assert_eq!(forward.paths(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_verify_reports_digest_mismatch() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.txt", b"alpha");

        let manifest = ChecksumManifest::compute(dir.path(), &["a.txt"]).unwrap();
        write_file(dir.path(), "a.txt", b"aleph"); // same length, new content

        let report = manifest.verify(dir.path());
        assert!(!report.is_ok());
        assert_eq!(report.mismatches[0].kind, MismatchKind::DigestMismatch);
        assert_eq!(report.mismatched_paths(), vec!["a.txt"]);
    }

    #[test]
    fn test_verify_reports_missing_and_size() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.txt", b"alpha");
        write_file(dir.path(), "b.txt", b"beta");

        let manifest = ChecksumManifest::compute(dir.path(), &["a.txt", "b.txt"]).unwrap();
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        write_file(dir.path(), "b.txt", b"beta-grown");

        let report = manifest.verify(dir.path());
        assert_eq!(report.mismatches.len(), 2);
        assert_eq!(report.mismatches[0].kind, MismatchKind::Missing);
        assert_eq!(report.mismatches[1].kind, MismatchKind::SizeMismatch);
    }

    #[test]
    fn test_compute_fails_on_unreadable_source() {
        let dir = TempDir::new().unwrap();
        let err = ChecksumManifest::compute(dir.path(), &["nope.txt"]).unwrap_err();
        assert!(matches!(err, SafetyError::BackupCreation(_)));
    }

    #[test]
    fn test_json_roundtrip_shape() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.txt", b"alpha");

        let manifest = ChecksumManifest::compute(dir.path(), &["a.txt"]).unwrap();
        let json = manifest.to_json().unwrap();
        assert!(json.contains("\"entries\""));
        assert!(json.contains("\"sha256\""));

        let back = ChecksumManifest::from_json(&json).unwrap();
        assert_eq!(back, manifest);
    }
}
