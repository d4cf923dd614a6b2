//! Checksum-verified backup store.
//!
//! Each backup lives in its own directory under the store root:
//!
//! ```text
//! <store>/<id>/data/<relative paths>   byte-for-byte copies
//! <store>/<id>/.backup_checksums       manifest JSON sidecar
//! <store>/<id>/.backup_metadata        metadata JSON sidecar
//! ```
//!
//! Creation stages into `<id>.partial` and renames into place only once the
//! staged copy verifies against its manifest, so a failed or interrupted
//! creation never leaves a half-written backup behind. Restores likewise go
//! through a staging directory and are moved into the destination only after
//! every file has been digest-verified.
//!
//! Backups that fail verification are marked corrupted in their metadata
//! sidecar but are never deleted: they are retained for forensic inspection.

use crate::checksum::ChecksumManifest;
use crate::error::{Result, SafetyError};
use crate::stop::StopToken;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const DATA_DIR: &str = "data";
const CHECKSUMS_SIDECAR: &str = ".backup_checksums";
const METADATA_SIDECAR: &str = ".backup_metadata";
const PARTIAL_SUFFIX: &str = ".partial";

/// Full or incremental backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
}

/// Contents of the `.backup_metadata` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Unique backup id
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Full or incremental
    pub kind: BackupKind,
    /// Base backup id; present iff incremental
    pub base_ref: Option<String>,
    /// Source root the relative manifest paths are resolved against
    pub root_path: PathBuf,
    /// Set (and persisted) when verification has failed. Never cleared
    /// automatically, and the backup is never auto-deleted.
    pub corrupted: bool,
}

/// A loaded backup: metadata plus manifest.
#[derive(Debug, Clone)]
pub struct Backup {
    pub metadata: BackupMetadata,
    pub manifest: ChecksumManifest,
}

impl Backup {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// Relative paths written by a successful restore.
#[derive(Debug, Clone, Default)]
pub struct RestoredSet {
    pub paths: Vec<String>,
}

/// Directory-backed store of verified backups.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    /// Open (creating if necessary) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            SafetyError::backup(format!(
                "backup destination {} not writable: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    fn backup_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn data_dir(&self, id: &str) -> PathBuf {
        self.backup_dir(id).join(DATA_DIR)
    }

    /// Create a full backup of `paths` (relative) under `source_root`.
    ///
    /// The copy is interruptible at whole-file boundaries via `token`;
    /// interruption or failure removes the partial staging directory.
    pub fn create_full_backup<S: AsRef<str>>(
        &self,
        source_root: &Path,
        paths: &[S],
        token: &StopToken,
    ) -> Result<Backup> {
        let manifest = ChecksumManifest::compute(source_root, paths)?;
        self.write_backup(source_root, manifest, BackupKind::Full, None, token)
    }

    /// Create an incremental backup on top of `base_id`, storing only files
    /// whose digest differs from the base chain's effective manifest.
    pub fn create_incremental_backup<S: AsRef<str>>(
        &self,
        base_id: &str,
        source_root: &Path,
        paths: &[S],
        token: &StopToken,
    ) -> Result<Backup> {
        let effective = self.effective_manifest(base_id)?;

        let mut changed: Vec<String> = Vec::new();
        for rel in paths {
            let rel = rel.as_ref();
            token.ensure_clear()?;
            let full = source_root.join(rel);
            let digest = crate::checksum::digest_file(&full).map_err(|e| {
                SafetyError::backup(format!("unreadable source {}: {}", full.display(), e))
            })?;
            match effective.get(rel) {
                Some(entry) if entry.sha256 == digest => {}
                _ => changed.push(rel.to_string()),
            }
        }

        debug!(
            "Incremental backup on {}: {} of {} file(s) changed",
            base_id,
            changed.len(),
            paths.len()
        );

        let manifest = ChecksumManifest::compute(source_root, &changed)?;
        self.write_backup(
            source_root,
            manifest,
            BackupKind::Incremental,
            Some(base_id.to_string()),
            token,
        )
    }

    fn write_backup(
        &self,
        source_root: &Path,
        manifest: ChecksumManifest,
        kind: BackupKind,
        base_ref: Option<String>,
        token: &StopToken,
    ) -> Result<Backup> {
        let id = Uuid::new_v4().to_string();
        let staging = self.root.join(format!("{}{}", id, PARTIAL_SUFFIX));

        let result =
            self.populate_staging(&staging, source_root, &manifest, token);
        if let Err(e) = result {
            // Clean up on failure: no partial backup directory is left behind
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let metadata = BackupMetadata {
            id: id.clone(),
            created_at: Utc::now(),
            kind,
            base_ref,
            root_path: source_root.to_path_buf(),
            corrupted: false,
        };
        if let Err(e) = self.finalize_staging(&staging, &id, &metadata, &manifest) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        info!(
            "Created {:?} backup {} ({} file(s))",
            kind,
            id,
            manifest.len()
        );
        Ok(Backup { metadata, manifest })
    }

    fn populate_staging(
        &self,
        staging: &Path,
        source_root: &Path,
        manifest: &ChecksumManifest,
        token: &StopToken,
    ) -> Result<()> {
        let data = staging.join(DATA_DIR);
        fs::create_dir_all(&data).map_err(|e| {
            SafetyError::backup(format!(
                "backup destination {} not writable: {}",
                staging.display(),
                e
            ))
        })?;

        for entry in manifest.entries() {
            // Stop checks sit between whole-file copies, bounding
            // cancellation latency without risking torn files
            token.ensure_clear()?;

            let src = source_root.join(&entry.path);
            let dst = data.join(&entry.path);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dst).map_err(|e| {
                SafetyError::backup(format!("copy {} failed: {}", src.display(), e))
            })?;
        }

        // The stored copy, not the (possibly already changing) source, is
        // what must verify before the backup is trusted
        let report = manifest.verify(&data);
        if !report.is_ok() {
            return Err(SafetyError::backup(format!(
                "staged copy failed verification:\n{}",
                report.describe()
            )));
        }
        Ok(())
    }

    fn finalize_staging(
        &self,
        staging: &Path,
        id: &str,
        metadata: &BackupMetadata,
        manifest: &ChecksumManifest,
    ) -> Result<()> {
        manifest.save(&staging.join(CHECKSUMS_SIDECAR))?;
        fs::write(
            staging.join(METADATA_SIDECAR),
            serde_json::to_string_pretty(metadata)?,
        )?;
        fs::rename(staging, self.backup_dir(id))?;
        Ok(())
    }

    /// Load a backup's metadata and manifest.
    pub fn load(&self, id: &str) -> Result<Backup> {
        let dir = self.backup_dir(id);
        if !dir.is_dir() {
            return Err(SafetyError::UnknownBackup(id.to_string()));
        }
        let metadata: BackupMetadata =
            serde_json::from_str(&fs::read_to_string(dir.join(METADATA_SIDECAR))?)?;
        let manifest = ChecksumManifest::load(&dir.join(CHECKSUMS_SIDECAR))?;
        Ok(Backup { metadata, manifest })
    }

    /// Metadata of every backup in the store, newest first.
    pub fn list(&self) -> Result<Vec<BackupMetadata>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !entry.path().is_dir() || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            match self.load(&name) {
                Ok(backup) => out.push(backup.metadata),
                Err(e) => warn!("Skipping unreadable backup {}: {}", name, e),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Verify a backup against its manifest.
    ///
    /// Returns `false` (and persists `corrupted: true` in the metadata
    /// sidecar) on any mismatch. The backup itself is retained.
    pub fn verify(&self, id: &str) -> Result<bool> {
        let backup = self.load(id)?;
        let report = backup.manifest.verify(&self.data_dir(id));
        if report.is_ok() {
            return Ok(true);
        }

        warn!(
            "Backup {} failed verification (retained for forensics):\n{}",
            id,
            report.describe()
        );
        let mut metadata = backup.metadata;
        metadata.corrupted = true;
        fs::write(
            self.backup_dir(id).join(METADATA_SIDECAR),
            serde_json::to_string_pretty(&metadata)?,
        )?;
        Ok(false)
    }

    /// The chain from the full base to `id`, oldest first.
    fn chain(&self, id: &str) -> Result<Vec<Backup>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            let backup = self.load(&current)?;
            cursor = backup.metadata.base_ref.clone();
            chain.push(backup);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Effective manifest of a chain: base layers overlaid by each
    /// incremental in order.
    fn effective_manifest(&self, id: &str) -> Result<ChecksumManifest> {
        let mut effective = ChecksumManifest::default();
        for backup in self.chain(id)? {
            for entry in backup.manifest.entries() {
                effective.insert(entry.clone());
            }
        }
        Ok(effective)
    }

    fn verify_chain(&self, chain: &[Backup]) -> Result<()> {
        for backup in chain {
            if !self.verify(backup.id())? {
                let report = backup.manifest.verify(&self.data_dir(backup.id()));
                return Err(SafetyError::IntegrityViolation {
                    backup_id: backup.id().to_string(),
                    mismatched: report.mismatched_paths(),
                });
            }
        }
        Ok(())
    }

    /// Restore a backup into `destination`.
    ///
    /// Full backups restore every manifest entry; incremental backups first
    /// restore the full chain of bases, then overlay the diffs. The whole
    /// restore fails atomically: files are staged and digest-verified, and
    /// only then moved into the destination.
    pub fn restore(&self, id: &str, destination: &Path, token: &StopToken) -> Result<RestoredSet> {
        let chain = self.chain(id)?;
        self.verify_chain(&chain)?;

        // rel path -> id of the chain layer owning the newest version
        let mut owners: Vec<(String, String, String)> = Vec::new(); // (path, backup_id, sha256)
        {
            let mut latest = std::collections::BTreeMap::new();
            for backup in &chain {
                for entry in backup.manifest.entries() {
                    latest.insert(
                        entry.path.clone(),
                        (backup.id().to_string(), entry.sha256.clone()),
                    );
                }
            }
            for (path, (backup_id, sha256)) in latest {
                owners.push((path, backup_id, sha256));
            }
        }

        let staging = destination.with_file_name(format!(
            ".restore-{}-{}",
            id,
            std::process::id()
        ));
        let result = self.stage_restore(&staging, &owners, token);
        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        // Every file staged and verified; move into place. The staging
        // directory is removed whether or not the moves succeed.
        let moved = Self::move_into_destination(&staging, &owners, destination);
        let _ = fs::remove_dir_all(&staging);
        let restored = moved?;

        info!(
            "Restored backup {} into {} ({} file(s))",
            id,
            destination.display(),
            restored.paths.len()
        );
        Ok(restored)
    }

    fn move_into_destination(
        staging: &Path,
        owners: &[(String, String, String)],
        destination: &Path,
    ) -> Result<RestoredSet> {
        let mut restored = RestoredSet::default();
        for (path, _, _) in owners {
            let dst = destination.join(path);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(staging.join(path), &dst).map_err(|e| SafetyError::Restore {
                path: dst.clone(),
                reason: e.to_string(),
            })?;
            restored.paths.push(path.clone());
        }
        Ok(restored)
    }

    fn stage_restore(
        &self,
        staging: &Path,
        owners: &[(String, String, String)],
        token: &StopToken,
    ) -> Result<()> {
        fs::create_dir_all(staging)?;
        for (path, backup_id, expected_sha) in owners {
            token.ensure_clear()?;

            let src = self.data_dir(backup_id).join(path);
            if !src.is_file() {
                return Err(SafetyError::Restore {
                    path: src,
                    reason: "manifest entry not found in backup data".to_string(),
                });
            }
            let dst = staging.join(path);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dst)?;

            let digest = crate::checksum::digest_file(&dst)?;
            if &digest != expected_sha {
                return Err(SafetyError::Restore {
                    path: dst,
                    reason: "staged file digest does not match manifest".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Restore a single manifest entry to an absolute destination path.
    ///
    /// Used by the rollback engine for per-operation FileModify/FileDelete
    /// inverses. Walks the chain from `id` downward to find the entry.
    pub fn restore_file(&self, id: &str, rel_path: &str, dest: &Path) -> Result<()> {
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            let backup = self.load(&current)?;
            if let Some(entry) = backup.manifest.get(rel_path) {
                let src = self.data_dir(&current).join(rel_path);
                let digest = crate::checksum::digest_file(&src).map_err(|_| {
                    SafetyError::IntegrityViolation {
                        backup_id: current.clone(),
                        mismatched: vec![rel_path.to_string()],
                    }
                })?;
                if digest != entry.sha256 {
                    return Err(SafetyError::IntegrityViolation {
                        backup_id: current,
                        mismatched: vec![rel_path.to_string()],
                    });
                }

                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Stage next to the destination so the final move is atomic
                let tmp = dest.with_file_name(format!(
                    ".restore-tmp-{}",
                    std::process::id()
                ));
                fs::copy(&src, &tmp)?;
                fs::rename(&tmp, dest).map_err(|e| SafetyError::Restore {
                    path: dest.to_path_buf(),
                    reason: e.to_string(),
                })?;
                return Ok(());
            }
            cursor = backup.metadata.base_ref.clone();
        }
        Err(SafetyError::Restore {
            path: dest.to_path_buf(),
            reason: format!("{} not present in backup chain of {}", rel_path, id),
        })
    }
}
