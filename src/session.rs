//! The exclusive safety session: the single entry point collaborators use.
//!
//! One session may be active machine-wide at a time, enforced by a lock file
//! carrying the owner pid and a periodically refreshed heartbeat. The
//! session owns the undo stack and the monotonic operation sequence and
//! wires the journal, backup store, rollback engine, and emergency-stop
//! coordinator together. No process-wide mutable state beyond the stop
//! signal, which is an explicit, named resource.

use crate::backup::BackupStore;
use crate::config::SafetyConfig;
use crate::error::{Result, SafetyError};
use crate::journal::{EventSeverity, OperationJournal};
use crate::managers::{
    PackageManager, RecordingPackageManager, RecordingServiceManager, ServiceManager,
    SystemPackageManager, SystemServiceManager,
};
use crate::rollback::{RollbackEngine, RollbackResult};
use crate::stop::{
    is_process_alive, EmergencyStopCoordinator, StopToken, WorkerRegistry,
};
use crate::types::{InverseAction, Operation, OperationKind, RollbackPoint};
use crate::undo_stack::UndoStack;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Contents of the session lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionLockRecord {
    session_id: String,
    owner_pid: u32,
    started_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
}

/// Exclusive session lock: pid + heartbeat, refreshed periodically.
#[derive(Debug)]
struct SessionLock {
    path: PathBuf,
    record: SessionLockRecord,
    released: bool,
}

impl SessionLock {
    /// Acquire the lock or fail fast with [`SafetyError::SessionBusy`].
    ///
    /// The prepared record is published with `link(2)`, which fails when
    /// the lock already exists, so concurrent acquisitions are arbitrated
    /// by the filesystem and exactly one caller wins. A lock whose owner
    /// pid is dead, or whose heartbeat is older than `heartbeat_timeout`,
    /// is stale; it is removed and the exclusive publish retried once.
    fn acquire(path: PathBuf, session_id: &str, heartbeat_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let record = SessionLockRecord {
            session_id: session_id.to_string(),
            owner_pid: std::process::id(),
            started_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, serde_json::to_string_pretty(&record)?)?;

        let linked = Self::link_exclusive(&tmp, &path, heartbeat_timeout);
        let _ = fs::remove_file(&tmp);
        linked?;

        Ok(Self {
            path,
            record,
            released: false,
        })
    }

    /// Publish the prepared lock atomically. The lock file is complete the
    /// instant it becomes visible, so a concurrent acquirer can never
    /// observe a half-written record.
    fn link_exclusive(tmp: &Path, path: &Path, heartbeat_timeout: Duration) -> Result<()> {
        for _ in 0..2 {
            match fs::hard_link(tmp, path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match Self::read_record(path) {
                        Some(existing) => {
                            let age = Utc::now()
                                .signed_duration_since(existing.heartbeat_at)
                                .to_std()
                                .unwrap_or(Duration::ZERO);
                            let alive = is_process_alive(existing.owner_pid);
                            if alive && age < heartbeat_timeout {
                                return Err(SafetyError::SessionBusy {
                                    owner_pid: existing.owner_pid,
                                    session_id: existing.session_id,
                                });
                            }
                            warn!(
                                "Removing stale session lock (owner pid {} {}, heartbeat {}s old)",
                                existing.owner_pid,
                                if alive { "alive" } else { "dead" },
                                age.as_secs()
                            );
                        }
                        None => warn!("Removing unreadable session lock {}", path.display()),
                    }
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Lost the publish race to another acquirer that replaced the same
        // stale lock; report whoever holds it now
        match Self::read_record(path) {
            Some(existing) => Err(SafetyError::SessionBusy {
                owner_pid: existing.owner_pid,
                session_id: existing.session_id,
            }),
            None => Err(SafetyError::SessionBusy {
                owner_pid: 0,
                session_id: "unknown".to_string(),
            }),
        }
    }

    fn read_record(path: &Path) -> Option<SessionLockRecord> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.record)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        self.record.heartbeat_at = Utc::now();
        self.persist()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Point-in-time view of a session for `query-status` consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
    pub undo_depth: usize,
    pub operations_recorded: u64,
    pub rollback_points: Vec<String>,
    pub stop_raised: bool,
    pub stop_reason: Option<String>,
}

/// The facade external collaborators call into.
pub struct SafetySession {
    config: SafetyConfig,
    journal: OperationJournal,
    store: BackupStore,
    coordinator: EmergencyStopCoordinator,
    token: StopToken,
    stack: UndoStack,
    lock: SessionLock,
    session_id: String,
    started_at: DateTime<Utc>,
    next_op_id: u64,
    packages: Box<dyn PackageManager>,
    services: Box<dyn ServiceManager>,
}

impl std::fmt::Debug for SafetySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetySession")
            .field("session_id", &self.session_id)
            .field("started_at", &self.started_at)
            .field("next_op_id", &self.next_op_id)
            .finish_non_exhaustive()
    }
}

impl SafetySession {
    /// Begin the exclusive session with the default system package/service
    /// managers. In dry-run mode the recording fakes are injected instead,
    /// so package/service inverses are logged but never executed.
    pub fn begin(config: SafetyConfig, session_id: &str) -> Result<Self> {
        if config.dry_run {
            return Self::begin_with_managers(
                config,
                session_id,
                Box::new(RecordingPackageManager::default()),
                Box::new(RecordingServiceManager::default()),
            );
        }
        Self::begin_with_managers(
            config,
            session_id,
            Box::new(SystemPackageManager::default()),
            Box::new(SystemServiceManager::default()),
        )
    }

    /// Begin with injected capability implementations (tests, dry-run).
    pub fn begin_with_managers(
        config: SafetyConfig,
        session_id: &str,
        packages: Box<dyn PackageManager>,
        services: Box<dyn ServiceManager>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SafetyError::config(e.to_string()))?;
        config
            .ensure_directories()
            .map_err(|e| SafetyError::config(e.to_string()))?;

        // Exclusivity first: a busy lock must not touch any other state
        let lock = SessionLock::acquire(
            config.session_lock_path(),
            session_id,
            config.heartbeat_timeout(),
        )?;

        let journal = OperationJournal::open(&config.journal_path)?;
        let store = BackupStore::open(&config.backup_dir)?;
        let coordinator =
            EmergencyStopCoordinator::new(&config.stop_signal_path, config.grace_period())
                .with_worker_pids_file(config.worker_pids_path());
        let token = coordinator.token();

        journal.append_event(EventSeverity::Info, "session started", Some(session_id))?;
        if let Ok(mut registry) = WorkerRegistry::global().lock() {
            registry.rearm();
            // Mirror worker pids to disk so stop --escalate run from
            // another process can reach them
            registry.bind(config.worker_pids_path());
        }
        info!("Session {} started (pid {})", session_id, std::process::id());

        Ok(Self {
            journal,
            store,
            coordinator,
            token,
            stack: UndoStack::new(),
            lock,
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            next_op_id: 0,
            packages,
            services,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn journal(&self) -> &OperationJournal {
        &self.journal
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// A token observers and worker loops can poll at step boundaries
    pub fn stop_token(&self) -> StopToken {
        self.token.clone()
    }

    /// Record a tracked operation. Refused once a stop is observed.
    ///
    /// Journal append happens before the undo-stack push: the audit trail
    /// never misses an operation the stack knows about.
    pub fn record_operation(
        &mut self,
        kind: OperationKind,
        target: &str,
        inverse: InverseAction,
    ) -> Result<u64> {
        self.token.ensure_clear()?;

        let backup_ref = match &inverse {
            InverseAction::RestoreFromBackup { backup_id, .. } => Some(backup_id.clone()),
            _ => None,
        };
        self.next_op_id += 1;
        let operation = Operation {
            id: self.next_op_id,
            session_id: self.session_id.clone(),
            kind,
            target: target.to_string(),
            timestamp: Utc::now(),
            inverse,
            backup_ref,
        };

        self.journal.append(&operation)?;
        debug!("Recorded {}", operation);
        self.stack.push(operation);
        Ok(self.next_op_id)
    }

    /// Back up `rel_paths` (relative to the work root) before a destructive
    /// step; returns the backup id for the inverse descriptor.
    pub fn backup_paths<S: AsRef<str>>(&self, rel_paths: &[S]) -> Result<String> {
        let backup =
            self.store
                .create_full_backup(&self.config.work_root, rel_paths, &self.token)?;
        Ok(backup.id().to_string())
    }

    /// Create a named rollback point covering every file path touched since
    /// the session began.
    pub fn create_rollback_point(&mut self, name: &str) -> Result<RollbackPoint> {
        self.token.ensure_clear()?;

        let touched = self.stack.touched_file_paths_since(0);
        // Paths deleted by tracked operations no longer exist; their state
        // at the point is "absent" and needs no covering copy
        let existing: Vec<String> = touched
            .into_iter()
            .filter(|p| self.config.work_root.join(p).is_file())
            .collect();

        let backup_ref = if existing.is_empty() {
            None
        } else {
            Some(self.backup_paths(&existing)?)
        };

        let point = self.stack.mark_point(name, backup_ref);
        self.journal.append_event(
            EventSeverity::Info,
            format!("rollback point '{}' created at depth {}", name, point.depth),
            Some(&self.session_id),
        )?;
        info!("Rollback point '{}' ({}) created", name, point.id);
        Ok(point)
    }

    fn deadline(timeout: Option<Duration>) -> Option<Instant> {
        timeout.map(|t| Instant::now() + t)
    }

    /// Reverse up to `n` operations from the top of the undo stack.
    pub fn rollback_last(
        &mut self,
        n: usize,
        timeout: Option<Duration>,
    ) -> Result<RollbackResult> {
        let deadline = Self::deadline(timeout);
        // Engine built inline so the stack borrow stays disjoint
        let result = RollbackEngine::new(
            &self.store,
            self.packages.as_ref(),
            self.services.as_ref(),
            &self.config.work_root,
        )
        .rollback_last(&mut self.stack, n, &self.token, deadline);
        self.journal_rollback_outcome(&result)?;
        result
    }

    /// Roll back to a named point (by name or id).
    pub fn rollback_to_point(
        &mut self,
        point: &str,
        timeout: Option<Duration>,
    ) -> Result<RollbackResult> {
        let deadline = Self::deadline(timeout);
        let result = RollbackEngine::new(
            &self.store,
            self.packages.as_ref(),
            self.services.as_ref(),
            &self.config.work_root,
        )
        .rollback_to_point(&mut self.stack, point, &self.token, deadline);
        self.journal_rollback_outcome(&result)?;
        result
    }

    fn journal_rollback_outcome(&self, result: &Result<RollbackResult>) -> Result<()> {
        match result {
            Ok(r) if r.is_complete() => self.journal.append_event(
                EventSeverity::Info,
                format!("rollback complete: {} reversed", r.reversed.len()),
                Some(&self.session_id),
            ),
            Ok(r) => self.journal.append_event(
                EventSeverity::SafetyError,
                format!(
                    "rollback halted: {} reversed, {} pending",
                    r.reversed.len(),
                    r.remaining
                ),
                Some(&self.session_id),
            ),
            Err(e) => self.journal.append_event(
                EventSeverity::SafetyError,
                format!("rollback aborted: {}", e),
                Some(&self.session_id),
            ),
        }
    }

    /// Raise the machine-wide emergency stop and escalate against workers
    /// that do not exit within the grace period.
    pub fn raise_emergency_stop(&self, reason: &str) -> Result<()> {
        self.coordinator
            .raise(reason, &self.journal, Some(&self.session_id))?;
        self.coordinator.escalate();
        Ok(())
    }

    /// True once the stop signal is observed
    pub fn check_stop(&self) -> bool {
        self.token.check()
    }

    /// Explicit `Stopped → Normal` reset
    pub fn reset_stop(&self) -> Result<()> {
        self.coordinator.reset(&self.journal)
    }

    /// Register a spawned worker pid for emergency-stop escalation
    pub fn register_worker(&self, pid: u32) {
        if let Ok(mut registry) = WorkerRegistry::global().lock() {
            registry.register(pid);
        }
    }

    /// Unregister a worker that exited normally
    pub fn unregister_worker(&self, pid: u32) {
        if let Ok(mut registry) = WorkerRegistry::global().lock() {
            registry.unregister(pid);
        }
    }

    /// Refresh the lock heartbeat. Long-running callers do this on a timer.
    pub fn heartbeat(&mut self) -> Result<()> {
        self.lock.heartbeat()
    }

    /// Current session status
    pub fn status(&self) -> SessionStatus {
        let signal = self.coordinator.signal();
        SessionStatus {
            session_id: self.session_id.clone(),
            owner_pid: std::process::id(),
            started_at: self.started_at,
            undo_depth: self.stack.depth(),
            operations_recorded: self.next_op_id,
            rollback_points: self
                .stack
                .points()
                .iter()
                .map(|p| p.name.clone())
                .collect(),
            stop_raised: signal.is_some(),
            stop_reason: signal.map(|s| s.reason),
        }
    }

    /// End the session: journal the event and release the lock.
    pub fn end(mut self) -> Result<()> {
        self.journal.append_event(
            EventSeverity::Info,
            "session ended",
            Some(&self.session_id),
        )?;
        info!("Session {} ended", self.session_id);
        self.lock.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session_at(dir: &std::path::Path, id: &str) -> Result<SafetySession> {
        SafetySession::begin_with_managers(
            SafetyConfig::at(dir),
            id,
            Box::new(RecordingPackageManager::default()),
            Box::new(RecordingServiceManager::default()),
        )
    }

    #[test]
    fn test_second_session_is_busy() {
        let dir = TempDir::new().unwrap();
        let mut first = session_at(dir.path(), "s1").unwrap();
        first
            .record_operation(
                OperationKind::FileCreate,
                "f1",
                InverseAction::DeleteFile {
                    path: PathBuf::from("f1"),
                },
            )
            .unwrap();

        let err = session_at(dir.path(), "s2").unwrap_err();
        assert!(matches!(err, SafetyError::SessionBusy { .. }));
        // First session's stack untouched by the failed begin
        assert_eq!(first.status().undo_depth, 1);
    }

    #[test]
    fn test_end_releases_lock_for_next_session() {
        let dir = TempDir::new().unwrap();
        let session = session_at(dir.path(), "s1").unwrap();
        session.end().unwrap();

        let next = session_at(dir.path(), "s2").unwrap();
        assert_eq!(next.id(), "s2");
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let config = SafetyConfig::at(dir.path());
        config.ensure_directories().unwrap();

        // A lock left behind by a dead process
        let record = SessionLockRecord {
            session_id: "crashed".to_string(),
            owner_pid: 999999,
            started_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        fs::write(
            config.session_lock_path(),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        let session = session_at(dir.path(), "s1").unwrap();
        assert_eq!(session.id(), "s1");
    }

    #[test]
    fn test_operation_ids_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let mut session = session_at(dir.path(), "s1").unwrap();

        for i in 1..=3u64 {
            let id = session
                .record_operation(
                    OperationKind::FileCreate,
                    &format!("f{}", i),
                    InverseAction::DeleteFile {
                        path: PathBuf::from(format!("f{}", i)),
                    },
                )
                .unwrap();
            assert_eq!(id, i);
        }
        assert_eq!(session.status().operations_recorded, 3);
    }

    #[test]
    fn test_record_refused_after_stop() {
        let dir = TempDir::new().unwrap();
        let mut session = session_at(dir.path(), "s1").unwrap();

        session.raise_emergency_stop("operator abort").unwrap();
        assert!(session.check_stop());

        let err = session
            .record_operation(
                OperationKind::FileCreate,
                "f1",
                InverseAction::DeleteFile {
                    path: PathBuf::from("f1"),
                },
            )
            .unwrap_err();
        assert!(err.is_stop());
        assert_eq!(session.status().undo_depth, 0);

        session.reset_stop().unwrap();
        assert!(!session.check_stop());
    }

    #[test]
    fn test_status_reflects_points_and_stop() {
        let dir = TempDir::new().unwrap();
        let mut session = session_at(dir.path(), "s1").unwrap();
        session.create_rollback_point("baseline").unwrap();

        let status = session.status();
        assert_eq!(status.session_id, "s1");
        assert_eq!(status.rollback_points, vec!["baseline"]);
        assert!(!status.stop_raised);

        session.raise_emergency_stop("because").unwrap();
        let status = session.status();
        assert!(status.stop_raised);
        assert_eq!(status.stop_reason.as_deref(), Some("because"));
    }

    #[test]
    fn test_dry_run_session_uses_recording_fakes() {
        let dir = TempDir::new().unwrap();
        let mut config = SafetyConfig::at(dir.path());
        config.dry_run = true;

        let mut session = SafetySession::begin(config, "dry").unwrap();
        session
            .record_operation(
                OperationKind::PackageInstall,
                "htop",
                InverseAction::RemovePackage {
                    name: "htop".to_string(),
                },
            )
            .unwrap();

        // The inverse dispatches to the fake, not the system tool
        let result = session.rollback_last(1, None).unwrap();
        assert!(result.is_complete());
    }

    #[test]
    fn test_heartbeat_refreshes_lock() {
        let dir = TempDir::new().unwrap();
        let mut session = session_at(dir.path(), "s1").unwrap();

        let before: SessionLockRecord = serde_json::from_str(
            &fs::read_to_string(session.config.session_lock_path()).unwrap(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        session.heartbeat().unwrap();

        let after: SessionLockRecord = serde_json::from_str(
            &fs::read_to_string(session.config.session_lock_path()).unwrap(),
        )
        .unwrap();
        assert!(after.heartbeat_at > before.heartbeat_at);
    }
}
